// Calflow - Calibrated sensor derivation pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Calibration records
//!
//! A [`CalibrationRecord`] holds everything needed to turn one device's raw
//! readings into physical values: a linear mapping per field, an optional
//! tank capacity, optional classification thresholds and a category tag.
//!
//! Records are plain data. They are validated here, applied by
//! [`crate::derive`], and shared through [`crate::store::CalibrationStore`].
//!
//! # File format
//!
//! Calibration files are JSON, either a bare array of records or
//! `{"records": [...]}`:
//!
//! ```json
//! {"records": [{
//!     "device_id": "tank-01",
//!     "revision": 3,
//!     "mappings": {"level": {"raw_min": 0, "raw_max": 1023, "phys_min": 0, "phys_max": 100}},
//!     "capacity": 5000,
//!     "thresholds": {"critical": 15, "low": 30},
//!     "category": "diesel"
//! }]}
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::error::{CalflowError, CalibrationError};
use crate::reading::FieldKind;

/// Linear mapping from a raw domain to a physical domain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearMapping {
    /// Lower bound of the raw domain
    pub raw_min: f64,
    /// Upper bound of the raw domain
    pub raw_max: f64,
    /// Physical value at `raw_min`
    pub phys_min: f64,
    /// Physical value at `raw_max`
    pub phys_max: f64,
    /// Shift applied in the physical domain
    #[serde(default)]
    pub offset: f64,
}

impl LinearMapping {
    /// Create a mapping with no offset
    pub fn new(raw_min: f64, raw_max: f64, phys_min: f64, phys_max: f64) -> Self {
        Self {
            raw_min,
            raw_max,
            phys_min,
            phys_max,
            offset: 0.0,
        }
    }

    /// Set the physical-domain offset
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Check the mapping invariants for the given field
    pub fn validate(&self, field: FieldKind) -> Result<(), CalibrationError> {
        if !self.raw_min.is_finite() || !self.raw_max.is_finite() {
            return Err(CalibrationError::NonFinite("raw range"));
        }
        if !self.phys_min.is_finite() || !self.phys_max.is_finite() {
            return Err(CalibrationError::NonFinite("physical range"));
        }
        if !self.offset.is_finite() {
            return Err(CalibrationError::NonFinite("offset"));
        }
        if self.raw_max == self.raw_min {
            return Err(CalibrationError::DegenerateMapping {
                field,
                value: self.raw_min,
            });
        }
        if self.raw_min > self.raw_max {
            return Err(CalibrationError::InvalidRange {
                field,
                domain: "raw",
                min: self.raw_min,
                max: self.raw_max,
            });
        }
        if self.phys_min >= self.phys_max {
            return Err(CalibrationError::InvalidRange {
                field,
                domain: "physical",
                min: self.phys_min,
                max: self.phys_max,
            });
        }
        Ok(())
    }
}

/// Ordered classification boundaries for the level field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Below this level the status is critical
    pub critical: f64,
    /// Below this level (and at or above critical) the status is low
    pub low: f64,
}

impl Thresholds {
    /// Create thresholds
    pub fn new(critical: f64, low: f64) -> Self {
        Self { critical, low }
    }

    /// Check that both boundaries are finite and strictly ordered
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !self.critical.is_finite() || !self.low.is_finite() {
            return Err(CalibrationError::NonFinite("thresholds"));
        }
        if self.critical >= self.low {
            return Err(CalibrationError::UnorderedThresholds {
                critical: self.critical,
                low: self.low,
            });
        }
        Ok(())
    }
}

/// Calibration and configuration for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Device identifier, matches `RawReading::device_id`
    ///
    /// Empty when omitted from JSON; the store refuses empty identifiers.
    #[serde(default)]
    pub device_id: String,
    /// Revision assigned by configuration management
    #[serde(default)]
    pub revision: u64,
    /// Linear mapping per raw field
    #[serde(default)]
    pub mappings: BTreeMap<FieldKind, LinearMapping>,
    /// Tank capacity, in volume units
    #[serde(default)]
    pub capacity: Option<f64>,
    /// Level classification thresholds
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
    /// Liquid or category tag
    #[serde(default)]
    pub category: Option<String>,
}

impl CalibrationRecord {
    /// Create an empty record for a device
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            revision: 0,
            mappings: BTreeMap::new(),
            capacity: None,
            thresholds: None,
            category: None,
        }
    }

    /// Add (or replace) the mapping for a field
    pub fn with_mapping(mut self, field: FieldKind, mapping: LinearMapping) -> Self {
        self.mappings.insert(field, mapping);
        self
    }

    /// Set the capacity
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the classification thresholds
    pub fn with_thresholds(mut self, critical: f64, low: f64) -> Self {
        self.thresholds = Some(Thresholds::new(critical, low));
        self
    }

    /// Set the category tag
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the revision
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Mapping for a field, if configured
    pub fn mapping(&self, field: FieldKind) -> Option<&LinearMapping> {
        self.mappings.get(&field)
    }

    /// Check every invariant of the record
    pub fn validate(&self) -> Result<(), CalibrationError> {
        for (field, mapping) in &self.mappings {
            mapping.validate(*field)?;
        }
        if let Some(capacity) = self.capacity {
            if !capacity.is_finite() {
                return Err(CalibrationError::NonFinite("capacity"));
            }
            if capacity < 0.0 {
                return Err(CalibrationError::NegativeCapacity(capacity));
            }
        }
        if let Some(thresholds) = &self.thresholds {
            thresholds.validate()?;
        }
        Ok(())
    }

    /// Stable 64-bit fingerprint of the record contents
    ///
    /// Two records with identical contents always share a fingerprint, so a
    /// derived reading can be traced back to the exact calibration it used.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        hasher.update(self.device_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.revision.to_le_bytes());
        for (field, m) in &self.mappings {
            hasher.update(field.as_str().as_bytes());
            for v in [m.raw_min, m.raw_max, m.phys_min, m.phys_max, m.offset] {
                hasher.update(&v.to_bits().to_le_bytes());
            }
        }
        match self.capacity {
            Some(c) => {
                hasher.update(&[1]);
                hasher.update(&c.to_bits().to_le_bytes());
            }
            None => hasher.update(&[0]),
        }
        match &self.thresholds {
            Some(t) => {
                hasher.update(&[1]);
                hasher.update(&t.critical.to_bits().to_le_bytes());
                hasher.update(&t.low.to_bits().to_le_bytes());
            }
            None => hasher.update(&[0]),
        }
        if let Some(category) = &self.category {
            hasher.update(category.as_bytes());
        }
        hasher.digest()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CalibrationFile {
    Wrapped { records: Vec<CalibrationRecord> },
    Bare(Vec<CalibrationRecord>),
}

/// Parse calibration records from JSON text
pub fn parse_records(json: &str) -> Result<Vec<CalibrationRecord>, CalflowError> {
    let file: CalibrationFile =
        serde_json::from_str(json).map_err(|e| CalflowError::CalibrationFile(e.to_string()))?;
    Ok(match file {
        CalibrationFile::Wrapped { records } => records,
        CalibrationFile::Bare(records) => records,
    })
}

/// Load calibration records from a JSON file
pub fn load_records(path: &Path) -> Result<Vec<CalibrationRecord>, CalflowError> {
    let text = fs::read_to_string(path).map_err(|e| {
        CalflowError::CalibrationFile(format!("Failed to read '{}': {}", path.display(), e))
    })?;
    parse_records(&text)
}

/// Write calibration records to a JSON file
pub fn save_records(path: &Path, records: &[CalibrationRecord]) -> Result<(), CalflowError> {
    #[derive(Serialize)]
    struct Wrapped<'a> {
        records: &'a [CalibrationRecord],
    }

    let json = serde_json::to_string_pretty(&Wrapped { records })
        .map_err(|e| CalflowError::CalibrationFile(e.to_string()))?;
    fs::write(path, json).map_err(|e| {
        CalflowError::CalibrationFile(format!("Failed to write '{}': {}", path.display(), e))
    })
}
