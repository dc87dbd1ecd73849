// Calflow - Calibrated sensor derivation pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Reading types
//!
//! This module defines the two ends of the pipeline:
//! - [`RawReading`]: unscaled instrument output, as admitted by the validation boundary
//! - [`DerivedReading`]: physical values, status and secondary metrics
//!
//! Field maps are `BTreeMap`s so that serialization order is stable and two
//! derivations of the same input serialize to identical bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default sensor-type tag when the producer does not send one
pub const DEFAULT_SENSOR_TYPE: &str = "generic";

/// Default unit tag for raw values
pub const DEFAULT_UNIT: &str = "raw";

/// Kind of raw instrument field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Fill level, percent of capacity once calibrated
    Level,
    /// Temperature
    Temperature,
    /// Pressure
    Pressure,
    /// Flow rate (outflow), volume units per hour once calibrated
    Flow,
}

impl FieldKind {
    /// All known field kinds, in schema order
    pub const ALL: [FieldKind; 4] = [
        FieldKind::Level,
        FieldKind::Temperature,
        FieldKind::Pressure,
        FieldKind::Flow,
    ];

    /// Schema name of the field
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Level => "level",
            FieldKind::Temperature => "temperature",
            FieldKind::Pressure => "pressure",
            FieldKind::Flow => "flow",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Producers commonly suffix raw fields, e.g. "levelRaw" / "level_raw"
        let name = s
            .strip_suffix("Raw")
            .or_else(|| s.strip_suffix("_raw"))
            .unwrap_or(s);
        match name.to_ascii_lowercase().as_str() {
            "level" => Ok(FieldKind::Level),
            "temperature" | "temp" => Ok(FieldKind::Temperature),
            "pressure" => Ok(FieldKind::Pressure),
            "flow" | "flowrate" | "flow_rate" => Ok(FieldKind::Flow),
            _ => Err(ValidationError::UnknownField(s.to_string())),
        }
    }
}

/// One raw instrument sample
///
/// Built either programmatically (then checked with [`RawReading::validate`])
/// or through [`crate::payload`], which converts untyped JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawReading {
    /// Device identifier, matches a calibration record
    pub device_id: String,
    /// Sensor-type tag (e.g. "ultrasonic")
    pub sensor_type: String,
    /// Unit tag of the raw values
    pub unit: String,
    /// Capture timestamp in milliseconds, producer-assigned
    pub timestamp: u64,
    /// Raw numeric values per field
    pub fields: BTreeMap<FieldKind, f64>,
}

impl RawReading {
    /// Create a reading with no fields and default tags
    pub fn new(device_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            device_id: device_id.into(),
            sensor_type: DEFAULT_SENSOR_TYPE.to_string(),
            unit: DEFAULT_UNIT.to_string(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Add (or replace) a raw field
    pub fn with_field(mut self, kind: FieldKind, value: f64) -> Self {
        self.fields.insert(kind, value);
        self
    }

    /// Set the sensor-type tag
    pub fn with_sensor_type(mut self, sensor_type: impl Into<String>) -> Self {
        self.sensor_type = sensor_type.into();
        self
    }

    /// Set the unit tag
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Raw value of a field, if present
    pub fn field(&self, kind: FieldKind) -> Option<f64> {
        self.fields.get(&kind).copied()
    }

    /// Check the shape of the reading
    ///
    /// A reading must name a device, carry at least one field, and every
    /// field must be a finite number.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::EmptyDeviceId);
        }
        if self.fields.is_empty() {
            return Err(ValidationError::NoFields);
        }
        for (kind, value) in &self.fields {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite(kind.to_string()));
            }
        }
        Ok(())
    }
}

/// A calibrated value for one field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalValue {
    /// Value in physical units
    pub value: f64,
    /// True when the raw value fell outside the calibrated range
    pub clamped: bool,
}

/// Status classification derived from the level thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Below the critical threshold
    Critical,
    /// Between critical (inclusive) and low (exclusive)
    Low,
    /// At or above the low threshold
    Normal,
    /// No level field or no thresholds configured
    #[default]
    Unclassified,
}

impl Status {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Critical => "critical",
            Status::Low => "low",
            Status::Normal => "normal",
            Status::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics computed from the physical values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SecondaryMetrics {
    /// Volume left, in capacity units
    pub remaining_volume: Option<f64>,
    /// Hours until empty at the current outflow; `None` when not draining
    pub hours_to_empty: Option<f64>,
}

/// Output of calibration and business rules for one raw reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedReading {
    /// Device identifier
    pub device_id: String,
    /// Sensor-type tag copied from the raw reading
    pub sensor_type: String,
    /// Unit tag copied from the raw reading
    pub unit: String,
    /// Category (liquid) tag from the calibration record
    pub category: Option<String>,
    /// Physical value per raw field
    pub values: BTreeMap<FieldKind, PhysicalValue>,
    /// Status classification
    pub status: Status,
    /// Secondary metrics
    pub metrics: SecondaryMetrics,
    /// True if any field was clamped
    pub clamped: bool,
    /// Capture timestamp copied from the raw reading (ms)
    pub captured_at: u64,
    /// Processing timestamp (ms since epoch)
    pub processed_at: u64,
    /// Revision of the calibration record used
    pub calibration_revision: u64,
    /// Fingerprint of the calibration record used
    pub calibration_fingerprint: u64,
}

impl DerivedReading {
    /// Physical value of a field, if present
    pub fn value(&self, kind: FieldKind) -> Option<f64> {
        self.values.get(&kind).map(|v| v.value)
    }

    /// Physical level, if the reading carries one
    pub fn level(&self) -> Option<f64> {
        self.value(FieldKind::Level)
    }
}
