// Calflow - Calibrated sensor derivation pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Derivation engine
//!
//! Pure transformation of a [`RawReading`] and a [`CalibrationRecord`] into
//! a [`DerivedReading`]. Nothing here performs I/O or blocks.
//!
//! Steps, in order:
//! 1. Each raw field goes through its linear mapping, clamped to the
//!    physical range.
//! 2. The physical level is classified against the thresholds.
//! 3. Secondary metrics are computed from the physical values.
//!
//! [`derive_at`] is deterministic: identical inputs serialize to identical
//! bytes. [`derive`] only differs by stamping the current time.

use std::collections::BTreeMap;

use crate::calibration::{CalibrationRecord, LinearMapping, Thresholds};
use crate::error::{CalibrationError, Result};
use crate::reading::{
    DerivedReading, FieldKind, PhysicalValue, RawReading, SecondaryMetrics, Status,
};

/// Derive a reading, stamping the current time as processing time
pub fn derive(raw: &RawReading, cal: &CalibrationRecord) -> Result<DerivedReading> {
    derive_at(raw, cal, now_millis())
}

/// Derive a reading with an explicit processing timestamp
pub fn derive_at(
    raw: &RawReading,
    cal: &CalibrationRecord,
    processed_at: u64,
) -> Result<DerivedReading> {
    raw.validate()?;
    if cal.device_id != raw.device_id {
        return Err(CalibrationError::DeviceMismatch {
            expected: cal.device_id.clone(),
            actual: raw.device_id.clone(),
        }
        .into());
    }

    let mut values = BTreeMap::new();
    for (field, raw_value) in &raw.fields {
        let mapping = cal
            .mapping(*field)
            .ok_or(CalibrationError::UnmappedField(*field))?;
        let physical = apply_mapping(*field, mapping, *raw_value)?;
        if physical.clamped {
            log_debug!(
                "device '{}': {} raw value {} outside [{}, {}], clamped to {}",
                raw.device_id,
                field,
                raw_value,
                mapping.raw_min,
                mapping.raw_max,
                physical.value
            );
        }
        values.insert(*field, physical);
    }

    let level = values.get(&FieldKind::Level).map(|v| v.value);
    let flow = values.get(&FieldKind::Flow).map(|v| v.value);

    let status = match (level, &cal.thresholds) {
        (Some(level), Some(thresholds)) => {
            thresholds.validate()?;
            classify(level, thresholds)
        }
        _ => Status::Unclassified,
    };

    let capacity = match cal.capacity {
        Some(c) if !c.is_finite() => return Err(CalibrationError::NonFinite("capacity").into()),
        Some(c) if c < 0.0 => return Err(CalibrationError::NegativeCapacity(c).into()),
        other => other,
    };
    let metrics = secondary_metrics(level, flow, capacity);

    let clamped = values.values().any(|v| v.clamped);

    Ok(DerivedReading {
        device_id: raw.device_id.clone(),
        sensor_type: raw.sensor_type.clone(),
        unit: raw.unit.clone(),
        category: cal.category.clone(),
        values,
        status,
        metrics,
        clamped,
        captured_at: raw.timestamp,
        processed_at,
        calibration_revision: cal.revision,
        calibration_fingerprint: cal.fingerprint(),
    })
}

/// Map one raw value into the physical domain
///
/// The raw value is clamped into `[raw_min, raw_max]` before mapping and the
/// result (offset included) is clamped into `[phys_min, phys_max]`. Either
/// clamp sets `clamped`. A zero-width raw range is an error, never a
/// division by zero.
pub fn apply_mapping(
    field: FieldKind,
    mapping: &LinearMapping,
    raw: f64,
) -> std::result::Result<PhysicalValue, CalibrationError> {
    mapping.validate(field)?;

    let bounded_raw = raw.clamp(mapping.raw_min, mapping.raw_max);
    let ratio = (bounded_raw - mapping.raw_min) / (mapping.raw_max - mapping.raw_min);
    let physical =
        ratio * (mapping.phys_max - mapping.phys_min) + mapping.phys_min + mapping.offset;
    let value = physical.clamp(mapping.phys_min, mapping.phys_max);

    Ok(PhysicalValue {
        value,
        clamped: bounded_raw != raw || value != physical,
    })
}

/// Classify a physical level
///
/// Boundary values belong to the higher band: `level == critical` is low,
/// `level == low` is normal.
pub fn classify(level: f64, thresholds: &Thresholds) -> Status {
    if level < thresholds.critical {
        Status::Critical
    } else if level < thresholds.low {
        Status::Low
    } else {
        Status::Normal
    }
}

/// Compute secondary metrics from primary physical values
///
/// `remaining_volume = level / 100 * capacity`; `hours_to_empty` is only
/// defined while the tank drains (`flow > 0`).
pub fn secondary_metrics(
    level: Option<f64>,
    flow: Option<f64>,
    capacity: Option<f64>,
) -> SecondaryMetrics {
    let remaining_volume = match (level, capacity) {
        (Some(level), Some(capacity)) => Some(level / 100.0 * capacity),
        _ => None,
    };
    let hours_to_empty = match (remaining_volume, flow) {
        (Some(remaining), Some(flow)) if flow > 0.0 => Some(remaining / flow),
        _ => None,
    };
    SecondaryMetrics {
        remaining_volume,
        hours_to_empty,
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
