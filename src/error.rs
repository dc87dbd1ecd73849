//! Error types for Calflow
//!
//! This module defines the error taxonomy shared by the validation boundary,
//! the calibration store and the derivation engine.

use thiserror::Error;

use crate::reading::FieldKind;

/// Result type alias for Calflow operations
pub type Result<T> = std::result::Result<T, CalflowError>;

/// Main error type for Calflow operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalflowError {
    /// Malformed or incomplete raw reading
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// No calibration record for the device
    #[error("No calibration for device '{device_id}'")]
    CalibrationMissing { device_id: String },

    /// Calibration record cannot be applied
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Calibration file could not be read or parsed
    #[error("Calibration file error: {0}")]
    CalibrationFile(String),
}

impl CalflowError {
    /// Short machine-friendly label, used for counters and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CalibrationMissing { .. } => "calibration_missing",
            Self::Calibration(_) => "calibration",
            Self::CalibrationFile(_) => "calibration_file",
        }
    }
}

/// Errors raised while converting an untyped payload into a `RawReading`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Payload is not valid JSON
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Payload is valid JSON but not an object
    #[error("Payload must be a JSON object")]
    NotAnObject,

    /// Required attribute absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Device identifier present but empty
    #[error("Device identifier is empty")]
    EmptyDeviceId,

    /// Attribute present with the wrong JSON type
    #[error("Field '{field}' must be {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },

    /// Raw value is NaN or infinite
    #[error("Field '{0}' is not a finite number")]
    NonFinite(String),

    /// Raw field name outside the declared schema
    #[error("Unknown raw field: {0}")]
    UnknownField(String),

    /// Reading carries no raw fields at all
    #[error("Reading has no raw fields")]
    NoFields,
}

/// Errors raised when a calibration record cannot be applied
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Zero-width raw range
    #[error("Degenerate mapping for '{field}': raw_min == raw_max ({value})")]
    DegenerateMapping { field: FieldKind, value: f64 },

    /// Range whose min is not strictly below its max
    #[error("Invalid {domain} range for '{field}': min {min} must be below max {max}")]
    InvalidRange {
        field: FieldKind,
        domain: &'static str,
        min: f64,
        max: f64,
    },

    /// Classification thresholds out of order
    #[error("Thresholds not strictly ordered: critical {critical} >= low {low}")]
    UnorderedThresholds { critical: f64, low: f64 },

    /// Parameter is NaN or infinite
    #[error("Non-finite calibration parameter: {0}")]
    NonFinite(&'static str),

    /// Capacity below zero
    #[error("Capacity must not be negative: {0}")]
    NegativeCapacity(f64),

    /// Raw field has no mapping in the record
    #[error("No mapping for raw field '{0}'")]
    UnmappedField(FieldKind),

    /// Record belongs to another device
    #[error("Record is for device '{expected}', reading is from '{actual}'")]
    DeviceMismatch { expected: String, actual: String },
}
