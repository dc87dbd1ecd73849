// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Calflow Ingest

use std::fmt;
use std::time::Duration;

use calflow::{CalflowError, ValidationError};
use thiserror::Error;

/// Main error type for ingestion operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    /// Reading or calibration rejected by the core pipeline
    #[error(transparent)]
    Pipeline(#[from] CalflowError),

    /// Device queue full under the drop-newest policy
    #[error("Queue full for device: {device_id}")]
    QueueFull { device_id: String },

    /// Maximum number of device lanes reached
    #[error("Maximum devices ({max}) reached")]
    MaxDevicesReached { max: usize },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Coordinator created outside a Tokio runtime
    #[error("No Tokio runtime available")]
    NoRuntime,

    /// Coordinator has been shut down
    #[error("Coordinator is shut down")]
    Closed,
}

impl From<ValidationError> for IngestError {
    fn from(e: ValidationError) -> Self {
        IngestError::Pipeline(e.into())
    }
}

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error returned by a single sink call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Sink refused the reading
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Backing service is unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Call did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}

/// Which sink a delivery failure concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    /// Durable time-series storage
    Persistence,
    /// Live dashboard push
    LiveUpdate,
}

impl SinkKind {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Persistence => "persistence",
            SinkKind::LiveUpdate => "live_update",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sink exhausted its retries for one reading
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Delivery to {sink} sink failed after {attempts} attempt(s): {last_error}")]
pub struct SinkDeliveryError {
    /// Sink that failed
    pub sink: SinkKind,
    /// Number of calls made, including the first
    pub attempts: u32,
    /// Error from the final call
    pub last_error: SinkError,
}
