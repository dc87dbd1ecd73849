// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Calflow Ingest

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use calflow::CalibrationRecord;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::retry::RetryStrategy;

/// What to do when a device queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued reading to make room
    #[default]
    DropOldest,
    /// Refuse the incoming reading
    DropNewest,
}

impl OverflowPolicy {
    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop-oldest",
            OverflowPolicy::DropNewest => "drop-newest",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop-oldest" | "oldest" => Ok(OverflowPolicy::DropOldest),
            "drop-newest" | "newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!(
                "unknown overflow policy '{}' (expected drop-oldest or drop-newest)",
                other
            )),
        }
    }
}

/// What to do with a reading whose device has no calibration record
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MissingCalibrationPolicy {
    /// Drop the reading and log it
    #[default]
    Drop,
    /// Derive with this record instead (its device id is replaced)
    Fallback(CalibrationRecord),
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Capacity of each per-device queue (default: 64)
    pub queue_capacity: usize,

    /// Behavior when a device queue is full
    pub overflow_policy: OverflowPolicy,

    /// Derived readings kept per device and sink while that sink is busy
    /// (default: 256); the oldest is dropped when full
    pub sink_backlog: usize,

    /// Time limit for one sink call (default: 2 s)
    pub sink_timeout: Duration,

    /// Retry strategy applied to each sink independently
    pub retry: RetryStrategy,

    /// Behavior for devices without a calibration record
    pub missing_calibration: MissingCalibrationPolicy,

    /// Hand the raw reading to the persistence sink as well
    pub persist_raw: bool,

    /// Maximum number of device lanes (default: 4096)
    pub max_devices: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            overflow_policy: OverflowPolicy::DropOldest,
            sink_backlog: 256,
            sink_timeout: Duration::from_secs(2),
            retry: RetryStrategy::exponential(3, Duration::from_millis(50)),
            missing_calibration: MissingCalibrationPolicy::Drop,
            persist_raw: false,
            max_devices: 4096,
        }
    }
}

impl IngestConfig {
    /// Create a configuration with a custom queue capacity
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..Default::default()
        }
    }

    /// Create a configuration with a custom sink timeout
    pub fn with_sink_timeout(sink_timeout: Duration) -> Self {
        Self {
            sink_timeout,
            ..Default::default()
        }
    }

    /// Create a configuration with a custom retry strategy
    pub fn with_retry(retry: RetryStrategy) -> Self {
        Self {
            retry,
            ..Default::default()
        }
    }

    /// Create a configuration that derives unknown devices with `record`
    pub fn with_fallback(record: CalibrationRecord) -> Self {
        Self {
            missing_calibration: MissingCalibrationPolicy::Fallback(record),
            ..Default::default()
        }
    }

    /// Check the configuration before starting a coordinator
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(IngestError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.sink_backlog == 0 {
            return Err(IngestError::InvalidConfig(
                "sink_backlog must be at least 1".to_string(),
            ));
        }
        if self.max_devices == 0 {
            return Err(IngestError::InvalidConfig(
                "max_devices must be at least 1".to_string(),
            ));
        }
        if self.sink_timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "sink_timeout must be non-zero".to_string(),
            ));
        }
        if let MissingCalibrationPolicy::Fallback(record) = &self.missing_calibration {
            record.validate().map_err(|e| {
                IngestError::InvalidConfig(format!("fallback calibration is invalid: {}", e))
            })?;
        }
        Ok(())
    }
}
