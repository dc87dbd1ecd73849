// Calflow Service - Raw reading replay engine
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Replay of recorded raw readings.
//!
//! A CSV capture is fed through the coordinator at a speed multiplier, as
//! if the devices were sending it live. Expected header:
//!
//! ```text
//! timestamp_ms,device_id,sensor_type,unit,level,temperature,pressure,flow
//! ```
//!
//! `sensor_type`, `unit` and every field column may be empty; rows need at
//! least one field.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use calflow::{FieldKind, RawReading};
use calflow_ingest::Coordinator;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics::update_replay_metrics;

/// Configuration for replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to CSV capture.
    pub csv_path: String,
    /// Replay speed multiplier (1.0 = real-time, 10.0 = 10x faster).
    pub speed: f64,
    /// Whether to loop the capture.
    pub loop_replay: bool,
    /// Gap inserted after the last row before looping (ms).
    pub default_sample_interval_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            csv_path: String::new(),
            speed: 1.0,
            loop_replay: false,
            default_sample_interval_ms: 60_000,
        }
    }
}

/// State of the replay engine.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// Current position in the capture (row index).
    pub position: AtomicUsize,
    /// Total rows in the capture.
    pub total_rows: AtomicUsize,
    /// Completed passes over the capture.
    pub loops: AtomicUsize,
    /// Whether replay is running.
    pub running: AtomicBool,
}

/// One CSV row.
#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp_ms: u64,
    device_id: String,
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    level: Option<f64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    pressure: Option<f64>,
    #[serde(default)]
    flow: Option<f64>,
}

impl CsvRow {
    fn into_reading(self) -> RawReading {
        let mut reading = RawReading::new(self.device_id, self.timestamp_ms);
        if let Some(sensor_type) = self.sensor_type.filter(|s| !s.trim().is_empty()) {
            reading = reading.with_sensor_type(sensor_type);
        }
        if let Some(unit) = self.unit.filter(|s| !s.trim().is_empty()) {
            reading = reading.with_unit(unit);
        }
        let fields = [
            (FieldKind::Level, self.level),
            (FieldKind::Temperature, self.temperature),
            (FieldKind::Pressure, self.pressure),
            (FieldKind::Flow, self.flow),
        ];
        for (kind, value) in fields {
            if let Some(v) = value {
                reading = reading.with_field(kind, v);
            }
        }
        reading
    }
}

/// Replay engine feeding a capture through the coordinator.
pub struct ReplayEngine {
    config: ReplayConfig,
    state: Arc<ReplayState>,
    rows: Vec<RawReading>,
}

impl ReplayEngine {
    /// Create a replay engine from a CSV file.
    pub fn from_csv(config: ReplayConfig) -> Result<Self, ReplayError> {
        let path = Path::new(&config.csv_path);
        if !path.exists() {
            return Err(ReplayError::FileNotFound(config.csv_path.clone()));
        }
        if !(config.speed.is_finite() && config.speed > 0.0) {
            return Err(ReplayError::InvalidSpeed(config.speed));
        }

        let rows = Self::parse_csv(path)?;
        if rows.is_empty() {
            return Err(ReplayError::EmptyDataset);
        }

        let state = Arc::new(ReplayState::default());
        state.total_rows.store(rows.len(), Ordering::SeqCst);

        Ok(Self {
            config,
            state,
            rows,
        })
    }

    /// Parse a CSV capture into raw readings.
    fn parse_csv(path: &Path) -> Result<Vec<RawReading>, ReplayError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let headers = reader.headers()?.clone();
        if headers.get(0) != Some("timestamp_ms") {
            return Err(ReplayError::InvalidFormat(
                "First column must be 'timestamp_ms'".to_string(),
            ));
        }

        let mut rows = Vec::new();
        for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
            let reading = result?.into_reading();
            // Line 1 is the header
            reading
                .validate()
                .map_err(|e| ReplayError::InvalidRow(index + 2, e.to_string()))?;
            rows.push(reading);
        }

        Ok(rows)
    }

    /// Get the replay state.
    pub fn state(&self) -> Arc<ReplayState> {
        Arc::clone(&self.state)
    }

    /// Run the replay until the capture ends (or forever when looping).
    pub async fn run(&self, coordinator: Coordinator) {
        self.state.running.store(true, Ordering::SeqCst);
        info!(
            speed = self.config.speed,
            loop_replay = self.config.loop_replay,
            rows = self.rows.len(),
            "starting replay"
        );

        let span_ms = self.info().duration_ms + self.config.default_sample_interval_ms;
        let mut offset_ms = 0u64;

        loop {
            if !self.state.running.load(Ordering::SeqCst) || coordinator.is_closed() {
                break;
            }

            let position = self.state.position.load(Ordering::SeqCst);
            if position >= self.rows.len() {
                if self.config.loop_replay {
                    info!("capture complete, looping");
                    self.state.position.store(0, Ordering::SeqCst);
                    self.state.loops.fetch_add(1, Ordering::SeqCst);
                    offset_ms += span_ms;
                    continue;
                } else {
                    info!("capture complete, stopping");
                    break;
                }
            }

            let row = &self.rows[position];
            let mut reading = row.clone();
            // Later passes keep per-device timestamps increasing
            reading.timestamp += offset_ms;

            let admission = coordinator.ingest(reading);
            if !admission.is_accepted() {
                warn!(device_id = %row.device_id, position, ?admission, "replayed row not accepted");
            } else {
                debug!(device_id = %row.device_id, position, "replayed row");
            }

            self.state.position.fetch_add(1, Ordering::SeqCst);
            update_replay_metrics(position + 1, self.rows.len(), self.config.speed);

            let gap_ms = match self.rows.get(position + 1) {
                Some(next) => next.timestamp.saturating_sub(row.timestamp),
                None if self.config.loop_replay => self.config.default_sample_interval_ms,
                None => 0,
            };
            let sleep_ms = (gap_ms as f64 / self.config.speed) as u64;
            if sleep_ms > 0 {
                sleep(Duration::from_millis(sleep_ms)).await;
            }
        }

        self.state.running.store(false, Ordering::SeqCst);
    }

    /// Stop the replay.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
    }

    /// Get capture info.
    pub fn info(&self) -> DatasetInfo {
        let duration_ms = match (self.rows.first(), self.rows.last()) {
            (Some(first), Some(last)) => last.timestamp.saturating_sub(first.timestamp),
            _ => 0,
        };
        let device_ids: BTreeSet<&str> = self.rows.iter().map(|r| r.device_id.as_str()).collect();

        DatasetInfo {
            device_count: device_ids.len(),
            row_count: self.rows.len(),
            duration_ms,
            device_ids: device_ids.into_iter().map(str::to_string).collect(),
        }
    }
}

/// Capture information.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatasetInfo {
    pub device_count: usize,
    pub row_count: usize,
    pub duration_ms: u64,
    pub device_ids: Vec<String>,
}

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid row at line {0}: {1}")]
    InvalidRow(usize, String),

    #[error("Speed must be a positive number, got {0}")]
    InvalidSpeed(f64),

    #[error("Empty dataset")]
    EmptyDataset,
}
