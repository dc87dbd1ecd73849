// Calflow Service - Calibration file hot-reload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Calibration file watcher.
//!
//! Polls the file's modification time and size; on change the whole file
//! is parsed and swapped into the store in one step. A file that fails to
//! parse leaves the active snapshot in place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use calflow::calibration::parse_records;
use calflow::{CalflowError, CalibrationStore};
use tracing::{error, info};

/// File identity used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Polling watcher for one calibration file.
#[derive(Debug)]
pub struct CalibrationWatcher {
    path: PathBuf,
    store: Arc<CalibrationStore>,
    last_seen: Option<Stamp>,
}

impl CalibrationWatcher {
    /// Create a watcher; the first [`check`](Self::check) always loads.
    pub fn new(path: impl Into<PathBuf>, store: Arc<CalibrationStore>) -> Self {
        Self {
            path: path.into(),
            store,
            last_seen: None,
        }
    }

    /// Reload the file if it changed since the last check.
    ///
    /// Returns the new snapshot version when a reload happened.
    pub async fn check(&mut self) -> Result<Option<u64>, CalflowError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| CalflowError::CalibrationFile(format!("{}: {}", self.path.display(), e)))?;
        let stamp = Stamp {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        };
        if self.last_seen == Some(stamp) {
            return Ok(None);
        }
        // A failed parse is retried on the next change only
        self.last_seen = Some(stamp);

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CalflowError::CalibrationFile(format!("{}: {}", self.path.display(), e)))?;
        let records = parse_records(&content)?;
        let count = records.len();
        let version = self.store.replace_all(records)?;

        info!(
            path = %self.path.display(),
            records = count,
            version,
            "calibration file loaded"
        );
        Ok(Some(version))
    }

    /// Poll forever at `interval`.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.check().await {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "calibration reload failed, keeping previous calibration"
                );
            }
        }
    }
}
