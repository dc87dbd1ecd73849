// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Outbound sinks
//!
//! The coordinator hands every derived reading to a [`PersistenceSink`]
//! and a [`LiveUpdateSink`]. Both receive the same value. Adapters here
//! cover tests, local files and in-process fan-out.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use calflow::{DerivedReading, RawReading};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::error::SinkError;

/// Durable storage for derived readings
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Store one reading; `raw` is supplied when raw preservation is on
    async fn store(
        &self,
        reading: &DerivedReading,
        raw: Option<&RawReading>,
    ) -> Result<(), SinkError>;
}

/// Best-effort push to live consumers
#[async_trait]
pub trait LiveUpdateSink: Send + Sync {
    /// Publish one reading
    async fn publish(&self, reading: &DerivedReading) -> Result<(), SinkError>;
}

/// One persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReading {
    /// Derived reading
    pub reading: DerivedReading,
    /// Raw input, when preserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl StoredReading {
    fn new(reading: &DerivedReading, raw: Option<&RawReading>) -> Result<Self, SinkError> {
        let raw = raw
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        Ok(Self {
            reading: reading.clone(),
            raw,
        })
    }
}

// ============================================================================
// MemorySink
// ============================================================================

/// In-memory sink, usable as either sink kind
///
/// Keeps every entry unless a retention limit is set, in which case the
/// oldest entries are evicted first.
#[derive(Debug, Default)]
pub struct MemorySink {
    stored: Mutex<VecDeque<StoredReading>>,
    published: Mutex<VecDeque<DerivedReading>>,
    retention: Option<usize>,
}

impl MemorySink {
    /// Create an unbounded sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink keeping at most `retention` entries of each kind
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: Some(retention.max(1)),
            ..Default::default()
        }
    }

    /// Entries received through [`PersistenceSink::store`]
    pub fn stored(&self) -> Vec<StoredReading> {
        let guard = self.stored.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().cloned().collect()
    }

    /// Readings received through [`LiveUpdateSink::publish`]
    pub fn published(&self) -> Vec<DerivedReading> {
        let guard = self.published.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().cloned().collect()
    }

    /// Stored readings for one device, in arrival order
    pub fn stored_for(&self, device_id: &str) -> Vec<DerivedReading> {
        let guard = self.stored.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .iter()
            .filter(|s| s.reading.device_id == device_id)
            .map(|s| s.reading.clone())
            .collect()
    }

    /// Published readings for one device, in arrival order
    pub fn published_for(&self, device_id: &str) -> Vec<DerivedReading> {
        let guard = self.published.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    fn push<T>(&self, queue: &Mutex<VecDeque<T>>, item: T) {
        let mut guard = queue.lock().unwrap_or_else(|e| e.into_inner());
        guard.push_back(item);
        if let Some(limit) = self.retention {
            while guard.len() > limit {
                guard.pop_front();
            }
        }
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn store(
        &self,
        reading: &DerivedReading,
        raw: Option<&RawReading>,
    ) -> Result<(), SinkError> {
        let entry = StoredReading::new(reading, raw)?;
        self.push(&self.stored, entry);
        Ok(())
    }
}

#[async_trait]
impl LiveUpdateSink for MemorySink {
    async fn publish(&self, reading: &DerivedReading) -> Result<(), SinkError> {
        self.push(&self.published, reading.clone());
        Ok(())
    }
}

// ============================================================================
// BroadcastSink
// ============================================================================

/// Live-update sink backed by a Tokio broadcast channel
///
/// Having no subscribers is not an error; slow subscribers lag and skip.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<DerivedReading>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` readings per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to derived readings
    pub fn subscribe(&self) -> broadcast::Receiver<DerivedReading> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl LiveUpdateSink for BroadcastSink {
    async fn publish(&self, reading: &DerivedReading) -> Result<(), SinkError> {
        // Err only means nobody is listening
        let _ = self.sender.send(reading.clone());
        Ok(())
    }
}

// ============================================================================
// JsonLinesSink
// ============================================================================

/// Persistence sink appending one JSON document per line to a file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceSink for JsonLinesSink {
    async fn store(
        &self,
        reading: &DerivedReading,
        raw: Option<&RawReading>,
    ) -> Result<(), SinkError> {
        let entry = StoredReading::new(reading, raw)?;
        let mut line =
            serde_json::to_vec(&entry).map_err(|e| SinkError::Rejected(e.to_string()))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
