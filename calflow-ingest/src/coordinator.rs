// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! High-level Coordinator API
//!
//! The [`Coordinator`] accepts raw readings and routes each one to the lane
//! of its device. Every lane runs three tasks: a derive worker that looks up
//! the calibration and derives the physical values, then one delivery worker
//! per sink draining its own ordered backlog. A sink that stalls fills only
//! its own backlog; the other sink and later derivations keep going.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use calflow::{CalibrationRecord, CalibrationStore, FieldKind, LinearMapping, RawReading};
//! use calflow_ingest::{Coordinator, IngestConfig, MemorySink};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(CalibrationStore::new());
//! store.upsert(
//!     CalibrationRecord::new("tank-01")
//!         .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 1023.0, 0.0, 100.0)),
//! ).unwrap();
//!
//! let sink = Arc::new(MemorySink::new());
//! let coordinator = Coordinator::new(
//!     store,
//!     sink.clone(),
//!     sink.clone(),
//!     IngestConfig::default(),
//! ).unwrap();
//!
//! coordinator.ingest(RawReading::new("tank-01", 0).with_field(FieldKind::Level, 512.0));
//! coordinator.flush().await;
//!
//! let latest = coordinator.get_latest("tank-01").unwrap();
//! assert!((latest.level().unwrap() - 50.05).abs() < 0.01);
//! coordinator.shutdown().await;
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use calflow::{
    derive, payload, CalflowError, CalibrationRecord, CalibrationStore, DerivedReading,
    RawReading, ValidationError,
};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{IngestConfig, MissingCalibrationPolicy};
use crate::error::{IngestError, Result, SinkKind};
use crate::lane::{DeviceStatus, Dispatch, DropReason, Lane, Outcome, Push};
use crate::retry::deliver;
use crate::sink::{LiveUpdateSink, PersistenceSink};
use crate::stats::{IngestStats, StatsSnapshot};

const SINKS: [SinkKind; 2] = [SinkKind::Persistence, SinkKind::LiveUpdate];

/// Result of offering a reading to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Queued for processing
    Queued,
    /// Queued; the oldest pending reading of the device was discarded
    Displaced,
    /// Not queued
    Rejected(IngestError),
}

impl Admission {
    /// Check if the reading was queued
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// Asynchronous ingestion coordinator
///
/// Cheap to clone; clones share the same lanes, cache and statistics.
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: IngestConfig,
    calibrations: Arc<CalibrationStore>,
    persistence: Arc<dyn PersistenceSink>,
    live: Arc<dyn LiveUpdateSink>,
    /// Also guards `closed` transitions and admission
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Latest accepted reading per device with its admission sequence
    latest: RwLock<HashMap<String, (u64, DerivedReading)>>,
    misconfigured: Mutex<BTreeMap<String, String>>,
    stats: IngestStats,
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    runtime: Handle,
}

impl Coordinator {
    /// Create a coordinator
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - No Tokio runtime is running on the current thread
    pub fn new(
        calibrations: Arc<CalibrationStore>,
        persistence: Arc<dyn PersistenceSink>,
        live: Arc<dyn LiveUpdateSink>,
        config: IngestConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| IngestError::NoRuntime)?;

        tracing::info!(
            queue_capacity = config.queue_capacity,
            sink_backlog = config.sink_backlog,
            overflow = %config.overflow_policy,
            sink_timeout_ms = config.sink_timeout.as_millis() as u64,
            max_retries = config.retry.max_retries(),
            persist_raw = config.persist_raw,
            "ingestion coordinator started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                calibrations,
                persistence,
                live,
                lanes: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                latest: RwLock::new(HashMap::new()),
                misconfigured: Mutex::new(BTreeMap::new()),
                stats: IngestStats::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                runtime,
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Offer a typed reading
    ///
    /// Validates synchronously, then queues the reading on its device lane
    /// and returns without waiting for derivation or delivery.
    pub fn ingest(&self, reading: RawReading) -> Admission {
        let inner = &self.inner;
        inner.stats.record_received();

        if inner.closed.load(Ordering::SeqCst) {
            return Admission::Rejected(IngestError::Closed);
        }
        if let Err(e) = reading.validate() {
            return self.reject_invalid(Some(&reading.device_id), e);
        }

        let (lane, pushed) = {
            let mut lanes = inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed.load(Ordering::SeqCst) {
                return Admission::Rejected(IngestError::Closed);
            }
            let lane = match inner.open_lane(&mut lanes, &reading.device_id) {
                Ok(lane) => lane,
                Err(e) => {
                    drop(lanes);
                    tracing::warn!(device_id = %reading.device_id, error = %e, "reading rejected");
                    return Admission::Rejected(e);
                }
            };
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            let pushed = lane.pending().push(reading);
            (lane, pushed)
        };

        match pushed {
            Push::Queued => {
                inner.stats.record_accepted();
                Admission::Queued
            }
            Push::Displaced(old) => {
                inner.stats.record_accepted();
                inner.stats.record_overflow();
                tracing::warn!(
                    device_id = %lane.device_id(),
                    dropped_timestamp = old.timestamp,
                    "device queue full, oldest reading dropped"
                );
                lane.record(Outcome::Dropped {
                    reason: DropReason::Overflow,
                });
                inner.finish_one();
                Admission::Displaced
            }
            Push::Refused(refused) => {
                inner.stats.record_overflow();
                tracing::warn!(
                    device_id = %lane.device_id(),
                    dropped_timestamp = refused.timestamp,
                    "device queue full, incoming reading dropped"
                );
                inner.finish_one();
                Admission::Rejected(IngestError::QueueFull {
                    device_id: refused.device_id,
                })
            }
        }
    }

    /// Offer an untyped JSON document
    pub fn ingest_json(&self, json: &str) -> Admission {
        match payload::parse_json(json) {
            Ok(reading) => self.ingest(reading),
            Err(e) => {
                self.inner.stats.record_received();
                self.reject_invalid(None, e)
            }
        }
    }

    /// Offer an already parsed JSON value
    pub fn ingest_value(&self, value: serde_json::Value) -> Admission {
        match payload::from_value(&value) {
            Ok(reading) => self.ingest(reading),
            Err(e) => {
                self.inner.stats.record_received();
                let device_id = value
                    .get("device_id")
                    .or_else(|| value.get("deviceId"))
                    .and_then(|v| v.as_str());
                self.reject_invalid(device_id, e)
            }
        }
    }

    fn reject_invalid(&self, device_id: Option<&str>, error: ValidationError) -> Admission {
        self.inner.stats.record_validation_error();
        tracing::warn!(
            device_id = device_id.unwrap_or("<unknown>"),
            error = %error,
            "invalid reading dropped"
        );
        Admission::Rejected(error.into())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Wait until every accepted reading has reached a terminal outcome
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting readings, drain every lane and stop the workers
    pub async fn shutdown(&self) {
        {
            let lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            for lane in lanes.values() {
                lane.pending().close();
            }
        }

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "lane worker failed");
            }
        }

        tracing::info!(
            dispatched = self.inner.stats.snapshot().dispatched,
            "ingestion coordinator stopped"
        );
    }

    /// Check if [`Coordinator::shutdown`] has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Most recent reading a sink accepted for a device
    pub fn get_latest(&self, device_id: &str) -> Option<DerivedReading> {
        let latest = self.inner.latest.read().unwrap_or_else(|e| e.into_inner());
        latest.get(device_id).map(|(_, reading)| reading.clone())
    }

    /// Most recent accepted reading of every device, sorted by device id
    pub fn get_all(&self) -> Vec<DerivedReading> {
        let mut all: Vec<DerivedReading> = {
            let latest = self.inner.latest.read().unwrap_or_else(|e| e.into_inner());
            latest.values().map(|(_, reading)| reading.clone()).collect()
        };
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// Lane status of a device that has sent at least one valid reading
    pub fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        let lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.get(device_id).map(|lane| lane.status())
    }

    /// Lane status of every known device, sorted by device id
    pub fn devices(&self) -> Vec<DeviceStatus> {
        let lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<DeviceStatus> = lanes.values().map(|lane| lane.status()).collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// Devices whose calibration failed on their most recent reading
    ///
    /// Returns `(device_id, error)` pairs sorted by device id.
    pub fn misconfigured_devices(&self) -> Vec<(String, String)> {
        let flagged = self
            .inner
            .misconfigured
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        flagged
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    /// Current statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Readings accepted but not yet terminal
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Coordinator configuration
    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Calibration management
    // ------------------------------------------------------------------------

    /// Shared calibration store
    pub fn calibrations(&self) -> &Arc<CalibrationStore> {
        &self.inner.calibrations
    }

    /// Insert or replace a calibration record
    ///
    /// Takes effect for readings derived after the call returns; readings
    /// already emitted keep their values.
    pub fn upsert_calibration(&self, record: CalibrationRecord) -> Result<u64> {
        let device_id = record.device_id.clone();
        let revision = record.revision;
        let version = self.inner.calibrations.upsert(record)?;
        tracing::info!(%device_id, revision, version, "calibration updated");
        Ok(version)
    }

    /// Remove a calibration record
    pub fn remove_calibration(&self, device_id: &str) -> Option<Arc<CalibrationRecord>> {
        let removed = self.inner.calibrations.remove(device_id);
        if removed.is_some() {
            self.inner.unflag(device_id);
            tracing::info!(device_id, "calibration removed");
        }
        removed
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Lane workers
// ============================================================================

/// Derive readings in arrival order and hand them to both sink backlogs
async fn run_lane(inner: Arc<Inner>, lane: Arc<Lane>) {
    let mut seq = 0u64;
    while let Some(reading) = lane.pending().next().await {
        lane.begin();
        let (derived, raw) = match inner.derive_reading(reading) {
            Ok(derived) => derived,
            Err(outcome) => {
                lane.complete(outcome);
                inner.finish_one();
                continue;
            }
        };

        let dispatch = Arc::new(Dispatch::new(seq, derived, raw));
        seq += 1;
        for sink in SINKS {
            if let Push::Displaced(skipped) = lane.backlog(sink).push(Arc::clone(&dispatch)) {
                inner.stats.record_backlog_drop(sink);
                tracing::warn!(
                    device_id = %lane.device_id(),
                    sink = %sink,
                    dropped_timestamp = skipped.reading.captured_at,
                    "sink backlog full, oldest reading skipped"
                );
                inner.resolve(&lane, &skipped, sink, false);
            }
        }
    }

    for sink in SINKS {
        lane.backlog(sink).close();
    }
    tracing::debug!(device_id = lane.device_id(), "device lane closed");
}

/// Deliver one sink's backlog in order
async fn run_sink(inner: Arc<Inner>, lane: Arc<Lane>, sink: SinkKind) {
    while let Some(dispatch) = lane.backlog(sink).next().await {
        let delivered = inner.send(sink, &dispatch).await;
        inner.resolve(&lane, &dispatch, sink, delivered);
    }
}

impl Inner {
    /// Find or create the lane of a device; the caller holds the `lanes` lock
    fn open_lane(
        self: &Arc<Self>,
        lanes: &mut HashMap<String, Arc<Lane>>,
        device_id: &str,
    ) -> Result<Arc<Lane>> {
        if let Some(lane) = lanes.get(device_id) {
            return Ok(Arc::clone(lane));
        }
        if lanes.len() >= self.config.max_devices {
            return Err(IngestError::MaxDevicesReached {
                max: self.config.max_devices,
            });
        }

        let lane = Arc::new(Lane::new(
            device_id,
            self.config.queue_capacity,
            self.config.overflow_policy,
            self.config.sink_backlog,
        ));
        lanes.insert(device_id.to_string(), Arc::clone(&lane));

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(
            self.runtime
                .spawn(run_lane(Arc::clone(self), Arc::clone(&lane))),
        );
        for sink in SINKS {
            workers.push(
                self.runtime
                    .spawn(run_sink(Arc::clone(self), Arc::clone(&lane), sink)),
            );
        }

        tracing::debug!(device_id, "device lane opened");
        Ok(lane)
    }

    /// Look up the calibration and derive; `Err` carries the terminal outcome
    fn derive_reading(
        &self,
        reading: RawReading,
    ) -> std::result::Result<(DerivedReading, Option<RawReading>), Outcome> {
        let device_id = reading.device_id.clone();

        let calibration = match self.calibrations.lookup(&device_id) {
            Some(record) => record,
            None => match &self.config.missing_calibration {
                MissingCalibrationPolicy::Drop => {
                    self.stats.record_calibration_missing();
                    let error = CalflowError::CalibrationMissing {
                        device_id: device_id.clone(),
                    };
                    tracing::warn!(%device_id, error = %error, "reading dropped");
                    return Err(Outcome::Dropped {
                        reason: DropReason::CalibrationMissing,
                    });
                }
                MissingCalibrationPolicy::Fallback(record) => {
                    tracing::debug!(%device_id, "using fallback calibration");
                    Arc::new(CalibrationRecord {
                        device_id: device_id.clone(),
                        ..record.clone()
                    })
                }
            },
        };

        let derived = match derive(&reading, &calibration) {
            Ok(derived) => derived,
            Err(e) => {
                self.stats.record_calibration_error();
                tracing::error!(
                    %device_id,
                    revision = calibration.revision,
                    error = %e,
                    "calibration cannot be applied, device flagged as misconfigured"
                );
                self.flag(&device_id, e.to_string());
                return Err(Outcome::Dropped {
                    reason: DropReason::CalibrationError(e.to_string()),
                });
            }
        };
        self.unflag(&device_id);

        if derived.clamped {
            self.stats.record_clamped();
            tracing::debug!(%device_id, timestamp = derived.captured_at, "reading clamped");
        }

        let raw = self.config.persist_raw.then_some(reading);
        Ok((derived, raw))
    }

    /// One sink call with timeout and retries; `true` when accepted
    async fn send(&self, sink: SinkKind, dispatch: &Dispatch) -> bool {
        let retry = &self.config.retry;
        let timeout = self.config.sink_timeout;
        let result = match sink {
            SinkKind::Persistence => {
                deliver(sink, retry, timeout, || {
                    self.persistence
                        .store(&dispatch.reading, dispatch.raw.as_ref())
                })
                .await
            }
            SinkKind::LiveUpdate => {
                deliver(sink, retry, timeout, || self.live.publish(&dispatch.reading)).await
            }
        };

        match result {
            Ok(_) => true,
            Err(failure) => {
                self.stats.record_sink_failure(failure.sink);
                tracing::warn!(
                    device_id = %dispatch.reading.device_id,
                    sink = %failure.sink,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "sink delivery failed"
                );
                false
            }
        }
    }

    /// Record one sink's answer; the second answer completes the reading
    fn resolve(&self, lane: &Lane, dispatch: &Dispatch, sink: SinkKind, delivered: bool) {
        if delivered {
            self.remember(dispatch);
        }
        let Some(outcome) = dispatch.resolve(sink, delivered) else {
            return;
        };

        if outcome.is_dispatched() {
            self.stats.record_dispatched();
        } else {
            self.stats.record_undeliverable();
            tracing::warn!(
                device_id = %dispatch.reading.device_id,
                timestamp = dispatch.reading.captured_at,
                "no sink accepted the reading"
            );
        }
        lane.complete(outcome);
        self.finish_one();
    }

    /// Update the last-known-good cache unless a later reading is already there
    fn remember(&self, dispatch: &Dispatch) {
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        match latest.get(&dispatch.reading.device_id) {
            Some((seq, _)) if *seq >= dispatch.seq => {}
            _ => {
                latest.insert(
                    dispatch.reading.device_id.clone(),
                    (dispatch.seq, dispatch.reading.clone()),
                );
            }
        }
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn flag(&self, device_id: &str, error: String) {
        let mut flagged = self.misconfigured.lock().unwrap_or_else(|e| e.into_inner());
        flagged.insert(device_id.to_string(), error);
    }

    fn unflag(&self, device_id: &str) {
        let mut flagged = self.misconfigured.lock().unwrap_or_else(|e| e.into_inner());
        flagged.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::LaneState;
    use crate::sink::MemorySink;
    use calflow::{FieldKind, LinearMapping};

    fn setup(config: IngestConfig) -> (Coordinator, Arc<MemorySink>) {
        let store = Arc::new(CalibrationStore::new());
        store
            .upsert(
                CalibrationRecord::new("tank-1")
                    .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 100.0, 0.0, 100.0)),
            )
            .unwrap();
        let sink = Arc::new(MemorySink::new());
        let coordinator = Coordinator::new(store, sink.clone(), sink.clone(), config).unwrap();
        (coordinator, sink)
    }

    #[test]
    fn test_requires_runtime() {
        let store = Arc::new(CalibrationStore::new());
        let sink = Arc::new(MemorySink::new());
        let result = Coordinator::new(store, sink.clone(), sink, IngestConfig::default());
        assert!(matches!(result, Err(IngestError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let store = Arc::new(CalibrationStore::new());
        let sink = Arc::new(MemorySink::new());
        let result = Coordinator::new(store, sink.clone(), sink, IngestConfig::with_queue_capacity(0));
        assert!(matches!(result, Err(IngestError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_ingest_and_query() {
        let (coordinator, sink) = setup(IngestConfig::default());

        let admission =
            coordinator.ingest(RawReading::new("tank-1", 1).with_field(FieldKind::Level, 42.0));
        assert_eq!(admission, Admission::Queued);
        coordinator.flush().await;

        assert_eq!(coordinator.get_latest("tank-1").unwrap().level(), Some(42.0));
        assert_eq!(sink.stored().len(), 1);
        assert_eq!(sink.published().len(), 1);
        assert_eq!(coordinator.in_flight(), 0);

        let status = coordinator.device_status("tank-1").unwrap();
        assert_eq!(status.completed, 1);
        assert!(status.last_outcome.unwrap().is_dispatched());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let (coordinator, sink) = setup(IngestConfig::default());

        let admission = coordinator.ingest_json(r#"{"device_id":"tank-1","timestamp":1}"#);
        assert!(!admission.is_accepted());
        let admission = coordinator.ingest_json("{not json");
        assert!(!admission.is_accepted());
        coordinator.flush().await;

        let stats = coordinator.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.validation_errors, 2);
        assert!(sink.stored().is_empty());
        assert!(coordinator.device_status("tank-1").is_none());
    }

    #[tokio::test]
    async fn test_ingest_value() {
        let (coordinator, _) = setup(IngestConfig::default());
        let admission = coordinator.ingest_value(serde_json::json!({
            "deviceId": "tank-1",
            "timestamp": 5,
            "levelRaw": 10
        }));
        assert_eq!(admission, Admission::Queued);
        coordinator.flush().await;
        assert_eq!(coordinator.get_latest("tank-1").unwrap().captured_at, 5);
    }

    #[tokio::test]
    async fn test_closed_coordinator_rejects() {
        let (coordinator, _) = setup(IngestConfig::default());
        coordinator.shutdown().await;
        let admission =
            coordinator.ingest(RawReading::new("tank-1", 1).with_field(FieldKind::Level, 1.0));
        assert_eq!(admission, Admission::Rejected(IngestError::Closed));
    }

    #[tokio::test]
    async fn test_max_devices() {
        let config = IngestConfig {
            max_devices: 1,
            ..Default::default()
        };
        let (coordinator, _) = setup(config);
        assert!(coordinator
            .ingest(RawReading::new("tank-1", 1).with_field(FieldKind::Level, 1.0))
            .is_accepted());
        let admission =
            coordinator.ingest(RawReading::new("tank-2", 1).with_field(FieldKind::Level, 1.0));
        assert_eq!(
            admission,
            Admission::Rejected(IngestError::MaxDevicesReached { max: 1 })
        );
        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ingest_racing_shutdown_leaves_nothing_in_flight() {
        let config = IngestConfig {
            queue_capacity: 1 << 16,
            ..Default::default()
        };
        let (coordinator, sink) = setup(config);

        let producers: Vec<_> = (0..4)
            .map(|task| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    for i in 0..500u64 {
                        coordinator
                            .ingest(RawReading::new("tank-1", i).with_field(FieldKind::Level, 1.0));
                        // Unknown devices open new lanes while shutdown runs
                        coordinator.ingest(
                            RawReading::new(format!("new-{}-{}", task, i), i)
                                .with_field(FieldKind::Level, 1.0),
                        );
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        coordinator.shutdown().await;
        for producer in producers {
            producer.await.unwrap();
        }

        assert_eq!(coordinator.in_flight(), 0);
        tokio::time::timeout(std::time::Duration::from_secs(5), coordinator.flush())
            .await
            .expect("flush must not hang after shutdown");

        let stats = coordinator.stats();
        assert_eq!(
            stats.accepted,
            stats.dispatched + stats.calibration_missing + stats.overflow_drops
        );
        assert_eq!(sink.stored().len() as u64, stats.dispatched);
        assert!(coordinator
            .devices()
            .iter()
            .all(|status| status.queued == 0 && status.state == LaneState::Idle));
    }

    #[tokio::test]
    async fn test_cache_never_moves_backwards() {
        let (coordinator, _) = setup(IngestConfig::default());
        coordinator.ingest(RawReading::new("tank-1", 1).with_field(FieldKind::Level, 10.0));
        coordinator.ingest(RawReading::new("tank-1", 2).with_field(FieldKind::Level, 20.0));
        coordinator.flush().await;

        let reading = coordinator.get_latest("tank-1").unwrap();
        assert_eq!(reading.captured_at, 2);

        // A late answer for an earlier reading does not replace the cache
        let mut older = reading.clone();
        older.captured_at = 1;
        coordinator.inner.remember(&Dispatch::new(0, older, None));
        assert_eq!(coordinator.get_latest("tank-1").unwrap().captured_at, 2);
        coordinator.shutdown().await;
    }
}
