// Calflow Ingest - Integration Tests
//
// End-to-end coordinator behavior with in-memory, failing, slow and gated
// sinks. The tests are organized into categories:
// 1. Delivery and sink isolation
// 2. Ordering and overflow
// 3. Calibration handling
// 4. Queries and lifecycle

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calflow::{CalibrationRecord, CalibrationStore, DerivedReading, FieldKind, LinearMapping, RawReading, Status};
use calflow_ingest::{
    Admission, Coordinator, DropReason, IngestConfig, IngestError, LiveUpdateSink, MemorySink,
    MissingCalibrationPolicy, OverflowPolicy, Outcome, PersistenceSink, RetryStrategy, SinkError,
};
use tokio::sync::{Notify, Semaphore};

// ============================================================================
// Helpers
// ============================================================================

fn tank(id: &str) -> CalibrationRecord {
    CalibrationRecord::new(id)
        .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 1023.0, 0.0, 100.0))
        .with_capacity(5000.0)
        .with_thresholds(15.0, 30.0)
}

fn store_with(ids: &[&str]) -> Arc<CalibrationStore> {
    let store = CalibrationStore::from_records(ids.iter().map(|id| tank(id))).unwrap();
    Arc::new(store)
}

fn level(id: &str, ts: u64, raw: f64) -> RawReading {
    RawReading::new(id, ts).with_field(FieldKind::Level, raw)
}

fn quick_config() -> IngestConfig {
    IngestConfig {
        retry: RetryStrategy::None,
        ..Default::default()
    }
}

fn timestamps(readings: &[DerivedReading]) -> Vec<u64> {
    readings.iter().map(|r| r.captured_at).collect()
}

/// Persistence sink that always fails
struct BrokenStorage {
    calls: AtomicU32,
}

#[async_trait]
impl PersistenceSink for BrokenStorage {
    async fn store(&self, _: &DerivedReading, _: Option<&RawReading>) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Unavailable("database offline".into()))
    }
}

/// Live sink that always fails
struct BrokenLive;

#[async_trait]
impl LiveUpdateSink for BrokenLive {
    async fn publish(&self, _: &DerivedReading) -> Result<(), SinkError> {
        Err(SinkError::Rejected("socket closed".into()))
    }
}

/// Persistence sink that never answers in time
struct SlowStorage;

#[async_trait]
impl PersistenceSink for SlowStorage {
    async fn store(&self, _: &DerivedReading, _: Option<&RawReading>) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Persistence sink failing the first `failures` calls
struct FlakyStorage {
    failures: u32,
    calls: AtomicU32,
    inner: MemorySink,
}

#[async_trait]
impl PersistenceSink for FlakyStorage {
    async fn store(&self, reading: &DerivedReading, raw: Option<&RawReading>) -> Result<(), SinkError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SinkError::Unavailable("warming up".into()));
        }
        self.inner.store(reading, raw).await
    }
}

/// Persistence sink blocking until released, signalling each entry
struct GatedStorage {
    entered: Notify,
    release: Semaphore,
    inner: MemorySink,
}

impl GatedStorage {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
            inner: MemorySink::new(),
        }
    }
}

#[async_trait]
impl PersistenceSink for GatedStorage {
    async fn store(&self, reading: &DerivedReading, raw: Option<&RawReading>) -> Result<(), SinkError> {
        self.entered.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        permit.forget();
        self.inner.store(reading, raw).await
    }
}

// ============================================================================
// Delivery and sink isolation
// ============================================================================

#[tokio::test]
async fn test_reading_reaches_both_sinks_identically() {
    let storage = Arc::new(MemorySink::new());
    let live = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        storage.clone(),
        live.clone(),
        IngestConfig::default(),
    )
    .unwrap();

    coordinator.ingest_json(r#"{"device_id":"tank-01","timestamp":1000,"levelRaw":512}"#);
    coordinator.flush().await;

    let stored = storage.stored();
    let published = live.published();
    assert_eq!(stored.len(), 1);
    assert_eq!(published.len(), 1);
    assert_eq!(stored[0].reading, published[0]);

    let reading = &published[0];
    approx::assert_abs_diff_eq!(reading.level().unwrap(), 50.05, epsilon = 0.01);
    approx::assert_abs_diff_eq!(reading.metrics.remaining_volume.unwrap(), 2502.5, epsilon = 0.1);
    assert_eq!(reading.status, Status::Normal);
    assert_eq!(coordinator.get_latest("tank-01").as_ref(), Some(reading));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_failing_persistence_does_not_block_live_updates() {
    let storage = Arc::new(BrokenStorage {
        calls: AtomicU32::new(0),
    });
    let live = Arc::new(MemorySink::new());
    let coordinator =
        Coordinator::new(store_with(&["tank-01"]), storage.clone(), live.clone(), quick_config())
            .unwrap();

    for ts in 0..20 {
        coordinator.ingest(level("tank-01", ts, ts as f64 * 10.0));
    }
    coordinator.flush().await;

    assert_eq!(timestamps(&live.published()), (0..20).collect::<Vec<_>>());
    assert_eq!(storage.calls.load(Ordering::SeqCst), 20);

    let stats = coordinator.stats();
    assert_eq!(stats.persistence_failures, 20);
    assert_eq!(stats.dispatched, 20);
    assert_eq!(coordinator.get_latest("tank-01").unwrap().captured_at, 19);

    let status = coordinator.device_status("tank-01").unwrap();
    assert_eq!(
        status.last_outcome,
        Some(Outcome::Dispatched {
            persisted: false,
            published: true
        })
    );
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_both_sinks_failing_leaves_cache_untouched() {
    let storage = Arc::new(BrokenStorage {
        calls: AtomicU32::new(0),
    });
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        storage,
        Arc::new(BrokenLive),
        quick_config(),
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 1, 100.0));
    coordinator.flush().await;

    assert!(coordinator.get_latest("tank-01").is_none());
    assert_eq!(coordinator.stats().undeliverable, 1);
    assert_eq!(
        coordinator.device_status("tank-01").unwrap().last_outcome,
        Some(Outcome::Dropped {
            reason: DropReason::Undeliverable
        })
    );
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_sink_times_out() {
    let live = Arc::new(MemorySink::new());
    let config = IngestConfig {
        sink_timeout: Duration::from_millis(50),
        retry: RetryStrategy::fixed(1, Duration::from_millis(10)),
        ..Default::default()
    };
    let coordinator =
        Coordinator::new(store_with(&["tank-01"]), Arc::new(SlowStorage), live.clone(), config)
            .unwrap();

    coordinator.ingest(level("tank-01", 1, 100.0));
    coordinator.ingest(level("tank-01", 2, 200.0));
    coordinator.flush().await;

    assert_eq!(timestamps(&live.published()), vec![1, 2]);
    assert_eq!(coordinator.stats().persistence_failures, 2);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hanging_persistence_does_not_hold_back_live_updates() {
    let live = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(SlowStorage),
        live.clone(),
        IngestConfig::default(),
    )
    .unwrap();

    // One reading per second for five minutes
    for ts in 0..300u64 {
        assert!(coordinator.ingest(level("tank-01", ts * 1000, 512.0)).is_accepted());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let expected: Vec<u64> = (0..300).map(|ts| ts * 1000).collect();
    assert_eq!(timestamps(&live.published()), expected);
    assert_eq!(coordinator.get_latest("tank-01").unwrap().captured_at, 299_000);

    let stats = coordinator.stats();
    assert_eq!(stats.overflow_drops, 0);
    assert_eq!(stats.live_update_backlog_drops, 0);
    assert_eq!(stats.live_update_failures, 0);
    assert!(stats.persistence_failures > 0);

    let status = coordinator.device_status("tank-01").unwrap();
    assert_eq!(status.queued, 0);
    assert_eq!(status.live_update_backlog, 0);
    assert!(status.persistence_backlog > 0);

    coordinator.shutdown().await;
    let stats = coordinator.stats();
    assert_eq!(stats.dispatched, 300);
    assert_eq!(stats.undeliverable, 0);
    assert_eq!(
        stats.persistence_failures + stats.persistence_backlog_drops,
        300
    );
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_transient_failures() {
    let storage = Arc::new(FlakyStorage {
        failures: 2,
        calls: AtomicU32::new(0),
        inner: MemorySink::new(),
    });
    let config = IngestConfig::with_retry(RetryStrategy::fixed(3, Duration::from_millis(5)));
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        storage.clone(),
        Arc::new(MemorySink::new()),
        config,
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 1, 100.0));
    coordinator.flush().await;

    assert_eq!(storage.inner.stored().len(), 1);
    assert_eq!(storage.calls.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.stats().persistence_failures, 0);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_persist_raw() {
    let storage = Arc::new(MemorySink::new());
    let config = IngestConfig {
        persist_raw: true,
        ..Default::default()
    };
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        storage.clone(),
        Arc::new(MemorySink::new()),
        config,
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 7, 300.0).with_sensor_type("ultrasonic"));
    coordinator.flush().await;

    let stored = storage.stored();
    let raw = stored[0].raw.as_ref().unwrap();
    assert_eq!(raw["device_id"], "tank-01");
    assert_eq!(raw["sensor_type"], "ultrasonic");
    coordinator.shutdown().await;
}

// ============================================================================
// Ordering and overflow
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_device_order_is_preserved() {
    let devices = ["tank-01", "tank-02", "tank-03"];
    let storage = Arc::new(MemorySink::new());
    let live = Arc::new(MemorySink::new());
    let config = IngestConfig::with_queue_capacity(1024);
    let coordinator =
        Coordinator::new(store_with(&devices), storage.clone(), live.clone(), config).unwrap();

    for ts in 0..200u64 {
        for device in devices {
            assert!(coordinator.ingest(level(device, ts, (ts % 1024) as f64)).is_accepted());
        }
    }
    coordinator.flush().await;

    let expected: Vec<u64> = (0..200).collect();
    for device in devices {
        assert_eq!(timestamps(&storage.stored_for(device)), expected);
        assert_eq!(timestamps(&live.published_for(device)), expected);
    }
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_drop_oldest_overflow() {
    let live = Arc::new(MemorySink::new());
    let config = IngestConfig {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::DropOldest,
        ..Default::default()
    };
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(MemorySink::new()),
        live.clone(),
        config,
    )
    .unwrap();

    // The lane worker cannot run before this task yields
    assert_eq!(coordinator.ingest(level("tank-01", 0, 1.0)), Admission::Queued);
    assert_eq!(coordinator.ingest(level("tank-01", 1, 1.0)), Admission::Queued);
    assert_eq!(coordinator.ingest(level("tank-01", 2, 1.0)), Admission::Displaced);
    assert_eq!(coordinator.ingest(level("tank-01", 3, 1.0)), Admission::Displaced);
    assert_eq!(coordinator.device_status("tank-01").unwrap().queued, 2);

    coordinator.flush().await;

    assert_eq!(timestamps(&live.published()), vec![2, 3]);
    assert_eq!(coordinator.stats().overflow_drops, 2);
    assert_eq!(coordinator.stats().dispatched, 2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_drop_newest_overflow() {
    let live = Arc::new(MemorySink::new());
    let config = IngestConfig {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::DropNewest,
        ..Default::default()
    };
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(MemorySink::new()),
        live.clone(),
        config,
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 0, 1.0));
    coordinator.ingest(level("tank-01", 1, 1.0));
    for ts in 2..4 {
        assert_eq!(
            coordinator.ingest(level("tank-01", ts, 1.0)),
            Admission::Rejected(IngestError::QueueFull {
                device_id: "tank-01".into()
            })
        );
    }

    coordinator.flush().await;

    assert_eq!(timestamps(&live.published()), vec![0, 1]);
    assert_eq!(coordinator.stats().overflow_drops, 2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_full_sink_backlog_skips_oldest_for_that_sink_only() {
    let gate = Arc::new(GatedStorage::new());
    let live = Arc::new(MemorySink::new());
    let config = IngestConfig {
        sink_backlog: 2,
        sink_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let coordinator =
        Coordinator::new(store_with(&["tank-01"]), gate.clone(), live.clone(), config).unwrap();

    coordinator.ingest(level("tank-01", 0, 1.0));
    gate.entered.notified().await;
    for ts in 1..5 {
        coordinator.ingest(level("tank-01", ts, 1.0));
    }
    while live.published().len() < 5 {
        tokio::task::yield_now().await;
    }

    // Live updates and the cache are current while storage is stuck on reading 0
    let status = coordinator.device_status("tank-01").unwrap();
    assert_eq!(status.persistence_backlog, 2);
    assert_eq!(status.live_update_backlog, 0);
    assert_eq!(coordinator.get_latest("tank-01").unwrap().captured_at, 4);

    gate.release.add_permits(16);
    coordinator.flush().await;

    let stored: Vec<u64> = gate
        .inner
        .stored()
        .iter()
        .map(|s| s.reading.captured_at)
        .collect();
    assert_eq!(stored, vec![0, 3, 4]);

    let stats = coordinator.stats();
    assert_eq!(stats.persistence_backlog_drops, 2);
    assert_eq!(stats.live_update_backlog_drops, 0);
    assert_eq!(stats.dispatched, 5);
    assert_eq!(
        coordinator.device_status("tank-01").unwrap().last_outcome,
        Some(Outcome::Dispatched {
            persisted: true,
            published: true
        })
    );
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_busy_device_does_not_stall_others() {
    let gate = Arc::new(GatedStorage::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01", "tank-02"]),
        gate.clone(),
        Arc::new(MemorySink::new()),
        IngestConfig::with_sink_timeout(Duration::from_secs(30)),
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 0, 1.0));
    gate.entered.notified().await;
    coordinator.ingest(level("tank-02", 0, 1.0));
    gate.entered.notified().await;

    // Both lanes are inside the sink at the same time
    assert_eq!(coordinator.in_flight(), 2);
    gate.release.add_permits(2);
    coordinator.flush().await;
    assert_eq!(coordinator.get_all().len(), 2);
    coordinator.shutdown().await;
}

// ============================================================================
// Calibration handling
// ============================================================================

#[tokio::test]
async fn test_unknown_device_is_dropped_without_affecting_others() {
    let live = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(MemorySink::new()),
        live.clone(),
        IngestConfig::default(),
    )
    .unwrap();

    coordinator.ingest(level("ghost", 1, 100.0));
    coordinator.ingest(level("tank-01", 1, 100.0));
    coordinator.flush().await;

    assert!(coordinator.get_latest("ghost").is_none());
    assert!(coordinator.get_latest("tank-01").is_some());
    assert_eq!(live.published().len(), 1);
    assert_eq!(coordinator.stats().calibration_missing, 1);
    assert_eq!(
        coordinator.device_status("ghost").unwrap().last_outcome,
        Some(Outcome::Dropped {
            reason: DropReason::CalibrationMissing
        })
    );
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_fallback_calibration() {
    let live = Arc::new(MemorySink::new());
    let config = IngestConfig {
        missing_calibration: MissingCalibrationPolicy::Fallback(tank("*")),
        ..Default::default()
    };
    let coordinator = Coordinator::new(
        Arc::new(CalibrationStore::new()),
        Arc::new(MemorySink::new()),
        live.clone(),
        config,
    )
    .unwrap();

    coordinator.ingest(level("new-tank", 1, 1023.0));
    coordinator.flush().await;

    let reading = coordinator.get_latest("new-tank").unwrap();
    assert_eq!(reading.device_id, "new-tank");
    assert_eq!(reading.level(), Some(100.0));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_calibration_update_applies_to_later_readings() {
    let live = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(MemorySink::new()),
        live.clone(),
        IngestConfig::default(),
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 1, 1023.0));
    coordinator.flush().await;

    coordinator
        .upsert_calibration(
            CalibrationRecord::new("tank-01")
                .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 2046.0, 0.0, 100.0))
                .with_revision(2),
        )
        .unwrap();
    coordinator.ingest(level("tank-01", 2, 1023.0));
    coordinator.flush().await;

    let published = live.published();
    assert_eq!(published[0].level(), Some(100.0));
    assert_eq!(published[0].calibration_revision, 0);
    assert_eq!(published[1].level(), Some(50.0));
    assert_eq!(published[1].calibration_revision, 2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_broken_calibration_flags_device_until_fixed() {
    let coordinator = Coordinator::new(
        Arc::new(CalibrationStore::new()),
        Arc::new(MemorySink::new()),
        Arc::new(MemorySink::new()),
        IngestConfig::default(),
    )
    .unwrap();

    coordinator
        .upsert_calibration(
            CalibrationRecord::new("tank-01")
                .with_mapping(FieldKind::Level, LinearMapping::new(512.0, 512.0, 0.0, 100.0)),
        )
        .unwrap();
    coordinator.ingest(level("tank-01", 1, 100.0));
    coordinator.flush().await;

    let flagged = coordinator.misconfigured_devices();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].0, "tank-01");
    assert_eq!(coordinator.stats().calibration_errors, 1);
    assert!(coordinator.get_latest("tank-01").is_none());

    coordinator.upsert_calibration(tank("tank-01")).unwrap();
    coordinator.ingest(level("tank-01", 2, 100.0));
    coordinator.flush().await;

    assert!(coordinator.misconfigured_devices().is_empty());
    assert!(coordinator.get_latest("tank-01").is_some());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_remove_calibration() {
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(MemorySink::new()),
        Arc::new(MemorySink::new()),
        IngestConfig::default(),
    )
    .unwrap();

    assert!(coordinator.remove_calibration("tank-01").is_some());
    assert!(coordinator.remove_calibration("tank-01").is_none());

    coordinator.ingest(level("tank-01", 1, 100.0));
    coordinator.flush().await;
    assert_eq!(coordinator.stats().calibration_missing, 1);
    coordinator.shutdown().await;
}

// ============================================================================
// Queries and lifecycle
// ============================================================================

#[tokio::test]
async fn test_invalid_readings_never_reach_sinks() {
    let storage = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        storage.clone(),
        Arc::new(MemorySink::new()),
        IngestConfig::default(),
    )
    .unwrap();

    let rejected = [
        coordinator.ingest_json(r#"{"timestamp":1,"levelRaw":5}"#),
        coordinator.ingest_json(r#"{"device_id":"tank-01","timestamp":1,"levelRaw":"high"}"#),
        coordinator.ingest_json(r#"{"device_id":"tank-01","timestamp":1,"colour":3}"#),
        coordinator.ingest(level("tank-01", 1, f64::NAN)),
    ];
    assert!(rejected.iter().all(|a| !a.is_accepted()));
    assert!(coordinator.ingest(level("tank-01", 2, 5.0)).is_accepted());
    coordinator.flush().await;

    assert_eq!(storage.stored().len(), 1);
    assert_eq!(coordinator.stats().validation_errors, 4);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_get_all_is_sorted() {
    let coordinator = Coordinator::new(
        store_with(&["c", "a", "b"]),
        Arc::new(MemorySink::new()),
        Arc::new(MemorySink::new()),
        IngestConfig::default(),
    )
    .unwrap();

    for id in ["c", "a", "b", "a"] {
        coordinator.ingest(level(id, 1, 10.0));
    }
    coordinator.flush().await;

    let ids: Vec<String> = coordinator.get_all().into_iter().map(|r| r.device_id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    let statuses: Vec<String> = coordinator.devices().into_iter().map(|s| s.device_id).collect();
    assert_eq!(statuses, vec!["a", "b", "c"]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_pending_readings() {
    let storage = Arc::new(MemorySink::new());
    let coordinator = Coordinator::new(
        store_with(&["tank-01", "tank-02"]),
        storage.clone(),
        Arc::new(MemorySink::new()),
        IngestConfig::default(),
    )
    .unwrap();

    for ts in 0..30 {
        coordinator.ingest(level("tank-01", ts, 1.0));
        coordinator.ingest(level("tank-02", ts, 1.0));
    }
    coordinator.shutdown().await;

    assert_eq!(storage.stored().len(), 60);
    assert_eq!(coordinator.in_flight(), 0);
    assert!(coordinator.is_closed());
    assert_eq!(
        coordinator.ingest(level("tank-01", 99, 1.0)),
        Admission::Rejected(IngestError::Closed)
    );
}

#[tokio::test]
async fn test_stats_report() {
    let coordinator = Coordinator::new(
        store_with(&["tank-01"]),
        Arc::new(MemorySink::new()),
        Arc::new(MemorySink::new()),
        IngestConfig::default(),
    )
    .unwrap();

    coordinator.ingest(level("tank-01", 1, 5000.0));
    coordinator.ingest_json("[]");
    coordinator.flush().await;

    let stats = coordinator.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.clamped, 1);
    assert!(stats.report().contains("validation: 1"));
    coordinator.shutdown().await;
}
