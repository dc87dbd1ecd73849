// Calflow Service - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for Calflow monitoring.
//!
//! Pipeline counters are mirrored from the coordinator's statistics;
//! per-device gauges are updated from the live reading stream.

use calflow::DerivedReading;
use calflow_ingest::StatsSnapshot;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_gauge, register_int_gauge_vec, Encoder,
    Gauge, GaugeVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ============================================================
    // Pipeline Counters (from StatsSnapshot)
    // ============================================================

    /// Pipeline event totals, labeled by event.
    pub static ref PIPELINE_EVENTS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "calflow_readings_total",
        "Readings seen by the ingestion pipeline, by event",
        &["event"]
    ).unwrap();

    /// Sink delivery failures after retries, labeled by sink.
    pub static ref SINK_FAILURES_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "calflow_sink_failures_total",
        "Sink deliveries that exhausted their retries",
        &["sink"]
    ).unwrap();

    /// Readings skipped by a full sink backlog, labeled by sink.
    pub static ref SINK_BACKLOG_DROPS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "calflow_sink_backlog_drops_total",
        "Readings skipped because a sink backlog was full",
        &["sink"]
    ).unwrap();

    /// Readings accepted but not yet terminal.
    pub static ref IN_FLIGHT: IntGauge = register_int_gauge!(
        "calflow_in_flight_readings",
        "Readings queued or being processed"
    ).unwrap();

    // ============================================================
    // Calibration and Devices
    // ============================================================

    /// Version of the current calibration snapshot.
    pub static ref CALIBRATION_VERSION: IntGauge = register_int_gauge!(
        "calflow_calibration_version",
        "Version of the active calibration snapshot"
    ).unwrap();

    /// Number of calibration records.
    pub static ref CALIBRATION_RECORDS: IntGauge = register_int_gauge!(
        "calflow_calibration_records",
        "Number of calibration records loaded"
    ).unwrap();

    /// Number of devices with a lane.
    pub static ref DEVICES: IntGauge = register_int_gauge!(
        "calflow_devices",
        "Devices that have sent at least one valid reading"
    ).unwrap();

    /// Devices whose calibration currently fails.
    pub static ref MISCONFIGURED_DEVICES: IntGauge = register_int_gauge!(
        "calflow_misconfigured_devices",
        "Devices whose calibration could not be applied"
    ).unwrap();

    /// Latest physical value per device and field.
    pub static ref PHYSICAL_VALUE: GaugeVec = register_gauge_vec!(
        "calflow_physical_value",
        "Latest derived physical value",
        &["device", "field"]
    ).unwrap();

    /// Latest status per device (0=Unclassified, 1=Normal, 2=Low, 3=Critical).
    pub static ref DEVICE_STATUS: IntGaugeVec = register_int_gauge_vec!(
        "calflow_device_status",
        "Latest status (0=Unclassified, 1=Normal, 2=Low, 3=Critical)",
        &["device"]
    ).unwrap();

    /// Latest remaining volume per device.
    pub static ref REMAINING_VOLUME: GaugeVec = register_gauge_vec!(
        "calflow_remaining_volume",
        "Latest remaining volume in capacity units",
        &["device"]
    ).unwrap();

    // ============================================================
    // Replay Metrics
    // ============================================================

    /// Current replay position (row index).
    pub static ref REPLAY_POSITION: Gauge = register_gauge!(
        "calflow_replay_position",
        "Current replay position (row index)"
    ).unwrap();

    /// Total rows in the replay dataset.
    pub static ref REPLAY_TOTAL_ROWS: Gauge = register_gauge!(
        "calflow_replay_total_rows",
        "Total rows in the replay dataset"
    ).unwrap();

    /// Replay speed multiplier.
    pub static ref REPLAY_SPEED: Gauge = register_gauge!(
        "calflow_replay_speed",
        "Replay speed multiplier"
    ).unwrap();
}

fn status_code(status: calflow::Status) -> i64 {
    match status {
        calflow::Status::Unclassified => 0,
        calflow::Status::Normal => 1,
        calflow::Status::Low => 2,
        calflow::Status::Critical => 3,
    }
}

/// Mirror coordinator statistics.
pub fn update_pipeline_metrics(stats: &StatsSnapshot, in_flight: usize) {
    let events = [
        ("received", stats.received),
        ("accepted", stats.accepted),
        ("dispatched", stats.dispatched),
        ("clamped", stats.clamped),
        ("validation_error", stats.validation_errors),
        ("overflow", stats.overflow_drops),
        ("calibration_missing", stats.calibration_missing),
        ("calibration_error", stats.calibration_errors),
        ("undeliverable", stats.undeliverable),
    ];
    for (event, count) in events {
        PIPELINE_EVENTS_TOTAL
            .with_label_values(&[event])
            .set(count as i64);
    }
    SINK_FAILURES_TOTAL
        .with_label_values(&["persistence"])
        .set(stats.persistence_failures as i64);
    SINK_FAILURES_TOTAL
        .with_label_values(&["live_update"])
        .set(stats.live_update_failures as i64);
    SINK_BACKLOG_DROPS_TOTAL
        .with_label_values(&["persistence"])
        .set(stats.persistence_backlog_drops as i64);
    SINK_BACKLOG_DROPS_TOTAL
        .with_label_values(&["live_update"])
        .set(stats.live_update_backlog_drops as i64);
    IN_FLIGHT.set(in_flight as i64);
}

/// Update calibration and device gauges.
pub fn update_inventory_metrics(
    calibration_version: u64,
    calibration_records: usize,
    devices: usize,
    misconfigured: usize,
) {
    CALIBRATION_VERSION.set(calibration_version as i64);
    CALIBRATION_RECORDS.set(calibration_records as i64);
    DEVICES.set(devices as i64);
    MISCONFIGURED_DEVICES.set(misconfigured as i64);
}

/// Update per-device gauges from a derived reading.
pub fn observe_reading(reading: &DerivedReading) {
    for (field, value) in &reading.values {
        PHYSICAL_VALUE
            .with_label_values(&[reading.device_id.as_str(), field.as_str()])
            .set(value.value);
    }
    DEVICE_STATUS
        .with_label_values(&[reading.device_id.as_str()])
        .set(status_code(reading.status));
    if let Some(volume) = reading.metrics.remaining_volume {
        REMAINING_VOLUME
            .with_label_values(&[reading.device_id.as_str()])
            .set(volume);
    }
}

/// Update replay position metrics.
pub fn update_replay_metrics(position: usize, total: usize, speed: f64) {
    REPLAY_POSITION.set(position as f64);
    REPLAY_TOTAL_ROWS.set(total as f64);
    REPLAY_SPEED.set(speed);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
