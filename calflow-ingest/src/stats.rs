// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Ingestion statistics
//!
//! Lock-free counters updated by [`crate::Coordinator`] and its lanes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::SinkKind;

/// Live counters
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    accepted: AtomicU64,
    validation_errors: AtomicU64,
    overflow_drops: AtomicU64,
    calibration_missing: AtomicU64,
    calibration_errors: AtomicU64,
    clamped: AtomicU64,
    dispatched: AtomicU64,
    undeliverable: AtomicU64,
    persistence_failures: AtomicU64,
    live_update_failures: AtomicU64,
    persistence_backlog_drops: AtomicU64,
    live_update_backlog_drops: AtomicU64,
}

impl IngestStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow(&self) {
        self.overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_calibration_missing(&self) {
        self.calibration_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_calibration_error(&self) {
        self.calibration_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clamped(&self) {
        self.clamped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_undeliverable(&self) {
        self.undeliverable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sink_failure(&self, sink: SinkKind) {
        let counter = match sink {
            SinkKind::Persistence => &self.persistence_failures,
            SinkKind::LiveUpdate => &self.live_update_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backlog_drop(&self, sink: SinkKind) {
        let counter = match sink {
            SinkKind::Persistence => &self.persistence_backlog_drops,
            SinkKind::LiveUpdate => &self.live_update_backlog_drops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            calibration_missing: self.calibration_missing.load(Ordering::Relaxed),
            calibration_errors: self.calibration_errors.load(Ordering::Relaxed),
            clamped: self.clamped.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            live_update_failures: self.live_update_failures.load(Ordering::Relaxed),
            persistence_backlog_drops: self.persistence_backlog_drops.load(Ordering::Relaxed),
            live_update_backlog_drops: self.live_update_backlog_drops.load(Ordering::Relaxed),
        }
    }
}

/// Copy of the counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Readings offered to the coordinator
    pub received: u64,
    /// Readings admitted to a device queue
    pub accepted: u64,
    /// Readings rejected at the validation boundary
    pub validation_errors: u64,
    /// Readings discarded because a device queue was full
    pub overflow_drops: u64,
    /// Readings dropped for lack of a calibration record
    pub calibration_missing: u64,
    /// Readings whose calibration could not be applied
    pub calibration_errors: u64,
    /// Derived readings with at least one clamped value
    pub clamped: u64,
    /// Readings accepted by at least one sink
    pub dispatched: u64,
    /// Readings refused by both sinks
    pub undeliverable: u64,
    /// Persistence deliveries that exhausted their retries
    pub persistence_failures: u64,
    /// Live-update deliveries that exhausted their retries
    pub live_update_failures: u64,
    /// Readings discarded from a full persistence backlog
    pub persistence_backlog_drops: u64,
    /// Readings discarded from a full live-update backlog
    pub live_update_backlog_drops: u64,
}

impl StatsSnapshot {
    /// Readings that ended without reaching any sink
    pub fn dropped(&self) -> u64 {
        self.validation_errors
            + self.overflow_drops
            + self.calibration_missing
            + self.calibration_errors
            + self.undeliverable
    }

    /// Fraction of received readings that were dispatched
    pub fn delivery_rate(&self) -> f64 {
        if self.received == 0 {
            return 0.0;
        }
        self.dispatched as f64 / self.received as f64
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Calflow Ingest Statistics ===\n\n");

        report.push_str(&format!("Received: {}\n", self.received));
        report.push_str(&format!("Accepted: {}\n", self.accepted));
        report.push_str(&format!(
            "Dispatched: {} ({:.1}%)\n",
            self.dispatched,
            self.delivery_rate() * 100.0
        ));
        report.push_str(&format!("Clamped: {}\n\n", self.clamped));

        report.push_str(&format!("Dropped: {}\n", self.dropped()));
        report.push_str(&format!("  validation: {}\n", self.validation_errors));
        report.push_str(&format!("  overflow: {}\n", self.overflow_drops));
        report.push_str(&format!(
            "  calibration missing: {}\n",
            self.calibration_missing
        ));
        report.push_str(&format!("  calibration error: {}\n", self.calibration_errors));
        report.push_str(&format!("  undeliverable: {}\n", self.undeliverable));

        if self.persistence_failures + self.live_update_failures > 0 {
            report.push_str(&format!(
                "\nSink failures: persistence {}, live update {}\n",
                self.persistence_failures, self.live_update_failures
            ));
        }
        if self.persistence_backlog_drops + self.live_update_backlog_drops > 0 {
            report.push_str(&format!(
                "Backlog drops: persistence {}, live update {}\n",
                self.persistence_backlog_drops, self.live_update_backlog_drops
            ));
        }

        report
    }
}
