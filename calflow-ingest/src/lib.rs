// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Calflow Ingest - Asynchronous ingestion coordinator
//!
//! Drives raw readings through the Calflow derivation engine and fans the
//! result out to a persistence sink and a live-update sink.
//!
//! ## Features
//!
//! - **Per-device lanes**: arrival order preserved per device, devices run concurrently
//! - **Bounded queues**: drop-oldest or drop-newest when a device floods
//! - **Sink isolation**: each sink drains its own per-device backlog with its own timeout and retry budget
//! - **Last-known-good cache**: `get_latest` / `get_all` for query endpoints
//! - **Hot calibration updates**: through the shared [`calflow::CalibrationStore`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use calflow::{CalibrationRecord, CalibrationStore, FieldKind, LinearMapping};
//! use calflow_ingest::{BroadcastSink, Coordinator, IngestConfig, MemorySink};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(CalibrationStore::new());
//! store.upsert(
//!     CalibrationRecord::new("tank-01")
//!         .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 1023.0, 0.0, 100.0))
//!         .with_capacity(5000.0),
//! ).unwrap();
//!
//! let storage = Arc::new(MemorySink::new());
//! let live = Arc::new(BroadcastSink::new(256));
//! let mut updates = live.subscribe();
//!
//! let coordinator = Coordinator::new(store, storage.clone(), live, IngestConfig::default()).unwrap();
//! coordinator.ingest_json(r#"{"device_id":"tank-01","timestamp":0,"levelRaw":512}"#);
//!
//! let reading = updates.recv().await.unwrap();
//! assert_eq!(reading.device_id, "tank-01");
//! coordinator.shutdown().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  ingest / ingest_json
//!          │ validate
//!          ▼
//!  ┌────────────────────────────────────┐
//!  │ Lane tank-01         (one per device)│
//!  │  raw FIFO ─► derive worker           │  lookup → derive
//!  │        ┌────────┴─────────┐          │
//!  │        ▼                  ▼          │
//!  │  persistence backlog  live backlog   │  bounded, one worker each
//!  └────────┬──────────────────┬─────────┘
//!           ▼                  ▼
//!    ┌─────────────┐    ┌─────────────┐
//!    │ Persistence │    │ Live update │     timeout + retry per sink
//!    └──────┬──────┘    └──────┬──────┘
//!           └─ first accept ───┘
//!                    ▼
//!   latest-value cache → get_latest / get_all
//! ```

mod config;
mod coordinator;
mod error;
mod lane;
pub mod retry;
pub mod sink;
mod stats;

// Public API
pub use config::{IngestConfig, MissingCalibrationPolicy, OverflowPolicy};
pub use coordinator::{Admission, Coordinator};
pub use error::{IngestError, Result, SinkDeliveryError, SinkError, SinkKind};
pub use lane::{DeviceStatus, DropReason, LaneState, Outcome};
pub use retry::RetryStrategy;
pub use sink::{
    BroadcastSink, JsonLinesSink, LiveUpdateSink, MemorySink, PersistenceSink, StoredReading,
};
pub use stats::{IngestStats, StatsSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
