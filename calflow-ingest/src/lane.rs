// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-device lanes
//!
//! A [`Lane`] holds the bounded FIFO of raw readings for one device, one
//! bounded backlog of derived readings per sink, and the bookkeeping exposed
//! through [`DeviceStatus`]. Each queue is drained by exactly one worker
//! task, which keeps per-device order intact at every sink while a stalled
//! sink only ever holds up its own backlog.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use calflow::{DerivedReading, RawReading};
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;
use crate::error::SinkKind;

/// Whether a device has readings between admission and a terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneState {
    /// Nothing being derived or delivered
    Idle,
    /// Deriving or dispatching at least one reading
    Processing,
}

/// Why a reading did not reach any sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DropReason {
    /// Displaced or refused by a full queue
    Overflow,
    /// No calibration record for the device
    CalibrationMissing,
    /// Calibration record could not be applied
    CalibrationError(String),
    /// Both sinks gave up
    Undeliverable,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Overflow => f.write_str("queue overflow"),
            DropReason::CalibrationMissing => f.write_str("calibration missing"),
            DropReason::CalibrationError(e) => write!(f, "calibration error: {}", e),
            DropReason::Undeliverable => f.write_str("no sink accepted the reading"),
        }
    }
}

/// Terminal outcome of one reading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// At least one sink accepted the reading
    Dispatched {
        /// Persistence sink accepted it
        persisted: bool,
        /// Live-update sink accepted it
        published: bool,
    },
    /// The reading was dropped
    Dropped {
        /// Why
        reason: DropReason,
    },
}

impl Outcome {
    /// Check if the reading reached a sink
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Outcome::Dispatched { .. })
    }
}

/// Snapshot of one device lane
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Device identifier
    pub device_id: String,
    /// Lane state
    pub state: LaneState,
    /// Raw readings waiting to be derived
    pub queued: usize,
    /// Derived readings waiting for the persistence sink
    pub persistence_backlog: usize,
    /// Derived readings waiting for the live-update sink
    pub live_update_backlog: usize,
    /// Readings that reached a terminal outcome
    pub completed: u64,
    /// Outcome of the most recently completed reading
    pub last_outcome: Option<Outcome>,
}

/// Result of offering an item to a [`Queue`]
#[derive(Debug)]
pub(crate) enum Push<T> {
    /// Appended
    Queued,
    /// Appended after evicting the returned item
    Displaced(T),
    /// Refused; the item is returned
    Refused(T),
}

/// Bounded FIFO with a single consumer
#[derive(Debug)]
pub(crate) struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    wake: Notify,
    closed: AtomicBool,
}

impl<T> Queue<T> {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            policy,
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Offer an item, applying the overflow policy when full
    pub(crate) fn push(&self, item: T) -> Push<T> {
        let result = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() < self.capacity {
                items.push_back(item);
                Push::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let evicted = items.pop_front();
                        items.push_back(item);
                        match evicted {
                            Some(old) => Push::Displaced(old),
                            None => Push::Queued,
                        }
                    }
                    OverflowPolicy::DropNewest => Push::Refused(item),
                }
            }
        };

        if !matches!(result, Push::Refused(_)) {
            self.wake.notify_one();
        }
        result
    }

    pub(crate) fn pop(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.len()
    }

    /// Next item, or `None` once the queue is closed and empty
    ///
    /// Items pushed before [`close`](Self::close) are always returned.
    pub(crate) async fn next(&self) -> Option<T> {
        loop {
            // Read the flag before popping: a push that precedes close is
            // then visible to the pop below.
            let closed = self.closed.load(Ordering::SeqCst);
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if closed {
                return None;
            }
            self.wake.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// One derived reading on its way to both sinks
#[derive(Debug)]
pub(crate) struct Dispatch {
    /// Admission order within the device
    pub(crate) seq: u64,
    pub(crate) reading: DerivedReading,
    pub(crate) raw: Option<RawReading>,
    pending: AtomicU8,
    persisted: AtomicBool,
    published: AtomicBool,
}

impl Dispatch {
    pub(crate) fn new(seq: u64, reading: DerivedReading, raw: Option<RawReading>) -> Self {
        Self {
            seq,
            reading,
            raw,
            pending: AtomicU8::new(2),
            persisted: AtomicBool::new(false),
            published: AtomicBool::new(false),
        }
    }

    /// Record the answer of one sink
    ///
    /// Returns the terminal outcome once both sinks have answered.
    pub(crate) fn resolve(&self, sink: SinkKind, delivered: bool) -> Option<Outcome> {
        let flag = match sink {
            SinkKind::Persistence => &self.persisted,
            SinkKind::LiveUpdate => &self.published,
        };
        flag.store(delivered, Ordering::SeqCst);
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }

        let persisted = self.persisted.load(Ordering::SeqCst);
        let published = self.published.load(Ordering::SeqCst);
        Some(if persisted || published {
            Outcome::Dispatched {
                persisted,
                published,
            }
        } else {
            Outcome::Dropped {
                reason: DropReason::Undeliverable,
            }
        })
    }
}

/// Queues and status for one device
#[derive(Debug)]
pub(crate) struct Lane {
    device_id: String,
    pending: Queue<RawReading>,
    persistence: Queue<Arc<Dispatch>>,
    live: Queue<Arc<Dispatch>>,
    active: AtomicUsize,
    completed: AtomicU64,
    last_outcome: Mutex<Option<Outcome>>,
}

impl Lane {
    pub(crate) fn new(
        device_id: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
        sink_backlog: usize,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            pending: Queue::new(capacity, policy),
            persistence: Queue::new(sink_backlog, OverflowPolicy::DropOldest),
            live: Queue::new(sink_backlog, OverflowPolicy::DropOldest),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw readings waiting to be derived
    pub(crate) fn pending(&self) -> &Queue<RawReading> {
        &self.pending
    }

    /// Derived readings waiting for one sink
    pub(crate) fn backlog(&self, sink: SinkKind) -> &Queue<Arc<Dispatch>> {
        match sink {
            SinkKind::Persistence => &self.persistence,
            SinkKind::LiveUpdate => &self.live,
        }
    }

    /// Mark a reading as taken off the raw queue
    pub(crate) fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Record the terminal outcome of a reading taken with [`begin`](Self::begin)
    pub(crate) fn complete(&self, outcome: Outcome) {
        self.record(outcome);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record the terminal outcome of a reading that never left the raw queue
    pub(crate) fn record(&self, outcome: Outcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_outcome.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(outcome);
    }

    pub(crate) fn status(&self) -> DeviceStatus {
        let state = if self.active.load(Ordering::SeqCst) > 0 {
            LaneState::Processing
        } else {
            LaneState::Idle
        };
        let last_outcome = self
            .last_outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        DeviceStatus {
            device_id: self.device_id.clone(),
            state,
            queued: self.pending.len(),
            persistence_backlog: self.persistence.len(),
            live_update_backlog: self.live.len(),
            completed: self.completed.load(Ordering::Relaxed),
            last_outcome,
        }
    }
}
