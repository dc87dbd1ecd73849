// Calflow - Calibrated sensor derivation pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Calibration store
//!
//! The [`CalibrationStore`] is shared, read-mostly state. Every write builds
//! a new immutable [`CalibrationSnapshot`] and swaps it in under a short
//! write lock; readers only hold the read lock long enough to clone an `Arc`.
//! A lookup therefore observes either the old or the new record, never a
//! partially updated one, and a record handed out keeps its contents even
//! after it is replaced.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::calibration::{load_records, CalibrationRecord};
use crate::error::{CalflowError, Result, ValidationError};

/// Immutable, versioned set of calibration records
#[derive(Debug, Default)]
pub struct CalibrationSnapshot {
    version: u64,
    records: HashMap<String, Arc<CalibrationRecord>>,
}

impl CalibrationSnapshot {
    /// Version of this snapshot (incremented on every store write)
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record for a device
    pub fn get(&self, device_id: &str) -> Option<&Arc<CalibrationRecord>> {
        self.records.get(device_id)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over records (unordered)
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CalibrationRecord>> {
        self.records.values()
    }
}

/// Hot-reloadable calibration store keyed by device identifier
#[derive(Debug, Default)]
pub struct CalibrationStore {
    current: RwLock<Arc<CalibrationSnapshot>>,
}

impl CalibrationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given records
    pub fn from_records(records: impl IntoIterator<Item = CalibrationRecord>) -> Result<Self> {
        let store = Self::new();
        store.replace_all(records)?;
        Ok(store)
    }

    /// Create a store from a calibration file
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_records(load_records(path)?)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<CalibrationSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Look up the record for a device
    pub fn lookup(&self, device_id: &str) -> Option<Arc<CalibrationRecord>> {
        self.snapshot().get(device_id).cloned()
    }

    /// Look up the record for a device, reporting absence as an error
    pub fn require(&self, device_id: &str) -> Result<Arc<CalibrationRecord>> {
        self.lookup(device_id)
            .ok_or_else(|| CalflowError::CalibrationMissing {
                device_id: device_id.to_string(),
            })
    }

    /// Insert or replace one record
    ///
    /// Returns the version of the snapshot that contains it. Records that
    /// fail [`CalibrationRecord::validate`] are stored anyway and logged; the
    /// derivation engine reports them per reading.
    pub fn upsert(&self, record: CalibrationRecord) -> Result<u64> {
        check_device_id(&record)?;
        warn_if_invalid(&record);
        Ok(self.write(|records| {
            records.insert(record.device_id.clone(), Arc::new(record));
        }))
    }

    /// Remove the record for a device
    pub fn remove(&self, device_id: &str) -> Option<Arc<CalibrationRecord>> {
        let mut removed = None;
        self.write(|records| {
            removed = records.remove(device_id);
        });
        removed
    }

    /// Replace every record at once
    ///
    /// Used by file reloads: readers see either the complete old set or the
    /// complete new set.
    pub fn replace_all(&self, records: impl IntoIterator<Item = CalibrationRecord>) -> Result<u64> {
        let mut fresh = HashMap::new();
        for record in records {
            check_device_id(&record)?;
            warn_if_invalid(&record);
            fresh.insert(record.device_id.clone(), Arc::new(record));
        }

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = guard.version + 1;
        *guard = Arc::new(CalibrationSnapshot {
            version,
            records: fresh,
        });
        Ok(version)
    }

    /// Reload every record from a calibration file
    ///
    /// On error the current snapshot is left untouched.
    pub fn load_file(&self, path: &Path) -> Result<u64> {
        let records = load_records(path)?;
        self.replace_all(records)
    }

    /// Version of the current snapshot
    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Sorted list of device identifiers with a record
    pub fn device_ids(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut ids: Vec<String> = snapshot.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy-on-write update of the record map
    fn write<F>(&self, update: F) -> u64
    where
        F: FnOnce(&mut HashMap<String, Arc<CalibrationRecord>>),
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut records = guard.records.clone();
        update(&mut records);
        let version = guard.version + 1;
        *guard = Arc::new(CalibrationSnapshot { version, records });
        version
    }
}

fn check_device_id(record: &CalibrationRecord) -> Result<()> {
    if record.device_id.trim().is_empty() {
        return Err(ValidationError::EmptyDeviceId.into());
    }
    Ok(())
}

#[allow(unused_variables)]
fn warn_if_invalid(record: &CalibrationRecord) {
    if let Err(e) = record.validate() {
        log_warn!(
            "calibration for device '{}' (revision {}) is invalid: {}",
            record.device_id,
            record.revision,
            e
        );
    }
}
