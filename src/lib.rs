//! # Calflow - Calibrated sensor derivation pipeline
//!
//! Turns raw instrument readings into physical values that every consumer
//! (API, live dashboards, time-series storage) sees identically.
//!
//! ## Key Features
//!
//! - **Single validation boundary**: loosely shaped JSON becomes a typed [`RawReading`]
//! - **Per-device calibration**: linear range mapping with explicit clamping
//! - **Status classification**: critical / low / normal from ordered thresholds
//! - **Secondary metrics**: remaining volume and time to empty
//! - **Hot-reloadable store**: versioned immutable snapshots, swapped atomically
//!
//! ## Quick Start
//!
//! ```rust
//! use calflow::{derive, CalibrationRecord, CalibrationStore, FieldKind, LinearMapping, RawReading, Status};
//!
//! let store = CalibrationStore::new();
//! store.upsert(
//!     CalibrationRecord::new("tank-01")
//!         .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 1023.0, 0.0, 100.0))
//!         .with_capacity(5000.0)
//!         .with_thresholds(15.0, 30.0),
//! ).unwrap();
//!
//! let raw = RawReading::new("tank-01", 1_700_000_000_000).with_field(FieldKind::Level, 512.0);
//! let cal = store.lookup("tank-01").unwrap();
//! let derived = derive(&raw, &cal).unwrap();
//!
//! assert!((derived.level().unwrap() - 50.05).abs() < 0.01);
//! assert_eq!(derived.status, Status::Normal);
//! ```
//!
//! ## Modules
//!
//! - [`reading`]: Raw and derived reading types
//! - [`payload`]: Untyped JSON to [`RawReading`] conversion
//! - [`calibration`]: Calibration records and calibration files
//! - [`store`]: Shared, hot-reloadable calibration store
//! - [`derive`]: The derivation engine

macro_rules! log_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        {
            log::warn!($($arg)*);
        }
    };
}

macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        {
            log::debug!($($arg)*);
        }
    };
}

// Modules
pub mod calibration;
pub mod derive;
pub mod error;
pub mod payload;
pub mod reading;
pub mod store;

// Re-exports for convenient access
pub use calibration::{CalibrationRecord, LinearMapping, Thresholds};
pub use derive::{classify, derive, derive_at, secondary_metrics};
pub use error::{CalflowError, CalibrationError, Result, ValidationError};
pub use reading::{
    DerivedReading, FieldKind, PhysicalValue, RawReading, SecondaryMetrics, Status,
};
pub use store::{CalibrationSnapshot, CalibrationStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
