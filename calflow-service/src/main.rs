// Calflow Service - HTTP ingestion service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Calflow Service
//!
//! HTTP front end for the Calflow pipeline: accepts raw readings, serves the
//! latest derived values, streams live updates and exposes Prometheus
//! metrics. Can replay a recorded CSV capture.
//!
//! ## Usage
//!
//! ```bash
//! # Serve with a calibration file, persisting to JSON lines
//! calflow-service --calibrations calibrations.json --persist readings.jsonl
//!
//! # Replay a capture 60x faster, looping
//! calflow-service --calibrations calibrations.json --replay capture.csv --speed 60 --loop-replay
//! ```

mod api;
mod metrics;
mod reload;
mod replay;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use calflow::{CalflowError, CalibrationStore};
use calflow_ingest::{
    BroadcastSink, Coordinator, IngestConfig, IngestError, JsonLinesSink, MemorySink,
    OverflowPolicy, PersistenceSink, RetryStrategy, SinkError,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use api::{router, AppState};
use reload::CalibrationWatcher;
use replay::{ReplayConfig, ReplayEngine, ReplayError};

/// Readings kept in memory when no persistence file is configured
const MEMORY_RETENTION: usize = 10_000;

/// Calflow ingestion service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Calibration file (JSON), watched for changes
    #[arg(short, long)]
    calibrations: Option<PathBuf>,

    /// Calibration file polling interval in milliseconds (0 disables reload)
    #[arg(long, default_value = "2000")]
    reload_interval_ms: u64,

    /// Append derived readings to this JSON lines file
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Persist the raw reading next to each derived reading
    #[arg(long)]
    persist_raw: bool,

    /// Pending readings kept per device
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Derived readings kept per device and sink while that sink is busy
    #[arg(long, default_value = "256")]
    sink_backlog: usize,

    /// Overflow policy for full device queues (drop-oldest, drop-newest)
    #[arg(long, default_value = "drop-oldest")]
    overflow: OverflowPolicy,

    /// Timeout for a single sink call in milliseconds
    #[arg(long, default_value = "2000")]
    sink_timeout_ms: u64,

    /// Retries per sink after a failed call
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// CSV capture of raw readings to replay
    #[arg(short, long)]
    replay: Option<String>,

    /// Replay speed multiplier (1.0 = real-time)
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Loop the replay when it reaches the end
    #[arg(short, long)]
    loop_replay: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Startup errors.
#[derive(Debug, thiserror::Error)]
enum ServiceError {
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalflowError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] SinkError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Calflow Service v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!(error = %e, "service failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ServiceError> {
    // Calibrations
    let store = Arc::new(CalibrationStore::new());
    if let Some(path) = args.calibrations.clone() {
        let mut watcher = CalibrationWatcher::new(path, Arc::clone(&store));
        watcher.check().await?;
        if args.reload_interval_ms > 0 {
            tokio::spawn(watcher.run(Duration::from_millis(args.reload_interval_ms)));
        }
    } else {
        info!("No calibration file, calibrations must be added over HTTP");
    }

    // Sinks
    let persistence: Arc<dyn PersistenceSink> = match &args.persist {
        Some(path) => {
            info!(path = %path.display(), "persisting to JSON lines");
            Arc::new(JsonLinesSink::open(path).await?)
        }
        None => {
            info!(retention = MEMORY_RETENTION, "no persistence file, keeping readings in memory");
            Arc::new(MemorySink::with_retention(MEMORY_RETENTION))
        }
    };
    let live = Arc::new(BroadcastSink::new(1024));

    // Coordinator
    let config = IngestConfig {
        queue_capacity: args.queue_capacity,
        overflow_policy: args.overflow,
        sink_backlog: args.sink_backlog,
        sink_timeout: Duration::from_millis(args.sink_timeout_ms),
        retry: RetryStrategy::exponential(args.max_retries, Duration::from_millis(50)),
        persist_raw: args.persist_raw,
        ..Default::default()
    };
    let coordinator = Coordinator::new(store, persistence, live.clone(), config)?;

    // Per-device gauges follow the live stream
    let mut readings = live.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match readings.recv().await {
                Ok(reading) => metrics::observe_reading(&reading),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Replay
    let replay = match args.replay.clone() {
        Some(csv_path) => {
            let engine = Arc::new(ReplayEngine::from_csv(ReplayConfig {
                csv_path,
                speed: args.speed,
                loop_replay: args.loop_replay,
                ..Default::default()
            })?);
            let info = engine.info();
            info!(
                devices = info.device_count,
                rows = info.row_count,
                "capture loaded"
            );

            let runner = Arc::clone(&engine);
            let target = coordinator.clone();
            tokio::spawn(async move { runner.run(target).await });
            Some((engine, info))
        }
        None => None,
    };

    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        live,
        replay: replay
            .as_ref()
            .map(|(engine, info)| (engine.state(), info.clone())),
        start_time: Instant::now(),
    });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain
    if let Some((engine, _)) = &replay {
        engine.stop();
    }
    coordinator.shutdown().await;
    info!("\n{}", coordinator.stats().report());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
