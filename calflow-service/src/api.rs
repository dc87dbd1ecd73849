// Calflow Service - HTTP API
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP handlers.
//!
//! Inbound readings, latest-value queries, calibration management, the
//! live SSE stream and the operational endpoints.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use calflow::{CalibrationRecord, DerivedReading};
use calflow_ingest::{Admission, BroadcastSink, Coordinator, IngestError};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::metrics::{encode_metrics, update_inventory_metrics, update_pipeline_metrics};
use crate::replay::{DatasetInfo, ReplayState};

/// Application state shared across handlers.
pub struct AppState {
    pub coordinator: Coordinator,
    pub live: Arc<BroadcastSink>,
    pub replay: Option<(Arc<ReplayState>, DatasetInfo)>,
    pub start_time: Instant,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/readings", post(ingest_handler))
        .route("/devices", get(devices_handler))
        .route("/devices/:id", get(device_handler))
        .route("/devices/:id/status", get(device_status_handler))
        .route("/calibrations", get(calibrations_handler))
        .route(
            "/calibrations/:id",
            put(put_calibration_handler).delete(delete_calibration_handler),
        )
        .route("/misconfigured", get(misconfigured_handler))
        .route("/live", get(live_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Calflow</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Calflow</h1>
    <p>Calibrated sensor derivation pipeline.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><code>POST /readings</code> - Submit a raw reading (JSON)</div>
        <div class="endpoint"><a href="/devices">/devices</a> - Latest reading of every device</div>
        <div class="endpoint"><code>/devices/:id</code>, <code>/devices/:id/status</code> - One device</div>
        <div class="endpoint"><a href="/calibrations">/calibrations</a> - Calibration records (<code>PUT</code>/<code>DELETE /calibrations/:id</code>)</div>
        <div class="endpoint"><a href="/misconfigured">/misconfigured</a> - Devices whose calibration fails</div>
        <div class="endpoint"><a href="/live">/live</a> - Live readings (Server-Sent Events)</div>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/status">/status</a> - Status information (JSON)</div>
    </div>
</body>
</html>"#,
    )
}

// ============================================================
// Readings
// ============================================================

/// Accept one raw reading.
async fn ingest_handler(State(state): State<Arc<AppState>>, body: String) -> Response {
    match state.coordinator.ingest_json(&body) {
        Admission::Queued => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response()
        }
        Admission::Displaced => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "displaced" }))).into_response()
        }
        Admission::Rejected(e) => {
            let status = match &e {
                IngestError::Pipeline(_) => StatusCode::BAD_REQUEST,
                IngestError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                IngestError::MaxDevicesReached { .. } | IngestError::Closed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e)
        }
    }
}

/// Latest reading of every device.
async fn devices_handler(State(state): State<Arc<AppState>>) -> Json<Vec<DerivedReading>> {
    Json(state.coordinator.get_all())
}

/// Latest reading of one device.
async fn device_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.coordinator.get_latest(&id) {
        Some(reading) => Json(reading).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no reading for device '{}'", id)),
    }
}

/// Lane status of one device.
async fn device_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.device_status(&id) {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown device '{}'", id)),
    }
}

// ============================================================
// Calibrations
// ============================================================

/// Every calibration record, sorted by device id.
async fn calibrations_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CalibrationRecord>> {
    let snapshot = state.coordinator.calibrations().snapshot();
    let mut records: Vec<CalibrationRecord> = snapshot.iter().map(|r| r.as_ref().clone()).collect();
    records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Json(records)
}

/// Insert or replace the calibration of one device.
///
/// The body's `device_id` may be omitted; it then defaults to the path.
async fn put_calibration_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut record): Json<CalibrationRecord>,
) -> Response {
    if record.device_id.is_empty() {
        record.device_id = id.clone();
    }
    if record.device_id != id {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "device id in body ('{}') does not match path ('{}')",
                record.device_id, id
            ),
        );
    }
    if let Err(e) = record.validate() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, e);
    }

    match state.coordinator.upsert_calibration(record) {
        Ok(version) => Json(json!({ "device_id": id, "version": version })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

/// Remove the calibration of one device.
async fn delete_calibration_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.remove_calibration(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no calibration for '{}'", id)),
    }
}

#[derive(Serialize)]
struct Misconfigured {
    device_id: String,
    error: String,
}

/// Devices whose calibration currently fails.
async fn misconfigured_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Misconfigured>> {
    Json(
        state
            .coordinator
            .misconfigured_devices()
            .into_iter()
            .map(|(device_id, error)| Misconfigured { device_id, error })
            .collect(),
    )
}

// ============================================================
// Live stream
// ============================================================

/// Optional filter for the live stream.
#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    device: Option<String>,
}

/// Derived readings as Server-Sent Events.
async fn live_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.live.subscribe();
    let stream = stream::unfold((rx, query.device), |(mut rx, device)| async move {
        loop {
            match rx.recv().await {
                Ok(reading) => {
                    if device.as_deref().is_some_and(|d| d != reading.device_id) {
                        continue;
                    }
                    let event = Event::default().event("reading").json_data(&reading);
                    return Some((event, (rx, device)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live subscriber lagging, readings skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================
// Operations
// ============================================================

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let coordinator = &state.coordinator;
    update_pipeline_metrics(&coordinator.stats(), coordinator.in_flight());
    let calibrations = coordinator.calibrations();
    update_inventory_metrics(
        calibrations.version(),
        calibrations.len(),
        coordinator.devices().len(),
        coordinator.misconfigured_devices().len(),
    );

    match encode_metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            metrics,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.coordinator.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "Shutting down")
    } else {
        (StatusCode::OK, "Ready")
    }
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    calibration_version: u64,
    calibration_records: usize,
    devices: usize,
    in_flight: usize,
    stats: calflow_ingest::StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay: Option<ReplayStatus>,
}

/// Replay status information.
#[derive(Serialize)]
struct ReplayStatus {
    running: bool,
    position: usize,
    total_rows: usize,
    loops: usize,
    progress_percent: f64,
    dataset: DatasetInfo,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let replay = state.replay.as_ref().map(|(replay, info)| {
        let position = replay.position.load(Ordering::SeqCst);
        let total = replay.total_rows.load(Ordering::SeqCst);
        let progress = if total > 0 {
            (position as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        ReplayStatus {
            running: replay.running.load(Ordering::SeqCst),
            position,
            total_rows: total,
            loops: replay.loops.load(Ordering::SeqCst),
            progress_percent: progress,
            dataset: info.clone(),
        }
    });

    let coordinator = &state.coordinator;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        calibration_version: coordinator.calibrations().version(),
        calibration_records: coordinator.calibrations().len(),
        devices: coordinator.devices().len(),
        in_flight: coordinator.in_flight(),
        stats: coordinator.stats(),
        replay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use calflow::{CalibrationStore, FieldKind, LinearMapping};
    use calflow_ingest::{IngestConfig, MemorySink};

    fn app_state() -> Arc<AppState> {
        let store = Arc::new(CalibrationStore::new());
        store
            .upsert(
                CalibrationRecord::new("tank-01")
                    .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 1023.0, 0.0, 100.0))
                    .with_capacity(5000.0),
            )
            .unwrap();
        let live = Arc::new(BroadcastSink::new(64));
        let coordinator = Coordinator::new(
            store,
            Arc::new(MemorySink::new()),
            live.clone(),
            IngestConfig::default(),
        )
        .unwrap();
        Arc::new(AppState {
            coordinator,
            live,
            replay: None,
            start_time: Instant::now(),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let state = app_state();

        let response = ingest_handler(
            State(state.clone()),
            r#"{"device_id":"tank-01","timestamp":1,"levelRaw":512}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        state.coordinator.flush().await;

        let response = device_handler(State(state.clone()), Path("tank-01".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["device_id"], "tank-01");
        assert_eq!(body["status"], "unclassified");

        let Json(all) = devices_handler(State(state.clone())).await;
        assert_eq!(all.len(), 1);

        let response =
            device_status_handler(State(state.clone()), Path("tank-01".to_string())).await;
        let body = body_json(response).await;
        assert_eq!(body["completed"], 1);
        assert_eq!(body["last_outcome"]["outcome"], "dispatched");
    }

    #[tokio::test]
    async fn test_invalid_reading_is_bad_request() {
        let state = app_state();
        let response =
            ingest_handler(State(state.clone()), r#"{"device_id":"tank-01"}"#.to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("timestamp"));
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let state = app_state();
        let response = device_handler(State(state.clone()), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = device_status_handler(State(state), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_calibration() {
        let state = app_state();
        let record = CalibrationRecord::new("")
            .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 100.0, 0.0, 100.0));

        let response =
            put_calibration_handler(State(state.clone()), Path("tank-02".to_string()), Json(record))
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.coordinator.calibrations().lookup("tank-02").is_some());

        let Json(records) = calibrations_handler(State(state.clone())).await;
        let ids: Vec<&str> = records.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["tank-01", "tank-02"]);
    }

    #[tokio::test]
    async fn test_put_calibration_without_device_id() {
        let state = app_state();
        let record: CalibrationRecord = serde_json::from_value(json!({
            "mappings": {
                "level": { "raw_min": 0.0, "raw_max": 1023.0, "phys_min": 0.0, "phys_max": 100.0 }
            },
            "capacity": 8000.0
        }))
        .unwrap();

        let response =
            put_calibration_handler(State(state.clone()), Path("tank-03".to_string()), Json(record))
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        let stored = state.coordinator.calibrations().lookup("tank-03").unwrap();
        assert_eq!(stored.device_id, "tank-03");
        assert_eq!(stored.capacity, Some(8000.0));
    }

    #[tokio::test]
    async fn test_put_invalid_calibration_is_unprocessable() {
        let state = app_state();
        let record = CalibrationRecord::new("tank-01")
            .with_mapping(FieldKind::Level, LinearMapping::new(10.0, 10.0, 0.0, 100.0));
        let response =
            put_calibration_handler(State(state.clone()), Path("tank-01".to_string()), Json(record))
                .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(state.coordinator.calibrations().version(), 1);
    }

    #[tokio::test]
    async fn test_put_mismatched_id() {
        let state = app_state();
        let record = CalibrationRecord::new("tank-09")
            .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 100.0, 0.0, 100.0));
        let response =
            put_calibration_handler(State(state), Path("tank-01".to_string()), Json(record)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_calibration() {
        let state = app_state();
        let response =
            delete_calibration_handler(State(state.clone()), Path("tank-01".to_string())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = delete_calibration_handler(State(state), Path("tank-01".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_and_metrics() {
        let state = app_state();
        let Json(status) = status_handler(State(state.clone())).await;
        assert_eq!(status.calibration_records, 1);
        assert!(status.replay.is_none());

        let response = metrics_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("calflow_calibration_records"));
    }
}
