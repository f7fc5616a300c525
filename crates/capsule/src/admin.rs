//! Worker admin service.
//!
//! A small axum app the reference worker serves on its UI port. The container
//! reaches it through [`crate::http::WorkerHttpClient`]:
//!
//! - `GET  /backend/admin/num-pending-complete-traces` → `{"count": n}`
//! - `GET  /backend/admin/num-active-traces` → `{"count": n}`
//! - `POST /backend/admin/delete-all-data`
//! - `POST /backend/admin/reset-all-config`
//! - `GET|POST /backend/admin/config` for overrides, `GET /backend/admin/version`

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::version::VersionInfo;

pub const NUM_PENDING_COMPLETE_TRACES_PATH: &str = "/backend/admin/num-pending-complete-traces";
pub const NUM_ACTIVE_TRACES_PATH: &str = "/backend/admin/num-active-traces";
pub const DELETE_ALL_DATA_PATH: &str = "/backend/admin/delete-all-data";
pub const RESET_ALL_CONFIG_PATH: &str = "/backend/admin/reset-all-config";
pub const CONFIG_PATH: &str = "/backend/admin/config";
pub const VERSION_PATH: &str = "/backend/admin/version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Completed,
    Interrupted,
    Failed,
}

/// One finished unit of work, as stored by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub app: String,
    pub outcome: TraceOutcome,
    pub duration_ms: u64,
}

/// Worker-side bookkeeping behind the admin endpoints.
///
/// A trace is pending from [`AdminState::begin_trace`] until its record is
/// stored, so "nothing pending" means every started workload has landed.
pub struct AdminState {
    active: AtomicU64,
    pending_complete: AtomicU64,
    stored: Mutex<Vec<TraceRecord>>,
    config: Mutex<BTreeMap<String, serde_json::Value>>,
    version: VersionInfo,
}

impl AdminState {
    pub fn new(version: VersionInfo) -> Self {
        Self {
            active: AtomicU64::new(0),
            pending_complete: AtomicU64::new(0),
            stored: Mutex::new(Vec::new()),
            config: Mutex::new(BTreeMap::new()),
            version,
        }
    }

    pub fn begin_trace(self: &Arc<Self>, app: impl Into<String>) -> TraceGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.pending_complete.fetch_add(1, Ordering::AcqRel);
        TraceGuard {
            state: Arc::clone(self),
            app: app.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn num_active_traces(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn num_pending_complete_traces(&self) -> u64 {
        self.pending_complete.load(Ordering::Acquire)
    }

    pub fn stored_traces(&self) -> Vec<TraceRecord> {
        self.stored.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn delete_all_data(&self) {
        if let Ok(mut stored) = self.stored.lock() {
            stored.clear();
        }
    }

    pub fn config(&self) -> BTreeMap<String, serde_json::Value> {
        self.config.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn set_config(&self, overrides: BTreeMap<String, serde_json::Value>) {
        if let Ok(mut config) = self.config.lock() {
            config.extend(overrides);
        }
    }

    pub fn reset_all_config(&self) {
        if let Ok(mut config) = self.config.lock() {
            config.clear();
        }
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    fn store(&self, record: TraceRecord) {
        // Active drops first so a poller never sees "pending 0, active 1".
        self.active.fetch_sub(1, Ordering::AcqRel);
        if let Ok(mut stored) = self.stored.lock() {
            stored.push(record);
        }
        self.pending_complete.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Open trace. Stores a [`TraceOutcome::Failed`] record if dropped unfinished.
pub struct TraceGuard {
    state: Arc<AdminState>,
    app: String,
    started: Instant,
    finished: bool,
}

impl TraceGuard {
    pub fn finish(mut self, outcome: TraceOutcome) {
        self.record(outcome);
    }

    fn record(&mut self, outcome: TraceOutcome) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.state.store(TraceRecord {
            app: std::mem::take(&mut self.app),
            outcome,
            duration_ms,
        });
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        self.record(TraceOutcome::Failed);
    }
}

async fn num_pending_complete_traces(State(state): State<Arc<AdminState>>) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.num_pending_complete_traces(),
    })
}

async fn num_active_traces(State(state): State<Arc<AdminState>>) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.num_active_traces(),
    })
}

async fn delete_all_data(State(state): State<Arc<AdminState>>) -> StatusCode {
    state.delete_all_data();
    tracing::debug!("Deleted all stored traces");
    StatusCode::NO_CONTENT
}

async fn reset_all_config(State(state): State<Arc<AdminState>>) -> StatusCode {
    state.reset_all_config();
    tracing::debug!("Reset all config");
    StatusCode::NO_CONTENT
}

async fn get_config(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.config())
}

async fn update_config(
    State(state): State<Arc<AdminState>>,
    Json(overrides): Json<BTreeMap<String, serde_json::Value>>,
) -> StatusCode {
    state.set_config(overrides);
    StatusCode::NO_CONTENT
}

async fn version(State(state): State<Arc<AdminState>>) -> Json<VersionInfo> {
    Json(state.version().clone())
}

pub fn routes(state: Arc<AdminState>) -> Router {
    Router::new()
        .route(NUM_PENDING_COMPLETE_TRACES_PATH, get(num_pending_complete_traces))
        .route(NUM_ACTIVE_TRACES_PATH, get(num_active_traces))
        .route(DELETE_ALL_DATA_PATH, post(delete_all_data))
        .route(RESET_ALL_CONFIG_PATH, post(reset_all_config))
        .route(CONFIG_PATH, get(get_config).post(update_config))
        .route(VERSION_PATH, get(version))
        .with_state(state)
}

/// Serve the admin app on an already-bound listener until `shutdown` fires.
///
/// In-flight requests get `drain` to finish after shutdown before the server
/// is dropped.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
    drain: Duration,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Starting admin service");

    let server = axum::serve(listener, routes(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async { shutdown.cancelled().await; tokio::time::sleep(drain).await } => {
            tracing::warn!(?drain, "Admin service did not drain in time");
        }
    }

    tracing::info!("Admin service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> Arc<AdminState> {
        Arc::new(AdminState::new(VersionInfo::new()))
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get_json(app: Router, path: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response_json(response).await
    }

    #[test]
    fn trace_is_pending_until_stored() {
        let state = state();
        let trace = state.begin_trace("noop");
        assert_eq!(state.num_active_traces(), 1);
        assert_eq!(state.num_pending_complete_traces(), 1);

        trace.finish(TraceOutcome::Completed);
        assert_eq!(state.num_active_traces(), 0);
        assert_eq!(state.num_pending_complete_traces(), 0);

        let stored = state.stored_traces();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].app, "noop");
        assert_eq!(stored[0].outcome, TraceOutcome::Completed);
    }

    #[test]
    fn dropped_trace_is_stored_as_failed() {
        let state = state();
        drop(state.begin_trace("boom"));
        assert_eq!(state.num_pending_complete_traces(), 0);
        assert_eq!(state.stored_traces()[0].outcome, TraceOutcome::Failed);
    }

    #[tokio::test]
    async fn counts_are_served_as_json() {
        let state = state();
        let _open = state.begin_trace("sleep:100");

        let json = get_json(routes(state.clone()), NUM_ACTIVE_TRACES_PATH).await;
        assert_eq!(json, serde_json::json!({"count": 1}));

        let json = get_json(routes(state), NUM_PENDING_COMPLETE_TRACES_PATH).await;
        assert_eq!(json, serde_json::json!({"count": 1}));
    }

    #[tokio::test]
    async fn delete_all_data_clears_stored_traces() {
        let state = state();
        state.begin_trace("noop").finish(TraceOutcome::Completed);
        assert_eq!(state.stored_traces().len(), 1);

        let response = routes(state.clone())
            .oneshot(Request::post(DELETE_ALL_DATA_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.stored_traces().is_empty());
    }

    #[tokio::test]
    async fn reset_all_config_drops_overrides() {
        let state = state();

        let response = routes(state.clone())
            .oneshot(
                Request::post(CONFIG_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"capture_threshold_ms":250}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let json = get_json(routes(state.clone()), CONFIG_PATH).await;
        assert_eq!(json["capture_threshold_ms"], 250);

        let response = routes(state.clone())
            .oneshot(Request::post(RESET_ALL_CONFIG_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let json = get_json(routes(state), CONFIG_PATH).await;
        assert_eq!(json, serde_json::json!({}));
    }

    #[tokio::test]
    async fn version_reports_capsule_version() {
        let state = Arc::new(AdminState::new(
            VersionInfo::new().with_entry_point("capsule-worker"),
        ));
        let json = get_json(routes(state), VERSION_PATH).await;
        assert_eq!(json["capsule"], crate::version::CAPSULE_VERSION);
        assert_eq!(json["entry_point"], "capsule-worker");
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            state(),
            shutdown.clone(),
            Duration::from_secs(1),
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
