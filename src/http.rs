use crate::metrics::Metrics;
use crate::snapshot::{now_unix, Snapshot};
use crate::state::State as AgentState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<AgentState>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub host_id: String,
    pub started_at_unix: i64,
    pub uptime_seconds: i64,
    pub registered: bool,
    pub cycles: u64,
    pub last_collect_timestamp_seconds: i64,
    pub last_heartbeat_timestamp_seconds: i64,
    pub last_cycle_ms: u64,
    pub last_errors: BTreeMap<String, String>,
    pub snapshot: Option<Snapshot>,
}

impl ApiState {
    fn from_state(value: &AgentState, now_unix: i64) -> Self {
        Self {
            host_id: value.host_id.clone(),
            started_at_unix: value.started_at_unix,
            uptime_seconds: now_unix.saturating_sub(value.started_at_unix),
            registered: value.registered,
            cycles: value.cycles,
            last_collect_timestamp_seconds: value.last_collect_timestamp_seconds,
            last_heartbeat_timestamp_seconds: value.last_heartbeat_timestamp_seconds,
            last_cycle_ms: value.last_cycle_ms,
            last_errors: value.last_errors.clone(),
            snapshot: value.last_snapshot.clone(),
        }
    }
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<AgentState>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .with_state(HttpAppState { metrics, state })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    {
        let guard = state.state.read().await;
        state.metrics.update_from_state(&guard, now_unix());
    }
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from_state(&guard, now_unix()))
}
