//! The read-only monitoring HTTP surface: small JSON health and status
//! probes, each a GET handler projecting an internal snapshot type into
//! JSON. Nothing here mutates the state store — CRUD over bots/agents
//! belongs to the control plane, not this process.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use warden_domain::BotId;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/bots", get(list_bots))
        .route("/v1/bots/:id", get(get_bot))
        .route("/v1/bots/:id/router", get(get_bot_router))
        .route("/v1/reconciler", get(reconciler_status))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = (chrono::Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs,
    })
}

/// `GET /v1/bots` — every known bot id with its current `BotState` and
/// whether its config blobs are present.
async fn list_bots(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state_store.snapshot().await)
}

#[derive(Serialize)]
struct BotDetail {
    #[serde(flatten)]
    snapshot: warden_statestore::BotSnapshot,
    worker_present: bool,
}

/// `GET /v1/bots/:id` — one bot's state-store snapshot, plus whether
/// the Worker Supervisor currently holds a live runtime for it.
async fn get_bot(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let bot_id = BotId::new(id);
    let snapshots = state.state_store.snapshot().await;
    let Some(snapshot) = snapshots.into_iter().find(|s| s.bot_id == bot_id.as_str()) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown bot id" })),
        )
            .into_response();
    };
    let worker_present = state.supervisor.get(&bot_id).is_some();
    Json(BotDetail { snapshot, worker_present }).into_response()
}

/// `GET /v1/bots/:id/router` — that bot's channel router snapshot
/// (pending counts and last-activity time per conversation key). 404
/// if the bot has no live worker.
async fn get_bot_router(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let bot_id = BotId::new(id);
    match state.supervisor.get(&bot_id) {
        Some(worker) => Json(worker.router().snapshot()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no live worker for this bot id" })),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct ReconcilerStatus {
    tick_count: u64,
    last_tick_at: Option<chrono::DateTime<chrono::Utc>>,
    tick_interval_secs: u64,
    live_workers: usize,
}

/// `GET /v1/reconciler` — tick counter and live-worker count, a cheap
/// liveness signal for the reconciler's background loop.
async fn reconciler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ReconcilerStatus {
        tick_count: state.reconciler.tick_count(),
        last_tick_at: state.reconciler.last_tick_at(),
        tick_interval_secs: state.config.reconciler.tick_interval_secs,
        live_workers: state.supervisor.list_all().len(),
    })
}
