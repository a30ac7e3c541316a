/**
 * API HTTP QUBIX - Surface réseau du kernel
 *
 * RÔLE :
 * Transport fin autour du tracker de vivacité et du hub d'événements.
 *
 * ROUTES :
 * - POST /providers/heartbeat       : heartbeat worker → HeartbeatResponse
 * - GET  /providers/heartbeat/stats : stats du tracker
 * - GET  /ws                        : upgrade WebSocket (dashboards)
 * - GET  /ws/stats                  : clients et abonnements du hub
 * - GET  /health, /system/health    : liveness process + état infrastructure
 *
 * CODES :
 * Heartbeat : 200 succès, 404 provider inconnu, 500 autre échec ;
 * le corps garde toujours la forme HeartbeatResponse.
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::hub::{EventHub, HubStats};
use crate::liveness::{LivenessError, LivenessStats, LivenessTracker};
use crate::models::{HeartbeatRequest, HeartbeatResponse, Job};
use crate::ws::websocket_handler;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Clone)]
pub struct AppState {
    pub hub: EventHub,
    pub tracker: LivenessTracker,
    pub health_tracker: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/providers/heartbeat", post(heartbeat))
        .route("/providers/heartbeat/stats", get(heartbeat_stats))
        .route("/ws", get(websocket_handler))
        .route("/ws/stats", get(ws_stats))
        .with_state(app_state)
}

fn heartbeat_reply(result: Result<Vec<Job>, LivenessError>) -> (StatusCode, HeartbeatResponse) {
    match result {
        Ok(pending_jobs) => (StatusCode::OK, HeartbeatResponse::ok(pending_jobs)),
        Err(e @ LivenessError::ProviderNotFound(_)) => (StatusCode::NOT_FOUND, HeartbeatResponse::failed(e.to_string())),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, HeartbeatResponse::failed(e.to_string())),
    }
}

// POST /providers/heartbeat
async fn heartbeat(
    State(app): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> (StatusCode, Json<HeartbeatResponse>) {
    let (code, response) = heartbeat_reply(app.tracker.try_process_heartbeat(&request).await);
    (code, Json(response))
}

// GET /providers/heartbeat/stats
async fn heartbeat_stats(State(app): State<AppState>) -> Result<Json<LivenessStats>, (StatusCode, Json<Value>)> {
    app.tracker
        .stats()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))
}

// GET /ws/stats
async fn ws_stats(State(app): State<AppState>) -> Json<HubStats> {
    Json(app.hub.stats())
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.hub, &app.tracker).await)
}
