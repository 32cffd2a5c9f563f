//! Presence handlers

use crate::config::AppState;
use crate::presence::LastSeen;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, info};

/// GET /presence/online
pub async fn list_online(State(state): State<AppState>) -> Json<Value> {
    info!("GET /presence/online");
    Json(json!({ "online": state.coordinator.online_users() }))
}

/// GET /presence/{phone}
pub async fn get_last_seen(
    Path(phone): Path<String>,
    State(state): State<AppState>,
) -> Json<LastSeen> {
    info!("GET /presence/{}", phone);
    Json(state.coordinator.last_seen(&phone).await)
}

/// POST /presence/{phone}/heartbeat
pub async fn heartbeat(Path(phone): Path<String>, State(state): State<AppState>) -> Json<Value> {
    let created = state.coordinator.heartbeat(&phone).await;
    debug!("POST /presence/{}/heartbeat (new entry: {})", phone, created);
    Json(json!({ "success": true }))
}
