//! Message handlers

use super::logged;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::models::{
    Conversation, DeleteForEveryoneInput, DeleteForMeInput, EditInput, HistoryQuery,
    LocatorInput, Message, MessageLocator, SendMessageInput, StatusBatchInput, StatusReport,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

fn require_locator(input: &LocatorInput) -> Result<MessageLocator> {
    input.locator().ok_or_else(|| {
        Error::ValidationFailed("messageId or from, to and timestamp are required".into())
    })
}

/// The acting user: explicit, else the `from` of the legacy key.
fn require_actor(actor: &Option<String>, input: &LocatorInput) -> Result<String> {
    actor
        .clone()
        .or_else(|| input.from.clone())
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| Error::ValidationFailed("acting user is required".into()))
}

/// POST /messages
pub async fn send_message(
    State(state): State<AppState>,
    Json(input): Json<SendMessageInput>,
) -> Result<(StatusCode, Json<Message>)> {
    info!(
        "POST /messages - {} -> {}",
        input.from,
        input
            .group_id
            .as_deref()
            .or(input.to.as_deref())
            .unwrap_or("?")
    );

    let msg = state
        .coordinator
        .send_message(input)
        .await
        .map_err(logged("send-message"))?;
    Ok((StatusCode::CREATED, Json(msg)))
}

/// POST /messages/seen
pub async fn mark_seen(
    State(state): State<AppState>,
    Json(input): Json<StatusBatchInput>,
) -> Json<StatusReport> {
    info!(
        "POST /messages/seen - {} ids by {}",
        input.message_ids.len(),
        input.viewer
    );
    Json(
        state
            .coordinator
            .mark_seen(&input.message_ids, &input.viewer)
            .await,
    )
}

/// POST /messages/delivered
pub async fn mark_delivered(
    State(state): State<AppState>,
    Json(input): Json<StatusBatchInput>,
) -> Json<StatusReport> {
    info!(
        "POST /messages/delivered - {} ids by {}",
        input.message_ids.len(),
        input.viewer
    );
    Json(
        state
            .coordinator
            .mark_delivered(&input.message_ids, &input.viewer)
            .await,
    )
}

/// PUT /messages/edit
pub async fn edit_message(
    State(state): State<AppState>,
    Json(input): Json<EditInput>,
) -> Result<Json<Message>> {
    let locator = require_locator(&input.locator)?;
    let actor = require_actor(&input.actor, &input.locator)?;
    info!("PUT /messages/edit - {} by {}", locator, actor);

    let msg = state
        .coordinator
        .edit(&locator, &actor, &input.new_text)
        .await
        .map_err(logged("edit"))?;
    Ok(Json(msg))
}

/// PUT /messages/delete-for-me
pub async fn delete_for_me(
    State(state): State<AppState>,
    Json(input): Json<DeleteForMeInput>,
) -> Result<Json<Value>> {
    let locator = require_locator(&input.locator)?;
    info!("PUT /messages/delete-for-me - {} by {}", locator, input.user);

    let msg = state
        .coordinator
        .delete_for_me(&locator, &input.user)
        .await
        .map_err(logged("delete-for-me"))?;
    Ok(Json(json!({ "success": true, "messageId": msg.id })))
}

/// PUT /messages/delete-for-everyone
pub async fn delete_for_everyone(
    State(state): State<AppState>,
    Json(input): Json<DeleteForEveryoneInput>,
) -> Result<Json<Message>> {
    let locator = require_locator(&input.locator)?;
    let actor = require_actor(&input.actor, &input.locator)?;
    info!("PUT /messages/delete-for-everyone - {} by {}", locator, actor);

    let msg = state
        .coordinator
        .delete_for_everyone(&locator, &actor)
        .await
        .map_err(logged("delete-for-everyone"))?;
    Ok(Json(msg))
}

/// GET /messages/{a}/{b}
pub async fn direct_history(
    Path((a, b)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Message>>> {
    let viewer = query.viewer.unwrap_or_else(|| a.clone());
    info!("GET /messages/{}/{} - viewer {}", a, b, viewer);

    let history = state
        .coordinator
        .history(&Conversation::Direct(a, b), &viewer)
        .await
        .map_err(logged("history"))?;
    Ok(Json(history))
}

/// GET /groups/{group_id}/messages
pub async fn group_history(
    Path(group_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Message>>> {
    let viewer = query
        .viewer
        .ok_or_else(|| Error::ValidationFailed("viewer is required".into()))?;
    info!("GET /groups/{}/messages - viewer {}", group_id, viewer);

    let history = state
        .coordinator
        .history(&Conversation::Group(group_id), &viewer)
        .await
        .map_err(logged("history"))?;
    Ok(Json(history))
}
