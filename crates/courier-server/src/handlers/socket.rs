//! WebSocket upgrade and connection handling.
//!
//! Each socket is registered with the hub under a fresh connection id and
//! joined to its user's room. Outbound frames from the hub are forwarded as
//! JSON text; inbound frames are decoded into [`ClientEvent`]s.

use crate::config::AppState;
use crate::coordinator::ChatCoordinator;
use crate::error::{Error, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    pub user: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub group_id: String,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct TypingRef {
    pub to: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageIds {
    pub message_ids: Vec<String>,
}

/// Frames a client may send: `{"event": ..., "data": ...}`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Heartbeat,
    JoinGroup(GroupRef),
    LeaveGroup(GroupRef),
    Typing(TypingRef),
    StopTyping(TypingRef),
    MessageDelivered(MessageIds),
    MessageSeen(MessageIds),
}

/// GET /ws?user=<phone>
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SocketParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let user = params.user.trim().to_string();
    if user.is_empty() {
        return Err(Error::ValidationFailed("user is required".into()));
    }
    info!("GET /ws - {}", user);
    Ok(ws.on_upgrade(move |socket| ws_connection(socket, state, user)))
}

async fn ws_connection(socket: WebSocket, state: AppState, user: String) {
    let (connection_id, mut outbound) = state.hub.register();
    state.coordinator.on_connect(&user, &connection_id).await;

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sink.send(WsMessage::Text(json.into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(e) => warn!("Dropping unserializable {} frame: {}", frame.event, e),
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&state.coordinator, &user, &connection_id, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sink.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Socket {} errored: {}", connection_id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.coordinator.on_disconnect(&connection_id).await;
    state.hub.unregister(&connection_id);
}

/// Decode and apply one inbound frame. Bad frames are logged and ignored.
pub async fn handle_frame(coordinator: &ChatCoordinator, user: &str, connection_id: &str, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Ignoring frame from {} ({}): {}", user, connection_id, e);
            return;
        }
    };
    debug!("{} sent {:?}", user, event);

    match event {
        ClientEvent::Heartbeat => {
            coordinator.heartbeat(user).await;
        }
        ClientEvent::JoinGroup(group) => {
            if let Err(e) = coordinator.join_group(connection_id, &group.group_id).await {
                warn!("{} could not join {}: {}", user, group.group_id, e);
            }
        }
        ClientEvent::LeaveGroup(group) => {
            if let Err(e) = coordinator.leave_group(connection_id, &group.group_id).await {
                warn!("{} could not leave {}: {}", user, group.group_id, e);
            }
        }
        ClientEvent::Typing(target) => coordinator.typing(user, &target.to, true).await,
        ClientEvent::StopTyping(target) => coordinator.typing(user, &target.to, false).await,
        ClientEvent::MessageDelivered(batch) => {
            let report = coordinator.mark_delivered(&batch.message_ids, user).await;
            if !report.is_complete() {
                warn!("{} delivery receipts failed for {}", report.failed.len(), user);
            }
        }
        ClientEvent::MessageSeen(batch) => {
            let report = coordinator.mark_seen(&batch.message_ids, user).await;
            if !report.is_complete() {
                warn!("{} seen receipts failed for {}", report.failed.len(), user);
            }
        }
    }
}
