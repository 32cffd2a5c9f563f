//! Real-time transport
//!
//! Room-based publish/subscribe over live sockets. [`SocketHub`] is the
//! in-process implementation backing the WebSocket endpoint: every socket
//! owns an unbounded channel, and rooms are sets of socket ids.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One event as written to a socket: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    pub event: String,
    pub data: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn join(&self, connection_id: &str, room: &str) -> Result<()>;

    async fn leave(&self, connection_id: &str, room: &str) -> Result<()>;

    /// Send to every socket in `room`. Returns how many sockets received it.
    async fn emit_to_room(&self, room: &str, event: &str, payload: &Value) -> Result<usize>;

    /// Send to every socket except `except`.
    async fn broadcast_except(
        &self,
        except: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<usize>;

    /// Sockets currently joined to `room`.
    fn room_connections(&self, room: &str) -> Vec<String>;
}

#[derive(Default)]
struct HubState {
    sockets: HashMap<String, mpsc::UnboundedSender<OutboundFrame>>,
    rooms: HashMap<String, BTreeSet<String>>,
    /// socket id -> rooms it joined
    memberships: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct SocketHub {
    state: RwLock<HubState>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new socket under a fresh id.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<OutboundFrame>) {
        let connection_id = Uuid::new_v4().to_string();
        let rx = self.register_with_id(&connection_id);
        (connection_id, rx)
    }

    pub fn register_with_id(&self, connection_id: &str) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.write().sockets.insert(connection_id.to_string(), tx);
        debug!("Socket {} registered", connection_id);
        rx
    }

    /// Forget a socket and every room it was in.
    pub fn unregister(&self, connection_id: &str) {
        let mut state = self.state.write();
        state.sockets.remove(connection_id);
        if let Some(rooms) = state.memberships.remove(connection_id) {
            for room in rooms {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.remove(connection_id);
                    if members.is_empty() {
                        state.rooms.remove(&room);
                    }
                }
            }
        }
        debug!("Socket {} unregistered", connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().sockets.len()
    }

    fn send_all<'a>(
        &self,
        targets: impl Iterator<Item = (&'a String, &'a mpsc::UnboundedSender<OutboundFrame>)>,
        event: &str,
        payload: &Value,
    ) -> Result<usize> {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (connection_id, tx) in targets {
            let frame = OutboundFrame {
                event: event.to_string(),
                data: payload.clone(),
            };
            if tx.send(frame).is_ok() {
                delivered += 1;
            } else {
                closed.push(connection_id.clone());
            }
        }
        if closed.is_empty() {
            Ok(delivered)
        } else {
            Err(Error::TransportUnavailable(format!(
                "{} delivered to {} sockets, closed: {}",
                event,
                delivered,
                closed.join(", ")
            )))
        }
    }
}

#[async_trait]
impl Transport for SocketHub {
    async fn join(&self, connection_id: &str, room: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.sockets.contains_key(connection_id) {
            return Err(Error::TransportUnavailable(format!(
                "socket {} is not connected",
                connection_id
            )));
        }
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        state
            .memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(room.to_string());
        Ok(())
    }

    async fn leave(&self, connection_id: &str, room: &str) -> Result<()> {
        let mut state = self.state.write();
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(connection_id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
        if let Some(rooms) = state.memberships.get_mut(connection_id) {
            rooms.remove(room);
        }
        Ok(())
    }

    async fn emit_to_room(&self, room: &str, event: &str, payload: &Value) -> Result<usize> {
        let state = self.state.read();
        let Some(members) = state.rooms.get(room) else {
            return Ok(0);
        };
        let targets = members
            .iter()
            .filter_map(|id| state.sockets.get_key_value(id));
        self.send_all(targets, event, payload)
    }

    async fn broadcast_except(
        &self,
        except: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<usize> {
        let state = self.state.read();
        let targets = state
            .sockets
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != except);
        self.send_all(targets, event, payload)
    }

    fn room_connections(&self, room: &str) -> Vec<String> {
        self.state
            .read()
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_room_emit_reaches_members_once() {
        let hub = SocketHub::new();
        let mut a = hub.register_with_id("a");
        let mut b = hub.register_with_id("b");
        let mut c = hub.register_with_id("c");

        hub.join("a", "group:G").await.unwrap();
        hub.join("b", "group:G").await.unwrap();
        hub.join("b", "group:G").await.unwrap();

        let sent = hub
            .emit_to_room("group:G", "receive-message", &json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(a.try_recv().unwrap().event, "receive-message");
        assert_eq!(b.try_recv().unwrap().data["text"], "hi");
        assert!(b.try_recv().is_err());
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let hub = SocketHub::new();
        let mut a = hub.register_with_id("a");
        let mut b = hub.register_with_id("b");

        let sent = hub
            .broadcast_except(Some("a"), "user-online", &json!({"userId": "A"}))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap().event, "user-online");
    }

    #[tokio::test]
    async fn test_emit_to_empty_room_is_dropped() {
        let hub = SocketHub::new();
        let sent = hub
            .emit_to_room("user:nobody", "typing", &json!({}))
            .await
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_closed_socket_reports_unavailable() {
        let hub = SocketHub::new();
        let rx = hub.register_with_id("gone");
        let mut alive = hub.register_with_id("alive");
        hub.join("gone", "r").await.unwrap();
        hub.join("alive", "r").await.unwrap();
        drop(rx);

        let err = hub.emit_to_room("r", "e", &json!(1)).await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
        // The live socket still got it.
        assert!(alive.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unregister_leaves_rooms() {
        let hub = SocketHub::new();
        let _rx = hub.register_with_id("a");
        hub.join("a", "r1").await.unwrap();
        hub.join("a", "r2").await.unwrap();
        assert_eq!(hub.room_connections("r1"), vec!["a".to_string()]);

        hub.unregister("a");
        assert!(hub.room_connections("r1").is_empty());
        assert!(hub.room_connections("r2").is_empty());
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.join("a", "r1").await.is_err());
    }
}
