//! Event router
//!
//! Turns a lifecycle or presence transition into the list of live
//! notifications it causes, then hands them to the transport. Routing is a
//! pure function so the rules can be tested without sockets; emission is
//! best-effort and never fails the operation that triggered it.

use crate::models::{Message, MessageTarget};
use crate::presence::PresenceChange;
use crate::transport::Transport;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const RECEIVE_MESSAGE: &str = "receive-message";
pub const MESSAGE_STATUS: &str = "message-status";
pub const MESSAGE_EDITED: &str = "message-edited";
pub const MESSAGE_DELETED: &str = "message-deleted";
pub const USER_ONLINE: &str = "user-online";
pub const USER_OFFLINE: &str = "user-offline";
pub const TYPING: &str = "typing";
pub const STOP_TYPING: &str = "stop-typing";

/// A user's personal room. Every socket of the user joins it.
pub fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

pub fn group_room(group_id: &str) -> String {
    format!("group:{}", group_id)
}

/// State changes that produce live notifications.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageCreated(Message),
    StatusChanged(Message),
    MessageEdited(Message),
    MessageDeleted(Message),
    Presence(PresenceChange),
    Typing {
        from: String,
        to: String,
        typing: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Room(String),
    /// Every connected socket but the one that caused the change.
    AllExcept(Option<String>),
}

/// One notification to emit.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub destination: Destination,
    pub event: &'static str,
    pub payload: Value,
}

fn message_payload(msg: &Message) -> Value {
    serde_json::to_value(msg).unwrap_or_default()
}

/// Room of whoever is on the other side of `msg` from its sender.
fn counterpart_room(msg: &Message) -> Option<String> {
    match msg.target()? {
        MessageTarget::Direct(to) => Some(user_room(&to)),
        MessageTarget::Group(group) => Some(group_room(&group)),
    }
}

/// Destinations for `event`, one dispatch per destination.
pub fn route(event: &ChatEvent) -> Vec<Dispatch> {
    match event {
        // Direct: recipient only, the sender renders optimistically.
        // Group: the whole room, sender included.
        ChatEvent::MessageCreated(msg) => counterpart_room(msg)
            .map(|room| Dispatch {
                destination: Destination::Room(room),
                event: RECEIVE_MESSAGE,
                payload: message_payload(msg),
            })
            .into_iter()
            .collect(),

        ChatEvent::StatusChanged(msg) => vec![Dispatch {
            destination: Destination::Room(user_room(&msg.from)),
            event: MESSAGE_STATUS,
            payload: json!({
                "messageId": msg.id,
                "status": msg.status,
                "to": msg.to,
            }),
        }],

        ChatEvent::MessageEdited(msg) | ChatEvent::MessageDeleted(msg) => {
            let name = if matches!(event, ChatEvent::MessageEdited(_)) {
                MESSAGE_EDITED
            } else {
                MESSAGE_DELETED
            };
            counterpart_room(msg)
                .map(|room| Dispatch {
                    destination: Destination::Room(room),
                    event: name,
                    payload: message_payload(msg),
                })
                .into_iter()
                .collect()
        }

        ChatEvent::Presence(change) => vec![Dispatch {
            destination: Destination::AllExcept(change.connection_id.clone()),
            event: if change.online { USER_ONLINE } else { USER_OFFLINE },
            payload: json!({
                "userId": change.user_id,
                "online": change.online,
                "lastSeen": change.last_seen,
            }),
        }],

        ChatEvent::Typing { from, to, typing } => vec![Dispatch {
            destination: Destination::Room(user_room(to)),
            event: if *typing { TYPING } else { STOP_TYPING },
            payload: json!({ "from": from, "to": to }),
        }],
    }
}

/// Emits routed events through a transport.
pub struct EventRouter {
    transport: Arc<dyn Transport>,
}

impl EventRouter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, event: ChatEvent) -> usize {
        self.dispatch(route(&event)).await
    }

    /// Send every dispatch. Failures are logged and dropped; offline
    /// recipients catch up through history. Returns sockets reached.
    pub async fn dispatch(&self, dispatches: Vec<Dispatch>) -> usize {
        let mut reached = 0;
        for dispatch in dispatches {
            let result = match &dispatch.destination {
                Destination::Room(room) => {
                    self.transport
                        .emit_to_room(room, dispatch.event, &dispatch.payload)
                        .await
                }
                Destination::AllExcept(origin) => {
                    self.transport
                        .broadcast_except(origin.as_deref(), dispatch.event, &dispatch.payload)
                        .await
                }
            };
            match result {
                Ok(count) => {
                    debug!(
                        "{} -> {:?} reached {} sockets",
                        dispatch.event, dispatch.destination, count
                    );
                    reached += count;
                }
                Err(e) => warn!("Failed to emit {}: {}", dispatch.event, e),
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageStatus;
    use chrono::Utc;

    fn direct() -> Message {
        Message::new("A", MessageTarget::Direct("B".into()), Utc::now()).with_text("hi")
    }

    fn group() -> Message {
        Message::new("A", MessageTarget::Group("G".into()), Utc::now()).with_text("all")
    }

    fn rooms(dispatches: &[Dispatch]) -> Vec<Destination> {
        dispatches.iter().map(|d| d.destination.clone()).collect()
    }

    #[test]
    fn direct_send_goes_to_recipient_only() {
        let out = route(&ChatEvent::MessageCreated(direct()));
        assert_eq!(rooms(&out), vec![Destination::Room("user:B".into())]);
        assert_eq!(out[0].event, RECEIVE_MESSAGE);
    }

    #[test]
    fn group_send_goes_to_group_room_once() {
        let out = route(&ChatEvent::MessageCreated(group()));
        assert_eq!(rooms(&out), vec![Destination::Room("group:G".into())]);
    }

    #[test]
    fn status_goes_back_to_sender() {
        let mut msg = direct();
        msg.status = MessageStatus::Seen;
        let out = route(&ChatEvent::StatusChanged(msg.clone()));
        assert_eq!(rooms(&out), vec![Destination::Room("user:A".into())]);
        assert_eq!(out[0].payload["messageId"], msg.id);
        assert_eq!(out[0].payload["status"], "seen");
    }

    #[test]
    fn edits_and_deletes_go_to_counterpart() {
        let edited = route(&ChatEvent::MessageEdited(direct()));
        assert_eq!(rooms(&edited), vec![Destination::Room("user:B".into())]);
        assert_eq!(edited[0].event, MESSAGE_EDITED);

        let deleted = route(&ChatEvent::MessageDeleted(group()));
        assert_eq!(rooms(&deleted), vec![Destination::Room("group:G".into())]);
        assert_eq!(deleted[0].event, MESSAGE_DELETED);
    }

    #[test]
    fn presence_broadcasts_except_origin() {
        let change = PresenceChange {
            user_id: "A".into(),
            online: false,
            last_seen: Utc::now(),
            connection_id: Some("c1".into()),
        };
        let out = route(&ChatEvent::Presence(change));
        assert_eq!(rooms(&out), vec![Destination::AllExcept(Some("c1".into()))]);
        assert_eq!(out[0].event, USER_OFFLINE);
        assert_eq!(out[0].payload["userId"], "A");
    }

    #[test]
    fn typing_targets_addressed_user() {
        let out = route(&ChatEvent::Typing {
            from: "A".into(),
            to: "B".into(),
            typing: false,
        });
        assert_eq!(rooms(&out), vec![Destination::Room("user:B".into())]);
        assert_eq!(out[0].event, STOP_TYPING);
    }
}
