//! Chat coordinator
//!
//! Composition root for the real-time core. Socket events and HTTP
//! operations land here; the coordinator runs them against the presence
//! tracker or the lifecycle engine and publishes the resulting transitions
//! through the event router.

use crate::error::{Error, Result};
use crate::lifecycle::MessageEngine;
use crate::models::{
    Conversation, Message, MessageLocator, MessageTarget, SendMessageInput, StatusReport, User,
};
use crate::presence::{LastSeen, PresenceChange, PresenceTracker};
use crate::router::{group_room, user_room, ChatEvent, EventRouter};
use crate::store::UserStore;
use crate::transport::Transport;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ChatCoordinator {
    presence: Arc<PresenceTracker>,
    engine: MessageEngine,
    events: EventRouter,
    transport: Arc<dyn Transport>,
    users: Arc<dyn UserStore>,
}

impl ChatCoordinator {
    pub fn new(
        presence: Arc<PresenceTracker>,
        engine: MessageEngine,
        transport: Arc<dyn Transport>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            presence,
            engine,
            events: EventRouter::new(transport.clone()),
            transport,
            users,
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    // ========== Socket events ==========

    /// A socket opened for `user_id`: join the personal room and go online.
    pub async fn on_connect(&self, user_id: &str, connection_id: &str) -> PresenceChange {
        if let Err(e) = self.transport.join(connection_id, &user_room(user_id)).await {
            warn!("Socket {} could not join room of {}: {}", connection_id, user_id, e);
        }
        let change = self.presence.connect(user_id, connection_id).await;
        info!("{} connected on {}", user_id, connection_id);
        self.events.publish(ChatEvent::Presence(change.clone())).await;
        change
    }

    /// A socket closed. Announces the user only when it was their last one.
    pub async fn on_disconnect(&self, connection_id: &str) -> Option<PresenceChange> {
        let change = self.presence.disconnect(connection_id).await;
        match &change {
            Some(change) => {
                info!("{} went offline", change.user_id);
                self.events.publish(ChatEvent::Presence(change.clone())).await;
            }
            None => debug!("Socket {} closed, no presence change", connection_id),
        }
        change
    }

    /// Refresh last-seen. Never notifies anyone.
    pub async fn heartbeat(&self, user_id: &str) -> bool {
        self.presence.heartbeat(user_id).await
    }

    pub async fn join_group(&self, connection_id: &str, group_id: &str) -> Result<()> {
        self.transport.join(connection_id, &group_room(group_id)).await?;
        debug!("Socket {} joined group {}", connection_id, group_id);
        Ok(())
    }

    pub async fn leave_group(&self, connection_id: &str, group_id: &str) -> Result<()> {
        self.transport.leave(connection_id, &group_room(group_id)).await
    }

    /// Ephemeral; dropped when the addressee is offline.
    pub async fn typing(&self, from: &str, to: &str, typing: bool) {
        self.events
            .publish(ChatEvent::Typing {
                from: from.to_string(),
                to: to.to_string(),
                typing,
            })
            .await;
    }

    /// Expire lapsed heartbeat leases and announce the users that went offline.
    pub async fn sweep_presence(&self) -> usize {
        let expired = self.presence.sweep_expired().await;
        for change in &expired {
            info!("Heartbeat lease for {} lapsed", change.user_id);
            self.events.publish(ChatEvent::Presence(change.clone())).await;
        }
        expired.len()
    }

    // ========== Message lifecycle ==========

    /// Whether the target can see the message right now.
    fn reachable(&self, from: &str, target: &MessageTarget) -> bool {
        match target {
            MessageTarget::Direct(to) => !self.presence.connections_of(to).is_empty(),
            MessageTarget::Group(group) => self
                .transport
                .room_connections(&group_room(group))
                .iter()
                .filter_map(|conn| self.presence.user_for_connection(conn))
                .any(|member| member != from),
        }
    }

    pub async fn send_message(&self, input: SendMessageInput) -> Result<Message> {
        let target = MessageEngine::validate(&input)?;
        let delivered = self.reachable(&input.from, &target);
        let msg = self.engine.create(input, delivered).await?;
        self.events.publish(ChatEvent::MessageCreated(msg.clone())).await;
        Ok(msg)
    }

    pub async fn mark_seen(&self, ids: &[String], viewer: &str) -> StatusReport {
        let batch = self.engine.mark_seen(ids, viewer).await;
        for msg in batch.transitioned {
            self.events.publish(ChatEvent::StatusChanged(msg)).await;
        }
        batch.report
    }

    pub async fn mark_delivered(&self, ids: &[String], viewer: &str) -> StatusReport {
        let batch = self.engine.mark_delivered(ids, viewer).await;
        for msg in batch.transitioned {
            self.events.publish(ChatEvent::StatusChanged(msg)).await;
        }
        batch.report
    }

    pub async fn edit(&self, locator: &MessageLocator, actor: &str, new_text: &str) -> Result<Message> {
        let msg = self.engine.edit(locator, actor, new_text).await?;
        self.events.publish(ChatEvent::MessageEdited(msg.clone())).await;
        Ok(msg)
    }

    /// Per-viewer, so nobody else is told.
    pub async fn delete_for_me(&self, locator: &MessageLocator, actor: &str) -> Result<Message> {
        self.engine.delete_for_me(locator, actor).await
    }

    pub async fn delete_for_everyone(&self, locator: &MessageLocator, actor: &str) -> Result<Message> {
        let msg = self.engine.delete_for_everyone(locator, actor).await?;
        self.events.publish(ChatEvent::MessageDeleted(msg.clone())).await;
        Ok(msg)
    }

    pub async fn history(&self, conversation: &Conversation, viewer: &str) -> Result<Vec<Message>> {
        self.engine.history(conversation, viewer).await
    }

    // ========== Users and presence ==========

    /// The registered subset of `phones`.
    pub async fn check_contacts(&self, phones: &[String]) -> Result<Vec<User>> {
        let unique: Vec<String> = phones
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut users = self.users.find_many(&unique).await?;
        self.overlay_presence(&mut users);
        Ok(users)
    }

    /// Everyone registered except `phone`.
    pub async fn contacts_of(&self, phone: &str) -> Result<Vec<User>> {
        if self.users.find(phone).await?.is_none() {
            return Err(Error::NotFound(format!("user {}", phone)));
        }
        let mut users = self.users.list_except(phone).await?;
        self.overlay_presence(&mut users);
        Ok(users)
    }

    /// The tracker is authoritative over the mirrored flag.
    fn overlay_presence(&self, users: &mut [User]) {
        for user in users {
            user.online = self.presence.is_online(&user.phone);
            if let Some(entry) = self.presence.entry(&user.phone) {
                user.last_seen = entry.last_seen;
            }
        }
    }

    pub async fn last_seen(&self, user_id: &str) -> LastSeen {
        self.presence.last_seen(user_id).await
    }

    pub fn online_users(&self) -> Vec<String> {
        self.presence.query_online()
    }

    pub fn shutdown(&self) {
        self.presence.clear();
        info!("Presence table cleared");
    }
}
