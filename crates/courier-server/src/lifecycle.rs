//! Message lifecycle engine
//!
//! Validates and executes create, status transitions, edit and the two
//! delete flavours. The engine owns no state: every record is read and
//! written through the [`MessageStore`], and every mutation is a single
//! conditional update so concurrent transitions cannot regress a record.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{
    Conversation, Message, MessageLocator, MessageStatus, MessageTarget, SendMessageInput,
    StatusFailure, StatusReport, TOMBSTONE_TEXT,
};
use crate::store::{MessageFilter, MessagePatch, MessageStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How long after creation a sender may still edit or delete for everyone.
/// Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationWindows {
    pub edit: Duration,
    pub delete: Duration,
}

impl Default for MutationWindows {
    fn default() -> Self {
        Self {
            edit: Duration::milliseconds(60_000),
            delete: Duration::milliseconds(1_800_000),
        }
    }
}

/// Result of a status batch: the per-id report plus the records that moved.
#[derive(Debug, Clone, Default)]
pub struct StatusBatch {
    pub report: StatusReport,
    pub transitioned: Vec<Message>,
}

pub struct MessageEngine {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    windows: MutationWindows,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl MessageEngine {
    pub fn new(store: Arc<dyn MessageStore>, clock: Arc<dyn Clock>, windows: MutationWindows) -> Self {
        Self {
            store,
            clock,
            windows,
        }
    }

    /// Check a send request and work out where it is addressed.
    pub fn validate(input: &SendMessageInput) -> Result<MessageTarget> {
        if input.from.trim().is_empty() {
            return Err(Error::ValidationFailed("sender is required".into()));
        }
        let target = match (non_empty(input.to.clone()), non_empty(input.group_id.clone())) {
            (Some(to), None) => MessageTarget::Direct(to),
            (None, Some(group)) => MessageTarget::Group(group),
            (Some(_), Some(_)) => {
                return Err(Error::ValidationFailed(
                    "a message goes to a recipient or a group, not both".into(),
                ))
            }
            (None, None) => {
                return Err(Error::ValidationFailed(
                    "a recipient or a group is required".into(),
                ))
            }
        };
        if non_empty(input.text.clone()).is_none() && non_empty(input.media_url.clone()).is_none() {
            return Err(Error::ValidationFailed("text or media is required".into()));
        }
        Ok(target)
    }

    /// Persist a new message. `delivered` is decided by the caller from live presence.
    pub async fn create(&self, input: SendMessageInput, delivered: bool) -> Result<Message> {
        let target = Self::validate(&input)?;

        for reference in [&input.reply_to, &input.forward_of].into_iter().flatten() {
            if self
                .store
                .find_one(&MessageFilter::Id(reference.clone()))
                .await?
                .is_none()
            {
                return Err(Error::NotFound(format!("referenced message {}", reference)));
            }
        }

        // Stored timestamps carry millisecond precision; keep memory identical.
        let now = self.clock.now();
        let created_at = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);

        let mut msg = Message::new(input.from, target, created_at);
        msg.text = non_empty(input.text);
        msg.media_url = non_empty(input.media_url);
        msg.reply_to = input.reply_to;
        msg.forward_of = input.forward_of;
        if delivered {
            msg.status = MessageStatus::Delivered;
        }

        let msg = self.store.create(msg).await?;
        info!("Created message {} from {} ({})", msg.id, msg.from, msg.status);
        Ok(msg)
    }

    /// Resolve a locator to a record. A legacy key prefers the exact
    /// `from -> to` message and only then tries the reversed direction.
    pub async fn find(&self, locator: &MessageLocator) -> Result<Message> {
        let not_found = || Error::NotFound(locator.to_string());
        let (from, to, timestamp_ms) = match locator {
            MessageLocator::Id(id) => {
                return self
                    .store
                    .find_one(&MessageFilter::Id(id.clone()))
                    .await?
                    .ok_or_else(not_found)
            }
            MessageLocator::Key {
                from,
                to,
                timestamp_ms,
            } => (from, to, *timestamp_ms),
        };
        let created_at = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(not_found)?;

        for (sender, recipient) in [(from, to), (to, from)] {
            let filter = MessageFilter::All(vec![
                MessageFilter::Sender(sender.clone()),
                MessageFilter::Recipient(recipient.clone()),
                MessageFilter::CreatedAt(created_at),
            ]);
            if let Some(msg) = self.store.find_one(&filter).await? {
                return Ok(msg);
            }
        }
        Err(not_found())
    }

    /// Recipient acknowledged receipt.
    pub async fn mark_delivered(&self, ids: &[String], viewer: &str) -> StatusBatch {
        self.advance_batch(ids, viewer, MessageStatus::Delivered).await
    }

    /// Recipient viewed the messages. May jump straight from sent to seen.
    pub async fn mark_seen(&self, ids: &[String], viewer: &str) -> StatusBatch {
        self.advance_batch(ids, viewer, MessageStatus::Seen).await
    }

    async fn advance_batch(&self, ids: &[String], viewer: &str, target: MessageStatus) -> StatusBatch {
        let mut batch = StatusBatch::default();
        for id in ids {
            match self.advance_one(id, viewer, target).await {
                Ok(Some(msg)) => {
                    batch.report.updated.push(id.clone());
                    batch.transitioned.push(msg);
                }
                Ok(None) => batch.report.unchanged.push(id.clone()),
                Err(e) => {
                    warn!("Status {} for {} by {} failed: {}", target, id, viewer, e);
                    batch.report.failed.push(StatusFailure {
                        id: id.clone(),
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        debug!(
            "{} batch by {}: {} updated, {} unchanged, {} failed",
            target,
            viewer,
            batch.report.updated.len(),
            batch.report.unchanged.len(),
            batch.report.failed.len()
        );
        batch
    }

    async fn advance_one(
        &self,
        id: &str,
        viewer: &str,
        target: MessageStatus,
    ) -> Result<Option<Message>> {
        let msg = self.find(&MessageLocator::Id(id.to_string())).await?;
        if msg.to.as_deref() != Some(viewer) {
            return Err(Error::Forbidden(format!(
                "message {} is not addressed to {}",
                id, viewer
            )));
        }
        if msg.status.advance_to(target).is_none() {
            return Ok(None);
        }

        // Only applies while the record is still behind `target`.
        let guard = MessageFilter::All(vec![
            MessageFilter::Id(id.to_string()),
            MessageFilter::StatusBefore(target),
        ]);
        self.store
            .update_one(
                &guard,
                MessagePatch {
                    status: Some(target),
                    ..Default::default()
                },
            )
            .await
    }

    fn check_window(&self, msg: &Message, window: Duration, operation: &'static str) -> Result<()> {
        let elapsed = self.clock.now() - msg.timestamp;
        if elapsed > window {
            return Err(Error::WindowExpired {
                operation,
                window_ms: window.num_milliseconds(),
            });
        }
        Ok(())
    }

    pub async fn edit(&self, locator: &MessageLocator, actor: &str, new_text: &str) -> Result<Message> {
        if new_text.trim().is_empty() {
            return Err(Error::ValidationFailed("new text is required".into()));
        }

        let msg = self.find(locator).await?;
        if msg.from != actor {
            return Err(Error::Forbidden(format!(
                "only the sender may edit message {}",
                msg.id
            )));
        }
        if msg.deleted_for_everyone {
            return Err(Error::Forbidden(format!("message {} was deleted", msg.id)));
        }
        self.check_window(&msg, self.windows.edit, "edit")?;

        let guard = MessageFilter::All(vec![
            MessageFilter::Id(msg.id.clone()),
            MessageFilter::Not(Box::new(MessageFilter::Tombstoned)),
        ]);
        let patch = MessagePatch {
            text: Some(new_text.to_string()),
            edited: Some(true),
            ..Default::default()
        };
        let updated = self
            .store
            .update_one(&guard, patch)
            .await?
            .ok_or_else(|| Error::Forbidden(format!("message {} was deleted", msg.id)))?;

        info!("Message {} edited by {}", updated.id, actor);
        Ok(updated)
    }

    /// Hide a message from `actor`'s own history. Idempotent.
    pub async fn delete_for_me(&self, locator: &MessageLocator, actor: &str) -> Result<Message> {
        let msg = self.find(locator).await?;
        if msg.group_id.is_none() && !msg.involves(actor) {
            return Err(Error::Forbidden(format!(
                "{} is not part of message {}",
                actor, msg.id
            )));
        }
        if msg.is_hidden_for(actor) {
            return Ok(msg);
        }

        let patch = MessagePatch {
            hide_for: Some(actor.to_string()),
            ..Default::default()
        };
        let updated = self
            .store
            .update_one(&MessageFilter::Id(msg.id.clone()), patch)
            .await?
            .ok_or_else(|| Error::NotFound(locator.to_string()))?;

        debug!("Message {} hidden for {}", updated.id, actor);
        Ok(updated)
    }

    /// Replace the message with a tombstone for every viewer. The record is kept.
    pub async fn delete_for_everyone(&self, locator: &MessageLocator, actor: &str) -> Result<Message> {
        let msg = self.find(locator).await?;
        if msg.from != actor {
            return Err(Error::Forbidden(format!(
                "only the sender may delete message {} for everyone",
                msg.id
            )));
        }
        if msg.deleted_for_everyone {
            return Ok(msg);
        }
        self.check_window(&msg, self.windows.delete, "delete-for-everyone")?;

        let patch = MessagePatch {
            text: Some(TOMBSTONE_TEXT.to_string()),
            deleted_for_everyone: Some(true),
            clear_media: true,
            ..Default::default()
        };
        let updated = self
            .store
            .update_one(&MessageFilter::Id(msg.id.clone()), patch)
            .await?
            .ok_or_else(|| Error::NotFound(locator.to_string()))?;

        info!("Message {} deleted for everyone by {}", updated.id, actor);
        Ok(updated)
    }

    /// Conversation history in creation order, minus what `viewer` hid for themselves.
    pub async fn history(&self, conversation: &Conversation, viewer: &str) -> Result<Vec<Message>> {
        let scope = match conversation {
            Conversation::Direct(a, b) => {
                if viewer != a && viewer != b {
                    return Err(Error::Forbidden(format!(
                        "{} is not part of the conversation",
                        viewer
                    )));
                }
                MessageFilter::Conversation(a.clone(), b.clone())
            }
            Conversation::Group(group) => MessageFilter::Group(group.clone()),
        };
        let filter = MessageFilter::All(vec![
            scope,
            MessageFilter::Not(Box::new(MessageFilter::HiddenFor(viewer.to_string()))),
        ]);
        self.store.find_many(&filter).await
    }
}
