//! Persistence adapters
//!
//! CRUD against persisted message and user records. No business logic lives
//! here: guards and state transitions belong to the lifecycle engine and the
//! presence tracker.

pub mod json_store;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
use crate::models::{Message, MessageStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use json_store::JsonMessageStore;
pub use sqlite::SqliteUserStore;

/// Predicate over message records: field equality plus `All`/`Not` combinators.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageFilter {
    Id(String),
    Sender(String),
    Recipient(String),
    Group(String),
    CreatedAt(DateTime<Utc>),
    /// Direct messages between two users, in either direction.
    Conversation(String, String),
    HiddenFor(String),
    /// Status strictly behind the given one.
    StatusBefore(MessageStatus),
    Tombstoned,
    All(Vec<MessageFilter>),
    Not(Box<MessageFilter>),
}

impl MessageFilter {
    /// The id this filter pins, if any, so stores can skip a scan.
    pub fn id_hint(&self) -> Option<&str> {
        match self {
            MessageFilter::Id(id) => Some(id),
            MessageFilter::All(filters) => filters.iter().find_map(|f| f.id_hint()),
            _ => None,
        }
    }

    pub fn matches(&self, msg: &Message) -> bool {
        match self {
            MessageFilter::Id(id) => &msg.id == id,
            MessageFilter::Sender(from) => &msg.from == from,
            MessageFilter::Recipient(to) => msg.to.as_ref() == Some(to),
            MessageFilter::Group(group) => msg.group_id.as_ref() == Some(group),
            MessageFilter::CreatedAt(ts) => {
                msg.timestamp.timestamp_millis() == ts.timestamp_millis()
            }
            MessageFilter::Conversation(a, b) => match msg.to.as_ref() {
                Some(to) => (&msg.from == a && to == b) || (&msg.from == b && to == a),
                None => false,
            },
            MessageFilter::HiddenFor(user) => msg.hidden_for.contains(user),
            MessageFilter::StatusBefore(status) => msg.status < *status,
            MessageFilter::Tombstoned => msg.deleted_for_everyone,
            MessageFilter::All(filters) => filters.iter().all(|f| f.matches(msg)),
            MessageFilter::Not(filter) => !filter.matches(msg),
        }
    }
}

/// Partial update applied atomically to one message record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub text: Option<String>,
    pub edited: Option<bool>,
    /// Added with set semantics; an id already present is left alone.
    pub hide_for: Option<String>,
    pub deleted_for_everyone: Option<bool>,
    pub clear_media: bool,
}

impl MessagePatch {
    pub fn apply(&self, msg: &mut Message) {
        if let Some(status) = self.status {
            msg.status = status;
        }
        if let Some(text) = &self.text {
            msg.text = Some(text.clone());
        }
        if let Some(edited) = self.edited {
            msg.edited = edited;
        }
        if let Some(user) = &self.hide_for {
            msg.hidden_for.insert(user.clone());
        }
        if let Some(deleted) = self.deleted_for_everyone {
            msg.deleted_for_everyone = deleted;
        }
        if self.clear_media {
            msg.media_url = None;
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, msg: Message) -> Result<Message>;

    async fn find_one(&self, filter: &MessageFilter) -> Result<Option<Message>>;

    /// Matching records sorted by creation time ascending.
    async fn find_many(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Applies `patch` to the first match and returns the updated record.
    async fn update_one(&self, filter: &MessageFilter, patch: MessagePatch)
        -> Result<Option<Message>>;

    async fn delete_one(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find(&self, phone: &str) -> Result<Option<User>>;

    /// The subset of `phones` that belong to registered users.
    async fn find_many(&self, phones: &[String]) -> Result<Vec<User>>;

    async fn create(&self, user: User) -> Result<User>;

    async fn set_presence(&self, phone: &str, online: bool, last_seen: DateTime<Utc>)
        -> Result<()>;

    /// Everyone but `phone`, sorted by name.
    async fn list_except(&self, phone: &str) -> Result<Vec<User>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageTarget;

    fn direct(from: &str, to: &str) -> Message {
        Message::new(from, MessageTarget::Direct(to.into()), Utc::now()).with_text("x")
    }

    #[test]
    fn conversation_matches_both_directions_only() {
        let filter = MessageFilter::Conversation("A".into(), "B".into());
        assert!(filter.matches(&direct("A", "B")));
        assert!(filter.matches(&direct("B", "A")));
        assert!(!filter.matches(&direct("A", "C")));

        let group = Message::new("A", MessageTarget::Group("G".into()), Utc::now());
        assert!(!filter.matches(&group));
    }

    #[test]
    fn combinators_compose() {
        let mut msg = direct("A", "B");
        msg.hidden_for.insert("A".into());

        let visible_to_a = MessageFilter::All(vec![
            MessageFilter::Conversation("A".into(), "B".into()),
            MessageFilter::Not(Box::new(MessageFilter::HiddenFor("A".into()))),
        ]);
        assert!(!visible_to_a.matches(&msg));

        let sent_by_a = MessageFilter::All(vec![
            MessageFilter::Sender("A".into()),
            MessageFilter::Recipient("B".into()),
        ]);
        assert!(sent_by_a.matches(&msg));
        assert!(!MessageFilter::All(vec![
            MessageFilter::Sender("B".into()),
            MessageFilter::Recipient("A".into()),
        ])
        .matches(&msg));
    }

    #[test]
    fn hide_for_has_set_semantics() {
        let mut msg = direct("A", "B");
        let patch = MessagePatch {
            hide_for: Some("B".into()),
            ..Default::default()
        };
        patch.apply(&mut msg);
        patch.apply(&mut msg);
        assert_eq!(msg.hidden_for.len(), 1);
    }
}
