use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Text written over a message deleted for everyone.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

/// A registered account. The phone number is the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(phone: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            phone: phone.into(),
            name: name.into(),
            email: None,
            avatar_url: None,
            online: false,
            last_seen: now,
            created_at: now,
        }
    }
}

/// Delivery progress. Ordered so that `Sent < Delivered < Seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Seen,
}

impl MessageStatus {
    /// Returns `next` if it is strictly ahead of `self`. Skipping a step is allowed.
    pub fn advance_to(self, next: MessageStatus) -> Option<MessageStatus> {
        (next > self).then_some(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Seen => "seen",
        }
    }
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Sent
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a message is addressed. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    Direct(String),
    Group(String),
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: Option<String>,
    pub group_id: Option<String>,
    pub text: Option<String>,
    pub media_url: Option<String>,
    /// Creation time, serialized as epoch milliseconds like the legacy clients expect.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    pub reply_to: Option<String>,
    pub forward_of: Option<String>,
    #[serde(default)]
    pub deleted_for_everyone: bool,
    /// Viewers who deleted this message for themselves.
    #[serde(default)]
    pub hidden_for: BTreeSet<String>,
    #[serde(default)]
    pub edited: bool,
}

impl Message {
    pub fn new(from: impl Into<String>, target: MessageTarget, timestamp: DateTime<Utc>) -> Self {
        let (to, group_id) = match target {
            MessageTarget::Direct(to) => (Some(to), None),
            MessageTarget::Group(group) => (None, Some(group)),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to,
            group_id,
            text: None,
            media_url: None,
            timestamp,
            status: MessageStatus::Sent,
            reply_to: None,
            forward_of: None,
            deleted_for_everyone: false,
            hidden_for: BTreeSet::new(),
            edited: false,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn target(&self) -> Option<MessageTarget> {
        match (&self.to, &self.group_id) {
            (Some(to), None) => Some(MessageTarget::Direct(to.clone())),
            (None, Some(group)) => Some(MessageTarget::Group(group.clone())),
            _ => None,
        }
    }

    pub fn is_hidden_for(&self, viewer: &str) -> bool {
        self.hidden_for.contains(viewer)
    }

    /// Sender or direct recipient.
    pub fn involves(&self, user: &str) -> bool {
        self.from == user || self.to.as_deref() == Some(user)
    }
}

/// Ways callers name a message: by id, or by the legacy `(from, to, timestamp)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageLocator {
    Id(String),
    Key {
        from: String,
        to: String,
        timestamp_ms: i64,
    },
}

impl fmt::Display for MessageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLocator::Id(id) => write!(f, "message {}", id),
            MessageLocator::Key {
                from,
                to,
                timestamp_ms,
            } => write!(f, "message {}->{} at {}", from, to, timestamp_ms),
        }
    }
}

/// A conversation whose history can be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    Direct(String, String),
    Group(String),
}

// ========== Request bodies ==========

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageInput {
    pub from: String,
    pub to: Option<String>,
    pub group_id: Option<String>,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub reply_to: Option<String>,
    pub forward_of: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBatchInput {
    pub message_ids: Vec<String>,
    pub viewer: String,
}

/// Optional locator fields shared by the mutation bodies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatorInput {
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub timestamp: Option<i64>,
}

impl LocatorInput {
    pub fn locator(&self) -> Option<MessageLocator> {
        if let Some(id) = &self.message_id {
            return Some(MessageLocator::Id(id.clone()));
        }
        match (&self.from, &self.to, self.timestamp) {
            (Some(from), Some(to), Some(timestamp_ms)) => Some(MessageLocator::Key {
                from: from.clone(),
                to: to.clone(),
                timestamp_ms,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditInput {
    #[serde(flatten)]
    pub locator: LocatorInput,
    /// Acting user; defaults to `from`.
    pub actor: Option<String>,
    pub new_text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteForMeInput {
    #[serde(flatten)]
    pub locator: LocatorInput,
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteForEveryoneInput {
    #[serde(flatten)]
    pub locator: LocatorInput,
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    pub viewer: Option<String>,
}

/// Per-id outcome of a status batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<StatusFailure>,
}

impl StatusReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusFailure {
    pub id: String,
    pub kind: String,
    pub message: String,
}

/// Stored alongside an uploaded media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub hash: String,
    pub url: String,
    pub content_type: String,
    pub filename: String,
    pub size: u64,
}
