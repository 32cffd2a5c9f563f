//! In-memory stores for unit tests.

use super::{MessageFilter, MessagePatch, MessageStore, UserStore};
use crate::error::{Error, Result};
use crate::models::{Message, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, User>>,
    fail: bool,
}

impl MemoryUserStore {
    pub fn with_users(users: Vec<User>) -> Self {
        Self {
            users: Mutex::new(users.into_iter().map(|u| (u.phone.clone(), u)).collect()),
            fail: false,
        }
    }

    /// Every call fails with `StoreUnavailable`.
    pub fn failing() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            fail: true,
        }
    }

    pub fn get(&self, phone: &str) -> Option<User> {
        self.users.lock().get(phone).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            Err(Error::StoreUnavailable("user store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find(&self, phone: &str) -> Result<Option<User>> {
        self.check()?;
        Ok(self.get(phone))
    }

    async fn find_many(&self, phones: &[String]) -> Result<Vec<User>> {
        self.check()?;
        let users = self.users.lock();
        let mut found: Vec<User> = phones.iter().filter_map(|p| users.get(p).cloned()).collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn create(&self, user: User) -> Result<User> {
        self.check()?;
        let mut users = self.users.lock();
        if users.contains_key(&user.phone) {
            return Err(Error::ValidationFailed("already registered".into()));
        }
        users.insert(user.phone.clone(), user.clone());
        Ok(user)
    }

    async fn set_presence(
        &self,
        phone: &str,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        let mut users = self.users.lock();
        let user = users
            .get_mut(phone)
            .ok_or_else(|| Error::NotFound(format!("user {}", phone)))?;
        user.online = online;
        user.last_seen = last_seen;
        Ok(())
    }

    async fn list_except(&self, phone: &str) -> Result<Vec<User>> {
        self.check()?;
        let mut others: Vec<User> = self
            .users
            .lock()
            .values()
            .filter(|u| u.phone != phone)
            .cloned()
            .collect();
        others.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(others)
    }
}

/// In-memory message store whose updates can be made to fail for chosen ids.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
    poisoned: Mutex<HashSet<String>>,
}

impl MemoryMessageStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Updates touching `id` fail from now on.
    pub fn poison(&self, id: &str) {
        self.poisoned.lock().insert(id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.messages.lock().iter().find(|m| m.id == id).cloned()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, msg: Message) -> Result<Message> {
        self.messages.lock().push(msg.clone());
        Ok(msg)
    }

    async fn find_one(&self, filter: &MessageFilter) -> Result<Option<Message>> {
        Ok(self.find_many(filter).await?.into_iter().next())
    }

    async fn find_many(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut found: Vec<Message> = self
            .messages
            .lock()
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn update_one(
        &self,
        filter: &MessageFilter,
        patch: MessagePatch,
    ) -> Result<Option<Message>> {
        let mut messages = self.messages.lock();
        let Some(msg) = messages.iter_mut().find(|m| filter.matches(m)) else {
            return Ok(None);
        };
        if self.poisoned.lock().contains(&msg.id) {
            return Err(Error::StoreUnavailable(format!("write to {} failed", msg.id)));
        }
        patch.apply(msg);
        Ok(Some(msg.clone()))
    }

    async fn delete_one(&self, id: &str) -> Result<bool> {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| m.id != id);
        Ok(messages.len() != before)
    }
}
