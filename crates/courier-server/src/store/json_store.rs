//! JSON-file message store
//!
//! One document per message under `<dir>/<id>.json`, cached in memory and
//! written with a temp-file + rename so every update is atomic per document.
//! Writers to the same document queue on a per-id gate; the cache lock is
//! only held for map reads and inserts, never across disk I/O.

use super::{MessageFilter, MessagePatch, MessageStore};
use crate::error::{Error, Result};
use crate::models::Message;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct JsonMessageStore {
    dir: PathBuf,
    messages: RwLock<HashMap<String, Message>>,
    write_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonMessageStore {
    /// Open (or create) a store rooted at `dir`, loading every message found there.
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create message dir {:?}", dir))?;

        let store = Self {
            dir,
            messages: RwLock::new(HashMap::new()),
            write_gates: Mutex::new(HashMap::new()),
        };
        store.load_existing().await?;

        info!(
            "JSON message store initialized with {} messages",
            store.messages.read().await.len()
        );
        Ok(store)
    }

    fn message_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn load_existing(&self) -> anyhow::Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut messages = self.messages.write().await;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match load_message(&path).await {
                Ok(msg) => {
                    messages.insert(msg.id.clone(), msg);
                }
                Err(e) => warn!("Skipping unreadable message file {:?}: {}", path, e),
            }
        }
        Ok(())
    }

    fn gate(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_gates
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Id of the first message matching `filter`, in chronological order.
    async fn resolve(&self, filter: &MessageFilter) -> Option<String> {
        let messages = self.messages.read().await;
        if let Some(id) = filter.id_hint() {
            return messages
                .get(id)
                .filter(|m| filter.matches(m))
                .map(|m| m.id.clone());
        }
        messages
            .values()
            .filter(|m| filter.matches(m))
            .min_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
            .map(|m| m.id.clone())
    }

    async fn save_to_disk(&self, msg: &Message) -> Result<()> {
        let path = self.message_path(&msg.id);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(msg)?;
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

async fn load_message(path: &Path) -> anyhow::Result<Message> {
    let content = fs::read_to_string(path).await?;
    let msg = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse message JSON {:?}", path))?;
    Ok(msg)
}

fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl MessageStore for JsonMessageStore {
    async fn create(&self, msg: Message) -> Result<Message> {
        let gate = self.gate(&msg.id);
        let _serialized = gate.lock().await;

        if self.messages.read().await.contains_key(&msg.id) {
            return Err(Error::StoreUnavailable(format!(
                "duplicate message id {}",
                msg.id
            )));
        }
        self.save_to_disk(&msg).await?;
        self.messages
            .write()
            .await
            .insert(msg.id.clone(), msg.clone());
        debug!("Stored message {}", msg.id);
        Ok(msg)
    }

    async fn find_one(&self, filter: &MessageFilter) -> Result<Option<Message>> {
        // Id-pinned lookups skip the scan.
        if let Some(id) = filter.id_hint() {
            let messages = self.messages.read().await;
            return Ok(messages.get(id).filter(|m| filter.matches(m)).cloned());
        }
        let mut found: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_chronologically(&mut found);
        Ok(found.into_iter().next())
    }

    async fn find_many(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut found: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_chronologically(&mut found);
        Ok(found)
    }

    async fn update_one(
        &self,
        filter: &MessageFilter,
        patch: MessagePatch,
    ) -> Result<Option<Message>> {
        loop {
            let Some(id) = self.resolve(filter).await else {
                return Ok(None);
            };
            let gate = self.gate(&id);
            let _serialized = gate.lock().await;

            // Another writer may have changed the document while we queued.
            let current = self
                .messages
                .read()
                .await
                .get(&id)
                .filter(|m| filter.matches(m))
                .cloned();
            let Some(mut updated) = current else {
                continue;
            };

            patch.apply(&mut updated);
            // Memory only changes once the document is durable.
            self.save_to_disk(&updated).await?;
            self.messages
                .write()
                .await
                .insert(updated.id.clone(), updated.clone());
            return Ok(Some(updated));
        }
    }

    async fn delete_one(&self, id: &str) -> Result<bool> {
        let gate = self.gate(id);
        let _serialized = gate.lock().await;

        if self.messages.write().await.remove(id).is_none() {
            return Ok(false);
        }
        self.write_gates.lock().remove(id);
        match fs::remove_file(self.message_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
