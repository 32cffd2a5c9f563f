//! Presence tracker
//!
//! Process-wide table of who is connected. One instance is created per
//! server process and shared by handle; tests build their own.
//!
//! A user is online while they hold at least one live socket, or while a
//! heartbeat lease (granted to users polling without a socket) is unexpired.
//! Every transition is mirrored into the user store best-effort.

use crate::clock::Clock;
use crate::store::UserStore;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// In-memory record of one user's connections.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub connections: BTreeSet<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceEntry {
    fn offline(last_seen: DateTime<Utc>) -> Self {
        Self {
            connections: BTreeSet::new(),
            lease_until: None,
            last_seen,
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        !self.connections.is_empty() || self.lease_until.map_or(false, |until| until > now)
    }
}

/// A user going online or offline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    /// Socket that caused the change; excluded from the broadcast.
    #[serde(skip)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LastSeenSource {
    /// The tracker's own record.
    Live,
    /// Loaded from the user store and now cached.
    Persisted,
    /// Nothing known; `last_seen` is just "now" and should not be trusted.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSeen {
    pub user_id: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub source: LastSeenSource,
}

#[derive(Default)]
struct PresenceTable {
    entries: HashMap<String, PresenceEntry>,
    /// connection id -> user id
    by_connection: HashMap<String, String>,
}

impl PresenceTable {
    fn detach(&mut self, connection_id: &str) -> Option<String> {
        let user_id = self.by_connection.remove(connection_id)?;
        if let Some(entry) = self.entries.get_mut(&user_id) {
            entry.connections.remove(connection_id);
        }
        Some(user_id)
    }
}

pub struct PresenceTracker {
    table: Mutex<PresenceTable>,
    users: Arc<dyn UserStore>,
    clock: Arc<dyn Clock>,
    heartbeat_ttl: Duration,
    /// Serializes store mirroring per user so the last write carries the latest state.
    mirror_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PresenceTracker {
    pub fn new(users: Arc<dyn UserStore>, clock: Arc<dyn Clock>, heartbeat_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(PresenceTable::default()),
            users,
            clock,
            heartbeat_ttl,
            mirror_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Register a live socket for `user_id`. Always reports the user online.
    pub async fn connect(&self, user_id: &str, connection_id: &str) -> PresenceChange {
        let now = self.clock.now();
        let displaced = {
            let mut table = self.table.lock();

            let owned_elsewhere = table
                .by_connection
                .get(connection_id)
                .map_or(false, |owner| owner != user_id);
            let displaced = if owned_elsewhere {
                table.detach(connection_id)
            } else {
                None
            };

            table
                .by_connection
                .insert(connection_id.to_string(), user_id.to_string());
            let entry = table
                .entries
                .entry(user_id.to_string())
                .or_insert_with(|| PresenceEntry::offline(now));
            entry.connections.insert(connection_id.to_string());
            entry.lease_until = None;
            entry.last_seen = now;
            displaced
        };

        if let Some(previous) = displaced {
            warn!(
                "Connection {} moved from {} to {}",
                connection_id, previous, user_id
            );
            self.mirror(&previous).await;
        }

        debug!("{} connected on {}", user_id, connection_id);
        self.mirror(user_id).await;

        PresenceChange {
            user_id: user_id.to_string(),
            online: true,
            last_seen: now,
            connection_id: Some(connection_id.to_string()),
        }
    }

    /// Drop a socket. Returns the offline transition when it was the user's last one.
    /// Unknown connections are ignored.
    pub async fn disconnect(&self, connection_id: &str) -> Option<PresenceChange> {
        let now = self.clock.now();
        let change = {
            let mut table = self.table.lock();
            let user_id = table.detach(connection_id)?;
            let entry = table.entries.get_mut(&user_id)?;
            entry.last_seen = now;
            if entry.is_online(now) {
                None
            } else {
                entry.lease_until = None;
                Some(PresenceChange {
                    user_id,
                    online: false,
                    last_seen: now,
                    connection_id: Some(connection_id.to_string()),
                })
            }
        };

        if let Some(change) = &change {
            debug!("{} went offline", change.user_id);
            self.mirror(&change.user_id).await;
        }
        change
    }

    /// Refresh last-seen without notifying anyone. A user without a socket is
    /// granted a lease and counts as online until it lapses. Returns true when
    /// the heartbeat created the entry.
    pub async fn heartbeat(&self, user_id: &str) -> bool {
        let now = self.clock.now();
        let created = {
            let mut table = self.table.lock();
            let created = !table.entries.contains_key(user_id);
            let entry = table
                .entries
                .entry(user_id.to_string())
                .or_insert_with(|| PresenceEntry::offline(now));
            entry.last_seen = now;
            if entry.connections.is_empty() {
                let lease = now
                    .checked_add_signed(self.heartbeat_ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                entry.lease_until = Some(lease);
            }
            created
        };

        self.mirror(user_id).await;
        created
    }

    /// Expire heartbeat leases that lapsed without a socket taking over.
    pub async fn sweep_expired(&self) -> Vec<PresenceChange> {
        let now = self.clock.now();
        let expired: Vec<PresenceChange> = {
            let mut table = self.table.lock();
            table
                .entries
                .iter_mut()
                .filter(|(_, entry)| {
                    entry.connections.is_empty()
                        && entry.lease_until.map_or(false, |until| until <= now)
                })
                .map(|(user_id, entry)| {
                    entry.lease_until = None;
                    PresenceChange {
                        user_id: user_id.clone(),
                        online: false,
                        last_seen: entry.last_seen,
                        connection_id: None,
                    }
                })
                .collect()
        };

        for change in &expired {
            self.mirror(&change.user_id).await;
        }
        expired
    }

    /// Snapshot of online users, sorted. May be stale by the time it is used.
    pub fn query_online(&self) -> Vec<String> {
        let now = self.clock.now();
        let table = self.table.lock();
        let mut online: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_online(now))
            .map(|(user_id, _)| user_id.clone())
            .collect();
        online.sort();
        online
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let now = self.clock.now();
        self.table
            .lock()
            .entries
            .get(user_id)
            .map_or(false, |entry| entry.is_online(now))
    }

    pub fn user_for_connection(&self, connection_id: &str) -> Option<String> {
        self.table.lock().by_connection.get(connection_id).cloned()
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<String> {
        self.table
            .lock()
            .entries
            .get(user_id)
            .map(|entry| entry.connections.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, user_id: &str) -> Option<PresenceEntry> {
        self.table.lock().entries.get(user_id).cloned()
    }

    /// Last-seen for `user_id`: tracker first, then the store (cached), else "now".
    pub async fn last_seen(&self, user_id: &str) -> LastSeen {
        let now = self.clock.now();
        if let Some(entry) = self.entry(user_id) {
            return LastSeen {
                user_id: user_id.to_string(),
                online: entry.is_online(now),
                last_seen: entry.last_seen,
                source: LastSeenSource::Live,
            };
        }

        match self.users.find(user_id).await {
            Ok(Some(user)) => {
                let mut table = self.table.lock();
                // A connect may have landed while the store was being read.
                let entry = table
                    .entries
                    .entry(user_id.to_string())
                    .or_insert_with(|| PresenceEntry::offline(user.last_seen));
                let (online, last_seen) = (entry.is_online(now), entry.last_seen);
                LastSeen {
                    user_id: user_id.to_string(),
                    online,
                    last_seen,
                    source: if online {
                        LastSeenSource::Live
                    } else {
                        LastSeenSource::Persisted
                    },
                }
            }
            Ok(None) => self.unknown(user_id, now),
            Err(e) => {
                warn!("Last-seen lookup for {} failed: {}", user_id, e);
                self.unknown(user_id, now)
            }
        }
    }

    fn unknown(&self, user_id: &str, now: DateTime<Utc>) -> LastSeen {
        LastSeen {
            user_id: user_id.to_string(),
            online: false,
            last_seen: now,
            source: LastSeenSource::Unknown,
        }
    }

    /// Forget everything. Called at shutdown.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.entries.clear();
        table.by_connection.clear();
        self.mirror_gates.lock().clear();
    }

    fn gate(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.mirror_gates
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Write the user's current state to the store. Failures are logged only:
    /// the in-memory table is the authority.
    async fn mirror(&self, user_id: &str) {
        let gate = self.gate(user_id);
        let _serialized = gate.lock().await;

        let snapshot = {
            let now = self.clock.now();
            let table = self.table.lock();
            table
                .entries
                .get(user_id)
                .map(|entry| (entry.is_online(now), entry.last_seen))
        };
        let Some((online, last_seen)) = snapshot else {
            return;
        };

        if let Err(e) = self.users.set_presence(user_id, online, last_seen).await {
            warn!("Failed to mirror presence for {}: {}", user_id, e);
        }
    }
}
