//! Chat server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tracing::info;

use crate::auth::{OtpManager, SmsGateway};
use crate::clock::{Clock, SystemClock};
use crate::coordinator::ChatCoordinator;
use crate::lifecycle::{MessageEngine, MutationWindows};
use crate::media::MediaStore;
use crate::presence::PresenceTracker;
use crate::store::{JsonMessageStore, SqliteUserStore, UserStore};
use crate::transport::SocketHub;

/// Upper bound for the millisecond windows and the heartbeat lease (one year).
const MAX_WINDOW_MS: i64 = 365 * 24 * 60 * 60 * 1000;
/// Upper bound for the OTP lifetime (one day).
const MAX_OTP_TTL_SECS: i64 = 24 * 60 * 60;

/// Configuration for the Courier chat server
#[derive(Clone, Debug)]
pub struct ChatServerConfig {
    /// Base directory for messages and users.sqlite
    pub data_dir: PathBuf,
    /// Media storage root
    pub media_root: PathBuf,
    pub bind_addr: SocketAddr,
    /// How long after sending a message may be edited
    pub edit_window_ms: i64,
    /// How long after sending a message may be deleted for everyone
    pub delete_window_ms: i64,
    /// Lease granted by a heartbeat from a user with no open socket
    pub heartbeat_ttl_ms: i64,
    pub otp_ttl_secs: i64,
    /// Max media upload size in MB
    pub max_media_mb: u64,
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self::with_base_dir("courier_data")
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

impl ChatServerConfig {
    /// Create config with custom base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let data_dir = base_dir.into();
        Self {
            media_root: data_dir.join("media"),
            data_dir,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            edit_window_ms: 60_000,
            delete_window_ms: 1_800_000,
            heartbeat_ttl_ms: 30_000,
            otp_ttl_secs: 300,
            max_media_mb: 25,
        }
    }

    /// Defaults overridden by environment variables. Values that do not
    /// parse are an error, not a silent fallback.
    pub fn from_env() -> Result<Self> {
        let data_dir: PathBuf =
            env_parse("COURIER_DATA_DIR")?.unwrap_or_else(|| PathBuf::from("courier_data"));
        let mut config = Self::with_base_dir(data_dir);

        if let Some(root) = env_parse::<PathBuf>("MEDIA_ROOT")? {
            config.media_root = root;
        }
        if let Some(addr) = env_parse("COURIER_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(ms) = env_parse("EDIT_WINDOW_MS")? {
            config.edit_window_ms = ms;
        }
        if let Some(ms) = env_parse("DELETE_WINDOW_MS")? {
            config.delete_window_ms = ms;
        }
        if let Some(ms) = env_parse("HEARTBEAT_TTL_MS")? {
            config.heartbeat_ttl_ms = ms;
        }
        if let Some(secs) = env_parse("OTP_TTL_SECS")? {
            config.otp_ttl_secs = secs;
        }
        if let Some(mb) = env_parse("MAX_MEDIA_MB")? {
            config.max_media_mb = mb;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value, max) in [
            ("EDIT_WINDOW_MS", self.edit_window_ms, MAX_WINDOW_MS),
            ("DELETE_WINDOW_MS", self.delete_window_ms, MAX_WINDOW_MS),
            ("HEARTBEAT_TTL_MS", self.heartbeat_ttl_ms, MAX_WINDOW_MS),
            ("OTP_TTL_SECS", self.otp_ttl_secs, MAX_OTP_TTL_SECS),
        ] {
            if value < 0 {
                anyhow::bail!("{} must not be negative, got {}", name, value);
            }
            if value > max {
                anyhow::bail!("{} must be at most {}, got {}", name, max, value);
            }
        }
        Ok(())
    }

    pub fn windows(&self) -> MutationWindows {
        MutationWindows {
            edit: Duration::milliseconds(self.edit_window_ms),
            delete: Duration::milliseconds(self.delete_window_ms),
        }
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("messages")
    }

    pub fn users_db(&self) -> PathBuf {
        self.data_dir.join("users.sqlite")
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create data dir {:?}", self.data_dir))?;
        tokio::fs::create_dir_all(&self.media_root)
            .await
            .with_context(|| format!("Failed to create media root {:?}", self.media_root))?;
        Ok(())
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatServerConfig>,
    pub coordinator: Arc<ChatCoordinator>,
    pub hub: Arc<SocketHub>,
    pub users: Arc<dyn UserStore>,
    pub otp: Arc<OtpManager>,
    pub media: Arc<MediaStore>,
}

impl AppState {
    /// Open the stores and wire the core together.
    pub async fn build(config: ChatServerConfig, sms: Arc<dyn SmsGateway>) -> Result<Self> {
        Self::build_with_clock(config, sms, Arc::new(SystemClock)).await
    }

    pub async fn build_with_clock(
        config: ChatServerConfig,
        sms: Arc<dyn SmsGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs().await?;

        let messages = Arc::new(
            JsonMessageStore::new(config.messages_dir())
                .await
                .context("Failed to open message store")?,
        );
        let users: Arc<dyn UserStore> = Arc::new(
            SqliteUserStore::open(&config.users_db())
                .await
                .context("Failed to open user store")?,
        );
        info!("Stores ready under {:?}", config.data_dir);

        let hub = Arc::new(SocketHub::new());
        let presence = Arc::new(PresenceTracker::new(
            users.clone(),
            clock.clone(),
            Duration::milliseconds(config.heartbeat_ttl_ms),
        ));
        let engine = MessageEngine::new(messages, clock.clone(), config.windows());
        let coordinator = Arc::new(ChatCoordinator::new(
            presence,
            engine,
            hub.clone(),
            users.clone(),
        ));
        let otp = Arc::new(OtpManager::new(
            sms,
            clock,
            Duration::seconds(config.otp_ttl_secs),
        ));
        let media = Arc::new(MediaStore::new(
            config.media_root.clone(),
            config.max_media_mb * 1024 * 1024,
        ));

        Ok(Self {
            config: Arc::new(config),
            coordinator,
            hub,
            users,
            otp,
            media,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatServerConfig::default();
        assert_eq!(config.edit_window_ms, 60_000);
        assert_eq!(config.delete_window_ms, 1_800_000);
        assert_eq!(config.media_root, PathBuf::from("courier_data").join("media"));
        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.windows().edit, Duration::seconds(60));
    }

    #[test]
    fn test_negative_window_is_rejected() {
        let mut config = ChatServerConfig::default();
        config.edit_window_ms = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_are_rejected_by_name() {
        let mut config = ChatServerConfig::default();
        config.heartbeat_ttl_ms = i64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("HEARTBEAT_TTL_MS"), "{}", err);

        let mut config = ChatServerConfig::default();
        config.otp_ttl_secs = i64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("OTP_TTL_SECS"), "{}", err);

        let mut config = ChatServerConfig::default();
        config.delete_window_ms = MAX_WINDOW_MS;
        config.otp_ttl_secs = MAX_OTP_TTL_SECS;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_build_rejects_oversized_ttl_before_touching_disk() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = ChatServerConfig::with_base_dir(temp_dir.path().join("data"));
        config.otp_ttl_secs = i64::MAX;
        let result = AppState::build(config, Arc::new(crate::auth::LogSmsGateway)).await;
        assert!(result.is_err());
        assert!(!temp_dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_build_creates_stores() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ChatServerConfig::with_base_dir(temp_dir.path());
        let state = AppState::build(config, Arc::new(crate::auth::LogSmsGateway))
            .await
            .unwrap();
        assert!(temp_dir.path().join("users.sqlite").exists());
        assert!(temp_dir.path().join("media").is_dir());
        assert!(state.coordinator.online_users().is_empty());
    }
}
