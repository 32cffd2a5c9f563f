//! HTTP and WebSocket handlers
//!
//! Thin adapters from requests to [`ChatCoordinator`](crate::coordinator::ChatCoordinator)
//! operations. Errors are returned as [`crate::error::Error`], which renders
//! itself as a JSON error body.

pub mod auth;
pub mod media;
pub mod messages;
pub mod presence;
pub mod socket;

use crate::error::Error;
use tracing::{error, warn};

// Re-export AppState from config
pub use crate::config::AppState;

pub use auth::{check_contacts, check_user, list_contacts, login, send_otp};
pub use media::{get_media, upload_media};
pub use messages::{
    delete_for_everyone, delete_for_me, direct_history, edit_message, group_history,
    mark_delivered, mark_seen, send_message,
};
pub use presence::{get_last_seen, heartbeat, list_online};
pub use socket::ws_handler;

/// Log a failed request: store failures at error level, guard rejections at warn.
pub(crate) fn logged(operation: &'static str) -> impl FnOnce(Error) -> Error {
    move |e| {
        match &e {
            Error::StoreUnavailable(_) | Error::SmsUnavailable(_) => {
                error!("{} failed: {}", operation, e)
            }
            _ => warn!("{} rejected: {}", operation, e),
        }
        e
    }
}
