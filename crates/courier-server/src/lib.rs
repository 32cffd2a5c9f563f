//! Courier Chat Server Library
//!
//! Phone-number accounts, live presence and the message delivery lifecycle,
//! served over HTTP and WebSockets.

pub mod auth;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod media;
pub mod models;
pub mod presence;
pub mod router;
pub mod store;
pub mod transport;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use auth::LogSmsGateway;
use config::{AppState, ChatServerConfig};
use handlers::{
    // Auth and contacts
    check_contacts,
    check_user,
    // Messages
    delete_for_everyone,
    delete_for_me,
    direct_history,
    edit_message,
    // Media
    get_media,
    // Presence
    get_last_seen,
    group_history,
    heartbeat,
    list_contacts,
    list_online,
    login,
    mark_delivered,
    mark_seen,
    send_message,
    send_otp,
    upload_media,
    // Socket
    ws_handler,
};

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// A subscriber that is already installed is left in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already set, ignore
    }
}

/// The full HTTP surface over `state`.
pub fn app(state: AppState) -> Router {
    // Multipart framing on top of the largest accepted file.
    let media_limit = state.media.max_bytes() as usize + 64 * 1024;

    Router::new()
        // Auth endpoints
        .route("/auth/send-otp", post(send_otp))
        .route("/auth/login", post(login))
        .route("/auth/check-user", post(check_user))
        // Contacts
        .route("/contacts/check", post(check_contacts))
        .route("/contacts/{phone}", get(list_contacts))
        // Message lifecycle
        .route("/messages", post(send_message))
        .route("/messages/seen", post(mark_seen))
        .route("/messages/delivered", post(mark_delivered))
        .route("/messages/edit", put(edit_message))
        .route("/messages/delete-for-me", put(delete_for_me))
        .route("/messages/delete-for-everyone", put(delete_for_everyone))
        .route("/messages/{a}/{b}", get(direct_history))
        .route("/groups/{group_id}/messages", get(group_history))
        // Presence
        .route("/presence/online", get(list_online))
        .route("/presence/{phone}", get(get_last_seen))
        .route("/presence/{phone}/heartbeat", post(heartbeat))
        // Media
        .route(
            "/media",
            post(upload_media).layer(DefaultBodyLimit::max(media_limit)),
        )
        .route("/media/{hash}", get(get_media))
        // Live socket
        .route("/ws", get(ws_handler))
        // Health check
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Periodically expire heartbeat leases.
fn spawn_presence_sweeper(state: &AppState) -> tokio::task::JoinHandle<()> {
    let coordinator = state.coordinator.clone();
    let period = Duration::from_millis((state.config.heartbeat_ttl_ms / 2).max(1_000) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let expired = coordinator.sweep_presence().await;
            if expired > 0 {
                info!("Presence sweep expired {} leases", expired);
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("=== Courier Chat Server ===");

    let config = ChatServerConfig::from_env()?;
    info!("Data directory: {:?}", config.data_dir);
    info!("Media root: {:?}", config.media_root);
    info!(
        "Edit window {}ms, delete window {}ms",
        config.edit_window_ms, config.delete_window_ms
    );

    let addr = config.bind_addr;
    let app_state = AppState::build(config, Arc::new(LogSmsGateway)).await?;
    let sweeper = spawn_presence_sweeper(&app_state);
    let coordinator = app_state.coordinator.clone();

    let app = app(app_state);

    info!("");
    info!("Courier Chat Server listening on http://{}", addr);
    info!("");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    coordinator.shutdown();
    Ok(())
}

async fn health_check() -> &'static str {
    "OK - Courier Chat Server"
}
