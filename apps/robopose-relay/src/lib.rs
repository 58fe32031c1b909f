//! Signaling relay pairing phone cameras ("sources") with viewers.
//!
//! The relay only forwards handshake, control and state messages between
//! connections; payloads are never inspected beyond their routing fields.

pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notifier;
pub mod registry;
pub mod router;
pub mod signaling;
pub mod websocket;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::lifecycle::SessionManager;
use crate::websocket::websocket_handler;

pub fn build_router(config: &Config, sessions: SessionManager) -> Router {
    Router::new()
        .route(&config.ws_path, get(websocket_handler))
        .with_state(sessions)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
