use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::lifecycle::SessionManager;
use crate::signaling::{ClientEvent, ConnectionId, ServerEvent};

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(sessions): State<SessionManager>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, sessions, remote_addr))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, sessions: SessionManager, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending messages to this peer
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn = sessions.connect(tx).await;

    // Spawn task to forward messages from channel to WebSocket
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode event for {}: {}", conn, e),
            }
        }
        debug!("Message sender task ended for connection {}", conn);
    });

    info!("Client connected: {} from {}", conn, remote_addr);

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket error from {}: {}", conn, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_frame(&sessions, conn, &text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&sessions, conn, &text).await,
                Err(_) => debug!("Ignoring non-UTF8 binary frame from {}", conn),
            },
            Message::Close(_) => {
                debug!("Received Close frame from {}", conn);
                break;
            }
            // axum answers pings itself
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Clean up on disconnect
    sessions.disconnect(conn).await;
    info!("Client disconnected: {}", conn);
}

/// Parses and dispatches one frame. Failures are logged and never close the
/// connection or reach the sender.
async fn handle_frame(sessions: &SessionManager, conn: ConnectionId, text: &str) {
    debug!("Frame from {}: {}", conn, text);
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping malformed message from {}: {}", conn, RelayError::from(e));
            return;
        }
    };

    let name = event.name();
    match sessions.dispatch(conn, event.into()).await {
        Ok(delivered) => debug!("{} from {} reached {} connections", name, conn, delivered),
        Err(e) if e.is_churn() => debug!("Dropped {} from {}: {}", name, conn, e),
        Err(e) => warn!("Dropped {} from {}: {}", name, conn, e),
    }
}
