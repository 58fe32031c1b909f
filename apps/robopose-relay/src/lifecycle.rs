use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::notifier::{publish_availability, send_snapshot};
use crate::registry::{ConnectionHandle, IdentityRegistry};
use crate::router::RelayRouter;
use crate::signaling::{
    ConnectedInfo, ConnectionId, Inbound, PeerIdentity, RelayMessage, ServerEvent,
};

/// Owns the registry and drives every connection through
/// `Unregistered -> Registered(source | viewer) -> Disconnected`.
///
/// Registration, removal and the availability publish that follows them run
/// under the write lock. Relays resolve and enqueue under the read lock, so a
/// relay either completes before a removal or observes the connection gone.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<RwLock<IdentityRegistry>>,
    router: Arc<RelayRouter>,
}

impl SessionManager {
    pub fn new(router: RelayRouter) -> Self {
        Self {
            registry: Arc::new(RwLock::new(IdentityRegistry::new())),
            router: Arc::new(router),
        }
    }

    /// Accepts a transport connection in the `Unregistered` state. The
    /// client learns its connection id from the `connected` event, which is
    /// always the first event on the channel.
    pub async fn connect(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let handle = ConnectionHandle::new(tx);
        let id = handle.id();
        let mut registry = self.registry.write().await;
        if let Err(e) = handle.send(ServerEvent::Connected(ConnectedInfo { connection_id: id })) {
            debug!("Connection closed before greeting: {}", e);
        }
        registry.insert_connection(handle);
        debug!("Connection {} accepted", id);
        id
    }

    /// Handles one parsed inbound event. Returns how many connections it
    /// reached.
    pub async fn dispatch(&self, conn: ConnectionId, inbound: Inbound) -> Result<usize, RelayError> {
        match inbound {
            Inbound::RegisterSource(identity) => self.register_source(conn, identity).await,
            Inbound::RegisterViewer => self.register_viewer(conn).await.map(|()| 1),
            Inbound::Relay(message) => self.relay(conn, message).await,
        }
    }

    /// Registers `conn` as the source for `identity` and publishes the new
    /// availability set to every viewer.
    pub async fn register_source(
        &self,
        conn: ConnectionId,
        identity: PeerIdentity,
    ) -> Result<usize, RelayError> {
        let mut registry = self.registry.write().await;
        let outcome = registry.register_source(conn, identity.clone())?;
        if let Some(previous) = outcome.superseded {
            info!(
                "Phone {} re-registered from {}, superseding {}",
                identity, conn, previous
            );
        } else {
            info!("Phone {} registered on {}", identity, conn);
        }
        if let Some(old) = outcome.replaced_identity {
            info!("Connection {} dropped identity {}", conn, old);
        }
        Ok(publish_availability(&registry))
    }

    /// Registers `conn` as a viewer and replies with the current snapshot.
    pub async fn register_viewer(&self, conn: ConnectionId) -> Result<(), RelayError> {
        let mut registry = self.registry.write().await;
        let released = registry.register_viewer(conn)?;
        info!("Viewer registered on {}", conn);
        if let Some(identity) = released {
            // the publish already reached this connection as a viewer
            info!("Connection {} stopped serving phone {}", conn, identity);
            publish_availability(&registry);
            return Ok(());
        }
        let handle = registry
            .connection(conn)
            .ok_or(RelayError::UnknownConnection(conn))?;
        send_snapshot(&registry, handle)
    }

    pub async fn relay(&self, conn: ConnectionId, message: RelayMessage) -> Result<usize, RelayError> {
        if let RelayMessage::RequestStream(_) = message {
            let mut registry = self.registry.write().await;
            let routed = self.router.route(&registry, conn, message)?;
            if let Some(pending) = routed.pending {
                if !registry.record_request(pending.source.clone(), pending.requester) {
                    debug!(
                        "Dropped stream request for {}: requester {} is gone",
                        pending.source, pending.requester
                    );
                }
            }
            return Ok(routed.delivered);
        }

        let registry = self.registry.read().await;
        self.router
            .route(&registry, conn, message)
            .map(|routed| routed.delivered)
    }

    /// Terminal transition. Removes every reference to `conn` and, if it was
    /// serving a phone identity, publishes the shrunken availability set.
    /// Returns whether a phone identity went away.
    pub async fn disconnect(&self, conn: ConnectionId) -> bool {
        let mut registry = self.registry.write().await;
        let connected_at = registry.connection(conn).map(|handle| handle.connected_at());
        let removed_source = registry.remove(conn);
        if removed_source {
            publish_availability(&registry);
        }
        if let Some(connected_at) = connected_at {
            info!(
                "Connection {} closed after {}s ({} remaining)",
                conn,
                (Utc::now() - connected_at).num_seconds(),
                registry.connection_count()
            );
        }
        removed_source
    }

    pub async fn available(&self) -> Vec<PeerIdentity> {
        self.registry.read().await.available()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connection_count()
    }

    #[cfg(test)]
    async fn assert_consistent(&self) {
        self.registry.read().await.assert_consistent();
    }
}
