use thiserror::Error;

use crate::signaling::ConnectionId;

/// Reasons a single inbound message produced no delivery.
///
/// None of these are faults of the relay: the websocket layer logs them and
/// keeps the connection running. Nothing is ever reported back to the sender.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connection {0} is not connected")]
    UnknownConnection(ConnectionId),
    #[error("no destination for {event}")]
    UnresolvedDestination { event: &'static str },
    #[error("transport to {0} is closed")]
    TransportClosed(ConnectionId),
}

impl RelayError {
    /// Unresolved and closed destinations are normal churn, not bad input.
    pub fn is_churn(&self) -> bool {
        matches!(
            self,
            RelayError::UnknownConnection(_)
                | RelayError::UnresolvedDestination { .. }
                | RelayError::TransportClosed(_)
        )
    }
}
