use tracing::debug;

use crate::error::RelayError;
use crate::registry::{ConnectionHandle, IdentityRegistry};
use crate::signaling::ServerEvent;

/// Sends the full availability snapshot to every viewer. Returns how many
/// viewers it reached.
pub fn publish_availability(registry: &IdentityRegistry) -> usize {
    let available = registry.available();
    let mut reached = 0;
    for viewer in registry.viewers() {
        match viewer.send(ServerEvent::AvailablePhones(available.clone())) {
            Ok(()) => reached += 1,
            Err(e) => debug!("Skipping availability update: {}", e),
        }
    }
    debug!(
        "Published {} available phones to {} viewers",
        available.len(),
        reached
    );
    reached
}

/// Direct reply to a viewer that just registered.
pub fn send_snapshot(
    registry: &IdentityRegistry,
    viewer: &ConnectionHandle,
) -> Result<(), RelayError> {
    viewer.send(ServerEvent::AvailablePhones(registry.available()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test_timeout::timeout]
    fn publishes_only_to_viewers() {
        let mut registry = IdentityRegistry::new();
        let (viewer_tx, mut viewer_rx) = mpsc::unbounded_channel();
        let (phone_tx, mut phone_rx) = mpsc::unbounded_channel();
        let viewer = ConnectionHandle::new(viewer_tx);
        let phone = ConnectionHandle::new(phone_tx);
        let (viewer_id, phone_id) = (viewer.id(), phone.id());
        registry.insert_connection(viewer);
        registry.insert_connection(phone);
        registry.register_viewer(viewer_id).unwrap();
        registry.register_source(phone_id, "phoneB".into()).unwrap();

        assert_eq!(publish_availability(&registry), 1);
        assert_eq!(
            viewer_rx.try_recv().unwrap(),
            ServerEvent::AvailablePhones(vec!["phoneB".into()])
        );
        assert!(phone_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn closed_viewer_is_not_counted() {
        let mut registry = IdentityRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let viewer = ConnectionHandle::new(tx);
        let id = viewer.id();
        registry.insert_connection(viewer);
        registry.register_viewer(id).unwrap();
        drop(rx);

        assert_eq!(publish_availability(&registry), 0);
    }
}
