use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::signaling::{ConnectionId, PeerIdentity, ServerEvent};

/// Sending half of one live client connection.
///
/// The receiving half is drained by the websocket writer task; once that task
/// ends the channel closes and every further send fails with
/// [`RelayError::TransportClosed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId::generate(),
            tx,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Fire-and-forget enqueue; never blocks.
    pub fn send(&self, event: ServerEvent) -> Result<(), RelayError> {
        self.tx
            .send(event)
            .map_err(|_| RelayError::TransportClosed(self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    Unregistered,
    Source(PeerIdentity),
    Viewer,
}

#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    role: PeerRole,
}

/// Outcome of [`IdentityRegistry::register_source`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SourceRegistration {
    /// Another connection that held the identity until now.
    pub superseded: Option<ConnectionId>,
    /// Identity this connection itself held before re-registering.
    pub replaced_identity: Option<PeerIdentity>,
}

/// Every live connection, the source identity index in both directions, the
/// viewer set and pending stream requests.
///
/// The registry is plain data: callers serialize access to it (see
/// [`crate::lifecycle::SessionManager`]), so every method observes and leaves
/// a consistent state.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// identity -> connection. The reverse direction lives in each entry's role.
    sources: BTreeMap<PeerIdentity, ConnectionId>,
    viewers: HashSet<ConnectionId>,
    /// source identity -> connection that most recently requested its stream
    pending: HashMap<PeerIdentity, ConnectionId>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_connection(&mut self, handle: ConnectionHandle) {
        self.connections.insert(
            handle.id(),
            ConnectionEntry {
                handle,
                role: PeerRole::Unregistered,
            },
        );
    }

    /// Maps `identity` to `conn`, last writer wins.
    ///
    /// A connection that previously held the identity is left open but loses
    /// its source role. A connection re-registering under a new identity
    /// drops the old one.
    pub fn register_source(
        &mut self,
        conn: ConnectionId,
        identity: PeerIdentity,
    ) -> Result<SourceRegistration, RelayError> {
        let previous = self.take_role(conn)?;
        let mut outcome = SourceRegistration::default();
        if let PeerRole::Source(old) = previous {
            if old != identity {
                self.pending.remove(&old);
                outcome.replaced_identity = Some(old);
            }
        }

        if let Some(holder) = self.sources.insert(identity.clone(), conn) {
            if holder != conn {
                if let Some(entry) = self.connections.get_mut(&holder) {
                    entry.role = PeerRole::Unregistered;
                }
                outcome.superseded = Some(holder);
            }
        }

        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.role = PeerRole::Source(identity);
        }
        Ok(outcome)
    }

    /// Adds `conn` to the viewer set. Returns the source identity the
    /// connection gave up, if it was registered as a source.
    pub fn register_viewer(
        &mut self,
        conn: ConnectionId,
    ) -> Result<Option<PeerIdentity>, RelayError> {
        let previous = self.take_role(conn)?;
        self.viewers.insert(conn);
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.role = PeerRole::Viewer;
        }
        Ok(match previous {
            PeerRole::Source(identity) => {
                self.pending.remove(&identity);
                Some(identity)
            }
            _ => None,
        })
    }

    pub fn resolve_source(&self, identity: &str) -> Option<&ConnectionHandle> {
        self.sources
            .get(identity)
            .and_then(|conn| self.connection(*conn))
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&conn).map(|entry| &entry.handle)
    }

    pub fn role(&self, conn: ConnectionId) -> Option<&PeerRole> {
        self.connections.get(&conn).map(|entry| &entry.role)
    }

    /// Source identity currently owned by `conn`.
    pub fn identity_of(&self, conn: ConnectionId) -> Option<&PeerIdentity> {
        match self.role(conn) {
            Some(PeerRole::Source(identity)) => Some(identity),
            _ => None,
        }
    }

    /// Removes every reference to `conn`. Returns whether a source identity
    /// went away with it; a second call for the same connection is a no-op
    /// returning `false`.
    pub fn remove(&mut self, conn: ConnectionId) -> bool {
        let Some(entry) = self.connections.remove(&conn) else {
            return false;
        };
        self.pending.retain(|_, requester| *requester != conn);
        match entry.role {
            PeerRole::Source(identity) => self.release_identity(conn, &identity),
            PeerRole::Viewer => {
                self.viewers.remove(&conn);
                false
            }
            PeerRole::Unregistered => false,
        }
    }

    /// Sorted snapshot of the registered source identities.
    pub fn available(&self) -> Vec<PeerIdentity> {
        self.sources.keys().cloned().collect()
    }

    pub fn viewers(&self) -> impl Iterator<Item = &ConnectionHandle> + '_ {
        self.viewers
            .iter()
            .filter_map(|conn| self.connection(*conn))
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionHandle> + '_ {
        self.connections.values().map(|entry| &entry.handle)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Remembers `requester` as the viewer waiting on `source`. Returns
    /// `false`, storing nothing, when the requester is not connected.
    pub fn record_request(&mut self, source: PeerIdentity, requester: ConnectionId) -> bool {
        if !self.connections.contains_key(&requester) {
            return false;
        }
        self.pending.insert(source, requester);
        true
    }

    pub fn pending_requester(&self, source: &str) -> Option<ConnectionId> {
        self.pending.get(source).copied()
    }

    /// Clears the connection's current role and the index entries behind it.
    fn take_role(&mut self, conn: ConnectionId) -> Result<PeerRole, RelayError> {
        let entry = self
            .connections
            .get_mut(&conn)
            .ok_or(RelayError::UnknownConnection(conn))?;
        let previous = std::mem::replace(&mut entry.role, PeerRole::Unregistered);
        match &previous {
            PeerRole::Source(identity) => {
                if self.sources.get(identity) == Some(&conn) {
                    self.sources.remove(identity);
                }
            }
            PeerRole::Viewer => {
                self.viewers.remove(&conn);
            }
            PeerRole::Unregistered => {}
        }
        Ok(previous)
    }

    fn release_identity(&mut self, conn: ConnectionId, identity: &str) -> bool {
        if self.sources.get(identity) != Some(&conn) {
            return false;
        }
        self.sources.remove(identity);
        self.pending.remove(identity);
        true
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (identity, conn) in &self.sources {
            let role = self.role(*conn).expect("source maps to a live connection");
            assert_eq!(role, &PeerRole::Source(identity.clone()));
        }
        for (conn, entry) in &self.connections {
            match &entry.role {
                PeerRole::Source(identity) => assert_eq!(self.sources.get(identity), Some(conn)),
                PeerRole::Viewer => assert!(self.viewers.contains(conn)),
                PeerRole::Unregistered => assert!(!self.viewers.contains(conn)),
            }
        }
        for conn in &self.viewers {
            assert_eq!(self.role(*conn), Some(&PeerRole::Viewer));
        }
        for requester in self.pending.values() {
            assert!(self.connections.contains_key(requester));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &mut IdentityRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx);
        let id = handle.id();
        registry.insert_connection(handle);
        (id, rx)
    }

    #[test_timeout::timeout]
    fn later_registration_supersedes_earlier() {
        let mut registry = IdentityRegistry::new();
        let (first, _rx1) = connect(&mut registry);
        let (second, _rx2) = connect(&mut registry);

        registry.register_source(first, "phoneA".into()).unwrap();
        let outcome = registry.register_source(second, "phoneA".into()).unwrap();

        assert_eq!(outcome.superseded, Some(first));
        assert_eq!(registry.resolve_source("phoneA").map(|h| h.id()), Some(second));
        assert_eq!(registry.role(first), Some(&PeerRole::Unregistered));
        assert_eq!(registry.available(), vec!["phoneA".to_string()]);
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn superseded_connection_leaving_keeps_new_mapping() {
        let mut registry = IdentityRegistry::new();
        let (first, _rx1) = connect(&mut registry);
        let (second, _rx2) = connect(&mut registry);
        registry.register_source(first, "phoneA".into()).unwrap();
        registry.register_source(second, "phoneA".into()).unwrap();

        assert!(!registry.remove(first));
        assert_eq!(registry.resolve_source("phoneA").map(|h| h.id()), Some(second));
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn remove_is_idempotent_and_final() {
        let mut registry = IdentityRegistry::new();
        let (phone, _rx) = connect(&mut registry);
        registry.register_source(phone, "phoneA".into()).unwrap();

        assert!(registry.remove(phone));
        assert!(!registry.remove(phone));
        assert!(registry.resolve_source("phoneA").is_none());
        assert!(registry.connection(phone).is_none());
        assert!(registry.available().is_empty());
        assert!(matches!(
            registry.register_source(phone, "phoneA".into()),
            Err(RelayError::UnknownConnection(id)) if id == phone
        ));
        assert!(registry.resolve_source("phoneA").is_none());
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn re_registering_under_new_identity_drops_old_one() {
        let mut registry = IdentityRegistry::new();
        let (phone, _rx) = connect(&mut registry);
        registry.register_source(phone, "old".into()).unwrap();
        let outcome = registry.register_source(phone, "new".into()).unwrap();

        assert_eq!(outcome.replaced_identity.as_deref(), Some("old"));
        assert_eq!(outcome.superseded, None);
        assert_eq!(registry.available(), vec!["new".to_string()]);
        registry.assert_consistent();

        let again = registry.register_source(phone, "new".into()).unwrap();
        assert_eq!(again, SourceRegistration::default());
    }

    #[test_timeout::timeout]
    fn viewer_removal_reports_no_source_change() {
        let mut registry = IdentityRegistry::new();
        let (viewer, _rx) = connect(&mut registry);
        assert_eq!(registry.register_viewer(viewer).unwrap(), None);
        assert_eq!(registry.viewers().count(), 1);

        assert!(!registry.remove(viewer));
        assert_eq!(registry.viewers().count(), 0);
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn switching_source_to_viewer_releases_identity() {
        let mut registry = IdentityRegistry::new();
        let (conn, _rx) = connect(&mut registry);
        registry.register_source(conn, "phoneA".into()).unwrap();

        assert_eq!(registry.register_viewer(conn).unwrap().as_deref(), Some("phoneA"));
        assert!(registry.resolve_source("phoneA").is_none());
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn pending_requests_die_with_either_side() {
        let mut registry = IdentityRegistry::new();
        let (phone, _rx1) = connect(&mut registry);
        let (viewer, _rx2) = connect(&mut registry);
        let (other_viewer, _rx3) = connect(&mut registry);
        registry.register_source(phone, "phoneA".into()).unwrap();
        registry.register_source(other_viewer, "phoneB".into()).unwrap();

        registry.record_request("phoneA".into(), viewer);
        registry.record_request("phoneB".into(), viewer);
        assert_eq!(registry.pending_requester("phoneA"), Some(viewer));

        registry.remove(phone);
        assert_eq!(registry.pending_requester("phoneA"), None);
        assert_eq!(registry.pending_requester("phoneB"), Some(viewer));

        registry.remove(viewer);
        assert_eq!(registry.pending_requester("phoneB"), None);
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn pending_request_needs_a_live_requester() {
        let mut registry = IdentityRegistry::new();
        let (phone, _rx1) = connect(&mut registry);
        let (viewer, _rx2) = connect(&mut registry);
        registry.register_source(phone, "phoneA".into()).unwrap();
        registry.remove(viewer);

        assert!(!registry.record_request("phoneA".into(), viewer));
        assert_eq!(registry.pending_requester("phoneA"), None);
        registry.assert_consistent();
    }

    #[test_timeout::timeout]
    fn uniqueness_holds_under_churn() {
        let mut registry = IdentityRegistry::new();
        let mut live = Vec::new();
        for round in 0..50u32 {
            let (conn, rx) = connect(&mut registry);
            live.push((conn, rx));
            let identity = format!("phone{}", round % 4);
            registry.register_source(conn, identity).unwrap();
            if round % 3 == 0 {
                let (gone, _) = live.remove((round as usize * 7) % live.len());
                registry.remove(gone);
            }
            registry.assert_consistent();
            assert!(registry.available().len() <= 4);
        }
    }

    #[test_timeout::timeout]
    fn send_to_dropped_receiver_reports_closed_transport() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx);
        assert!(handle.is_open());
        assert!(handle.connected_at() <= Utc::now());
        drop(rx);
        assert!(!handle.is_open());
        assert!(matches!(
            handle.send(ServerEvent::AvailablePhones(vec![])),
            Err(RelayError::TransportClosed(id)) if id == handle.id()
        ));
    }
}
