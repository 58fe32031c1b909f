use std::collections::HashSet;
use tracing::debug;

use crate::error::RelayError;
use crate::registry::{ConnectionHandle, IdentityRegistry};
use crate::signaling::{
    BroadcastKind, ConnectionId, PeerIdentity, RelayMessage, RelayedOffer, ServerEvent,
    StartOffer,
};

/// Per-kind choice of whether a broadcast also goes back to its sender.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    include_sender: HashSet<BroadcastKind>,
}

impl RelayPolicy {
    pub fn new(include_sender: impl IntoIterator<Item = BroadcastKind>) -> Self {
        Self {
            include_sender: include_sender.into_iter().collect(),
        }
    }

    pub fn includes_sender(&self, kind: BroadcastKind) -> bool {
        self.include_sender.contains(&kind)
    }
}

/// A stream request the caller must store before releasing the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub source: PeerIdentity,
    pub requester: ConnectionId,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Routed {
    pub delivered: usize,
    pub pending: Option<PendingRequest>,
}

impl Routed {
    fn delivered(delivered: usize) -> Self {
        Self {
            delivered,
            pending: None,
        }
    }
}

/// Resolves destinations for relayed messages against a registry snapshot.
///
/// Routing never mutates the registry. Callers hold the registry lock for
/// the whole call so that lookup and enqueue happen in one critical section.
#[derive(Debug, Clone, Default)]
pub struct RelayRouter {
    policy: RelayPolicy,
}

impl RelayRouter {
    pub fn new(policy: RelayPolicy) -> Self {
        Self { policy }
    }

    pub fn route(
        &self,
        registry: &IdentityRegistry,
        sender: ConnectionId,
        message: RelayMessage,
    ) -> Result<Routed, RelayError> {
        if registry.connection(sender).is_none() {
            return Err(RelayError::UnknownConnection(sender));
        }

        match message {
            RelayMessage::RequestStream(req) => {
                let event = "request_stream";
                let source = resolve_source(registry, &req.phone_device_id, event)?;
                let requester = req.laptop_socket_id.unwrap_or(sender);
                // a pending request must never name a connection that is gone
                if registry.connection(requester).is_none() {
                    return Err(RelayError::UnresolvedDestination { event });
                }
                source.send(ServerEvent::StartWebrtcOffer(StartOffer {
                    requesting_laptop_socket_id: requester,
                }))?;
                debug!(
                    "Stream request for {} from {} forwarded",
                    req.phone_device_id, requester
                );
                Ok(Routed {
                    delivered: 1,
                    pending: Some(PendingRequest {
                        source: req.phone_device_id,
                        requester,
                    }),
                })
            }

            RelayMessage::SdpOfferFromPhone(offer) => {
                let (source, requester) = resolve_requester(
                    registry,
                    sender,
                    offer.phone_device_id,
                    offer.requesting_laptop_socket_id,
                    "sdp_offer_from_phone",
                )?;
                requester.send(ServerEvent::SdpOfferFromPhone(RelayedOffer {
                    sdp_offer: offer.sdp_offer,
                    phone_device_id: source,
                }))?;
                Ok(Routed::delivered(1))
            }

            RelayMessage::IceCandidateFromPhone(candidate) => {
                let (_, requester) = resolve_requester(
                    registry,
                    sender,
                    candidate.phone_device_id,
                    candidate.requesting_laptop_socket_id,
                    "ice_candidate_from_phone",
                )?;
                requester.send(ServerEvent::IceCandidateFromPhone(candidate.candidate))?;
                Ok(Routed::delivered(1))
            }

            RelayMessage::SdpAnswerFromLaptop(answer) => {
                let source =
                    resolve_source(registry, &answer.phone_device_id, "sdp_answer_from_laptop")?;
                source.send(ServerEvent::SdpAnswerFromLaptop(answer.sdp_answer))?;
                Ok(Routed::delivered(1))
            }

            RelayMessage::IceCandidateFromLaptop(candidate) => {
                let source = resolve_source(
                    registry,
                    &candidate.phone_device_id,
                    "ice_candidate_from_laptop",
                )?;
                source.send(ServerEvent::IceCandidateFromLaptop(candidate.candidate))?;
                Ok(Routed::delivered(1))
            }

            RelayMessage::Control(control) => {
                let source = resolve_source(registry, &control.target_phone_id, "control")?;
                source.send(ServerEvent::Control(control.cmd))?;
                Ok(Routed::delivered(1))
            }

            RelayMessage::Broadcast { kind, payload } => {
                let include_sender = self.policy.includes_sender(kind);
                let mut delivered = 0;
                for peer in registry.connections() {
                    if !include_sender && peer.id() == sender {
                        continue;
                    }
                    match peer.send(ServerEvent::broadcast(kind, payload.clone())) {
                        Ok(()) => delivered += 1,
                        Err(e) => debug!("Skipping {} broadcast: {}", kind, e),
                    }
                }
                Ok(Routed::delivered(delivered))
            }
        }
    }
}

fn resolve_source<'a>(
    registry: &'a IdentityRegistry,
    identity: &str,
    event: &'static str,
) -> Result<&'a ConnectionHandle, RelayError> {
    registry
        .resolve_source(identity)
        .ok_or(RelayError::UnresolvedDestination { event })
}

/// Finds the viewer a source-originated handshake message is meant for: the
/// explicit requester when the message names one, otherwise the last viewer
/// that requested this source's stream.
fn resolve_requester<'a>(
    registry: &'a IdentityRegistry,
    sender: ConnectionId,
    source: Option<PeerIdentity>,
    requester: Option<ConnectionId>,
    event: &'static str,
) -> Result<(PeerIdentity, &'a ConnectionHandle), RelayError> {
    let source = source
        .or_else(|| registry.identity_of(sender).cloned())
        .ok_or(RelayError::UnresolvedDestination { event })?;
    let requester = requester
        .or_else(|| registry.pending_requester(&source))
        .and_then(|conn| registry.connection(conn))
        .ok_or(RelayError::UnresolvedDestination { event })?;
    Ok((source, requester))
}
