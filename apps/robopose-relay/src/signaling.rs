use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity a source device picks for itself when it registers.
pub type PeerIdentity = String;

/// Opaque id the transport layer assigns to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Messages that carry no destination and fan out to every other peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastKind {
    PoseChange,
    JointControl,
    CameraFrame,
    Move,
    ToggleCamera,
    StartCamera,
}

impl BroadcastKind {
    pub const ALL: [BroadcastKind; 6] = [
        BroadcastKind::PoseChange,
        BroadcastKind::JointControl,
        BroadcastKind::CameraFrame,
        BroadcastKind::Move,
        BroadcastKind::ToggleCamera,
        BroadcastKind::StartCamera,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastKind::PoseChange => "pose-change",
            BroadcastKind::JointControl => "joint-control",
            BroadcastKind::CameraFrame => "camera-frame",
            BroadcastKind::Move => "move",
            BroadcastKind::ToggleCamera => "toggle-camera",
            BroadcastKind::StartCamera => "start-camera",
        }
    }
}

impl fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BroadcastKind {
    type Err = UnknownBroadcastKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BroadcastKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownBroadcastKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown broadcast kind `{0}`")]
pub struct UnknownBroadcastKind(pub String);

/// A viewer asking a source to start negotiating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    #[serde(alias = "targetIdentity")]
    pub phone_device_id: PeerIdentity,
    /// Defaults to the connection that sent the request.
    #[serde(default, alias = "requesterConnectionRef")]
    pub laptop_socket_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneOffer {
    pub sdp_offer: Value,
    #[serde(default, alias = "sourceIdentity")]
    pub phone_device_id: Option<PeerIdentity>,
    #[serde(default, alias = "requesterConnectionRef")]
    pub requesting_laptop_socket_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneCandidate {
    pub candidate: Value,
    #[serde(default, alias = "sourceIdentity")]
    pub phone_device_id: Option<PeerIdentity>,
    #[serde(default, alias = "requesterConnectionRef")]
    pub requesting_laptop_socket_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaptopAnswer {
    pub sdp_answer: Value,
    #[serde(alias = "targetIdentity")]
    pub phone_device_id: PeerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaptopCandidate {
    pub candidate: Value,
    #[serde(alias = "targetIdentity")]
    pub phone_device_id: PeerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    #[serde(alias = "command")]
    pub cmd: Value,
    #[serde(alias = "targetIdentity")]
    pub target_phone_id: PeerIdentity,
}

/// Events sent from a client to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    RegisterPhone(PeerIdentity),
    RegisterLaptop,
    RequestStream(StreamRequest),
    SdpOfferFromPhone(PhoneOffer),
    SdpAnswerFromLaptop(LaptopAnswer),
    IceCandidateFromPhone(PhoneCandidate),
    IceCandidateFromLaptop(LaptopCandidate),
    Control(ControlCommand),
    #[serde(rename = "pose-change")]
    PoseChange(Value),
    #[serde(rename = "joint-control")]
    JointControl(Value),
    #[serde(rename = "camera-frame")]
    CameraFrame(Value),
    #[serde(rename = "move")]
    Move(Value),
    #[serde(rename = "toggle-camera")]
    ToggleCamera(Value),
    #[serde(rename = "start-camera")]
    StartCamera(Value),
}

impl ClientEvent {
    /// Parses one `{"event", "data"}` envelope. A missing `data` field is
    /// read as `null` so payload-less events like `toggle-camera` parse.
    pub fn parse(frame: &str) -> serde_json::Result<Self> {
        let mut envelope: Value = serde_json::from_str(frame)?;
        if let Value::Object(map) = &mut envelope {
            map.entry("data").or_insert(Value::Null);
        }
        serde_json::from_value(envelope)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RegisterPhone(_) => "register_phone",
            ClientEvent::RegisterLaptop => "register_laptop",
            ClientEvent::RequestStream(_) => "request_stream",
            ClientEvent::SdpOfferFromPhone(_) => "sdp_offer_from_phone",
            ClientEvent::SdpAnswerFromLaptop(_) => "sdp_answer_from_laptop",
            ClientEvent::IceCandidateFromPhone(_) => "ice_candidate_from_phone",
            ClientEvent::IceCandidateFromLaptop(_) => "ice_candidate_from_laptop",
            ClientEvent::Control(_) => "control",
            ClientEvent::PoseChange(_) => "pose-change",
            ClientEvent::JointControl(_) => "joint-control",
            ClientEvent::CameraFrame(_) => "camera-frame",
            ClientEvent::Move(_) => "move",
            ClientEvent::ToggleCamera(_) => "toggle-camera",
            ClientEvent::StartCamera(_) => "start-camera",
        }
    }
}

/// Routed messages, i.e. everything except the registration events.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    RequestStream(StreamRequest),
    SdpOfferFromPhone(PhoneOffer),
    SdpAnswerFromLaptop(LaptopAnswer),
    IceCandidateFromPhone(PhoneCandidate),
    IceCandidateFromLaptop(LaptopCandidate),
    Control(ControlCommand),
    Broadcast { kind: BroadcastKind, payload: Value },
}

/// Split of a client event into what the lifecycle manager handles and
/// what goes through the router.
#[derive(Debug, Clone)]
pub enum Inbound {
    RegisterSource(PeerIdentity),
    RegisterViewer,
    Relay(RelayMessage),
}

impl From<ClientEvent> for Inbound {
    fn from(event: ClientEvent) -> Self {
        let broadcast = |kind, payload| Inbound::Relay(RelayMessage::Broadcast { kind, payload });
        match event {
            ClientEvent::RegisterPhone(identity) => Inbound::RegisterSource(identity),
            ClientEvent::RegisterLaptop => Inbound::RegisterViewer,
            ClientEvent::RequestStream(req) => Inbound::Relay(RelayMessage::RequestStream(req)),
            ClientEvent::SdpOfferFromPhone(offer) => {
                Inbound::Relay(RelayMessage::SdpOfferFromPhone(offer))
            }
            ClientEvent::SdpAnswerFromLaptop(answer) => {
                Inbound::Relay(RelayMessage::SdpAnswerFromLaptop(answer))
            }
            ClientEvent::IceCandidateFromPhone(candidate) => {
                Inbound::Relay(RelayMessage::IceCandidateFromPhone(candidate))
            }
            ClientEvent::IceCandidateFromLaptop(candidate) => {
                Inbound::Relay(RelayMessage::IceCandidateFromLaptop(candidate))
            }
            ClientEvent::Control(cmd) => Inbound::Relay(RelayMessage::Control(cmd)),
            ClientEvent::PoseChange(p) => broadcast(BroadcastKind::PoseChange, p),
            ClientEvent::JointControl(p) => broadcast(BroadcastKind::JointControl, p),
            ClientEvent::CameraFrame(p) => broadcast(BroadcastKind::CameraFrame, p),
            ClientEvent::Move(p) => broadcast(BroadcastKind::Move, p),
            ClientEvent::ToggleCamera(p) => broadcast(BroadcastKind::ToggleCamera, p),
            ClientEvent::StartCamera(p) => broadcast(BroadcastKind::StartCamera, p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOffer {
    pub requesting_laptop_socket_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedOffer {
    pub sdp_offer: Value,
    pub phone_device_id: PeerIdentity,
}

/// Events sent from the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected(ConnectedInfo),
    AvailablePhones(Vec<PeerIdentity>),
    StartWebrtcOffer(StartOffer),
    SdpOfferFromPhone(RelayedOffer),
    SdpAnswerFromLaptop(Value),
    IceCandidateFromPhone(Value),
    IceCandidateFromLaptop(Value),
    Control(Value),
    #[serde(rename = "pose-change")]
    PoseChange(Value),
    #[serde(rename = "joint-control")]
    JointControl(Value),
    #[serde(rename = "camera-frame")]
    CameraFrame(Value),
    #[serde(rename = "move")]
    Move(Value),
    #[serde(rename = "toggle-camera")]
    ToggleCamera(Value),
    #[serde(rename = "start-camera")]
    StartCamera(Value),
}

impl ServerEvent {
    pub fn broadcast(kind: BroadcastKind, payload: Value) -> Self {
        match kind {
            BroadcastKind::PoseChange => ServerEvent::PoseChange(payload),
            BroadcastKind::JointControl => ServerEvent::JointControl(payload),
            BroadcastKind::CameraFrame => ServerEvent::CameraFrame(payload),
            BroadcastKind::Move => ServerEvent::Move(payload),
            BroadcastKind::ToggleCamera => ServerEvent::ToggleCamera(payload),
            BroadcastKind::StartCamera => ServerEvent::StartCamera(payload),
        }
    }
}
