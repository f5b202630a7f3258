//! Signaling wire protocol
//!
//! Every frame exchanged with the relay is a JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Frames are decoded into a closed set
//! of variants, one per event name and direction, and validated before any
//! component sees them. Unknown events, unknown fields, empty handles and
//! descriptions of the wrong type are rejected at this boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ConnectionId, RoomId, SdpType, SessionDescription};

/// Protocol validation errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Event {event} is not valid in the {direction} direction")]
    WrongDirection {
        event: &'static str,
        direction: &'static str,
    },

    #[error("Invalid {event} payload: {reason}")]
    InvalidPayload { event: &'static str, reason: String },
}

/// Signaling event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    RoomJoin,
    RoomLeave,
    RoomFull,
    UserJoined,
    UserLeft,
    UserCall,
    IncomingCall,
    CallAccepted,
    PeerNegoNeeded,
    PeerNegoDone,
    PeerNegoFinal,
    PeerUnreachable,
}

impl EventKind {
    pub const ALL: [Self; 12] = [
        Self::RoomJoin,
        Self::RoomLeave,
        Self::RoomFull,
        Self::UserJoined,
        Self::UserLeft,
        Self::UserCall,
        Self::IncomingCall,
        Self::CallAccepted,
        Self::PeerNegoNeeded,
        Self::PeerNegoDone,
        Self::PeerNegoFinal,
        Self::PeerUnreachable,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RoomJoin => "room:join",
            Self::RoomLeave => "room:leave",
            Self::RoomFull => "room:full",
            Self::UserJoined => "user:joined",
            Self::UserLeft => "user:left",
            Self::UserCall => "user:call",
            Self::IncomingCall => "incoming:call",
            Self::CallAccepted => "call:accepted",
            Self::PeerNegoNeeded => "peer:nego:needed",
            Self::PeerNegoDone => "peer:nego:done",
            Self::PeerNegoFinal => "peer:nego:final",
            Self::PeerUnreachable => "peer:unreachable",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `room:join` request: `{ email, room }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinRequest {
    pub email: String,
    pub room: RoomId,
}

/// `room:join` acknowledgement: `{ email, room }`, plus the participants
/// already present in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinAck {
    pub email: String,
    pub room: RoomId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub occupants: Vec<UserJoined>,
}

/// `room:leave` and `room:full`: `{ room }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomRef {
    pub room: RoomId,
}

/// `user:joined`: `{ email, id }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserJoined {
    pub email: String,
    pub id: ConnectionId,
}

/// `user:left`: `{ id }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserLeft {
    pub id: ConnectionId,
}

/// Offer addressed to a peer: `{ to, offer }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OfferTo {
    pub to: ConnectionId,
    pub offer: SessionDescription,
}

/// Offer delivered from a peer: `{ from, offer }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OfferFrom {
    pub from: ConnectionId,
    pub offer: SessionDescription,
}

/// Answer addressed to a peer: `{ to, ans }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnswerTo {
    pub to: ConnectionId,
    pub ans: SessionDescription,
}

/// Answer delivered from a peer: `{ from, ans }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnswerFrom {
    pub from: ConnectionId,
    pub ans: SessionDescription,
}

/// `peer:unreachable`: `{ to }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Unreachable {
    pub to: ConnectionId,
}

/// Frames a participant sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "room:join")]
    RoomJoin(JoinRequest),
    #[serde(rename = "room:leave")]
    RoomLeave(RoomRef),
    #[serde(rename = "user:call")]
    UserCall(OfferTo),
    #[serde(rename = "call:accepted")]
    CallAccepted(AnswerTo),
    #[serde(rename = "peer:nego:needed")]
    PeerNegoNeeded(OfferTo),
    #[serde(rename = "peer:nego:done")]
    PeerNegoDone(AnswerTo),
}

/// Frames the relay delivers to a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "room:join")]
    RoomJoined(JoinAck),
    #[serde(rename = "room:full")]
    RoomFull(RoomRef),
    #[serde(rename = "user:joined")]
    UserJoined(UserJoined),
    #[serde(rename = "user:left")]
    UserLeft(UserLeft),
    #[serde(rename = "incoming:call")]
    IncomingCall(OfferFrom),
    #[serde(rename = "call:accepted")]
    CallAccepted(AnswerFrom),
    #[serde(rename = "peer:nego:needed")]
    PeerNegoNeeded(OfferFrom),
    #[serde(rename = "peer:nego:final")]
    PeerNegoFinal(AnswerFrom),
    #[serde(rename = "peer:unreachable")]
    PeerUnreachable(Unreachable),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn split_frame(frame: &str) -> Result<(EventKind, serde_json::Value), ProtocolError> {
    let raw: RawFrame = serde_json::from_str(frame)?;
    let kind = EventKind::from_name(&raw.event).ok_or(ProtocolError::UnknownEvent(raw.event))?;
    Ok((kind, raw.data))
}

fn invalid(event: EventKind, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        event: event.as_str(),
        reason: reason.into(),
    }
}

fn require_non_empty(event: EventKind, field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(invalid(event, format!("`{field}` must not be empty")));
    }
    Ok(())
}

fn require_description(
    event: EventKind,
    field: &str,
    description: &SessionDescription,
    expected: SdpType,
) -> Result<(), ProtocolError> {
    if description.sdp_type != expected {
        return Err(invalid(
            event,
            format!("`{field}` must be an {expected}, got {}", description.sdp_type),
        ));
    }
    require_non_empty(event, field, &description.sdp)
}

impl ClientMessage {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::RoomJoin(_) => EventKind::RoomJoin,
            Self::RoomLeave(_) => EventKind::RoomLeave,
            Self::UserCall(_) => EventKind::UserCall,
            Self::CallAccepted(_) => EventKind::CallAccepted,
            Self::PeerNegoNeeded(_) => EventKind::PeerNegoNeeded,
            Self::PeerNegoDone(_) => EventKind::PeerNegoDone,
        }
    }

    /// Addressee of a routed message
    #[must_use]
    pub const fn recipient(&self) -> Option<&ConnectionId> {
        match self {
            Self::UserCall(m) | Self::PeerNegoNeeded(m) => Some(&m.to),
            Self::CallAccepted(m) | Self::PeerNegoDone(m) => Some(&m.to),
            Self::RoomJoin(_) | Self::RoomLeave(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        match self {
            Self::RoomJoin(m) => {
                require_non_empty(kind, "email", &m.email)?;
                require_non_empty(kind, "room", m.room.as_str())
            }
            Self::RoomLeave(m) => require_non_empty(kind, "room", m.room.as_str()),
            Self::UserCall(m) | Self::PeerNegoNeeded(m) => {
                require_non_empty(kind, "to", m.to.as_str())?;
                require_description(kind, "offer", &m.offer, SdpType::Offer)
            }
            Self::CallAccepted(m) | Self::PeerNegoDone(m) => {
                require_non_empty(kind, "to", m.to.as_str())?;
                require_description(kind, "ans", &m.ans, SdpType::Answer)
            }
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let (kind, data) = split_frame(frame)?;
        let message = match kind {
            EventKind::RoomJoin => Self::RoomJoin(serde_json::from_value(data)?),
            EventKind::RoomLeave => Self::RoomLeave(serde_json::from_value(data)?),
            EventKind::UserCall => Self::UserCall(serde_json::from_value(data)?),
            EventKind::CallAccepted => Self::CallAccepted(serde_json::from_value(data)?),
            EventKind::PeerNegoNeeded => Self::PeerNegoNeeded(serde_json::from_value(data)?),
            EventKind::PeerNegoDone => Self::PeerNegoDone(serde_json::from_value(data)?),
            other => {
                return Err(ProtocolError::WrongDirection {
                    event: other.as_str(),
                    direction: "participant to relay",
                })
            }
        };
        message.validate()?;
        Ok(message)
    }
}

impl ServerMessage {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::RoomJoined(_) => EventKind::RoomJoin,
            Self::RoomFull(_) => EventKind::RoomFull,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::IncomingCall(_) => EventKind::IncomingCall,
            Self::CallAccepted(_) => EventKind::CallAccepted,
            Self::PeerNegoNeeded(_) => EventKind::PeerNegoNeeded,
            Self::PeerNegoFinal(_) => EventKind::PeerNegoFinal,
            Self::PeerUnreachable(_) => EventKind::PeerUnreachable,
        }
    }

    /// Sender of a routed message, as rewritten by the relay
    #[must_use]
    pub const fn sender(&self) -> Option<&ConnectionId> {
        match self {
            Self::IncomingCall(m) | Self::PeerNegoNeeded(m) => Some(&m.from),
            Self::CallAccepted(m) | Self::PeerNegoFinal(m) => Some(&m.from),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        match self {
            Self::RoomJoined(m) => {
                require_non_empty(kind, "email", &m.email)?;
                require_non_empty(kind, "room", m.room.as_str())?;
                for occupant in &m.occupants {
                    require_non_empty(kind, "occupants.id", occupant.id.as_str())?;
                }
                Ok(())
            }
            Self::RoomFull(m) => require_non_empty(kind, "room", m.room.as_str()),
            Self::UserJoined(m) => {
                require_non_empty(kind, "email", &m.email)?;
                require_non_empty(kind, "id", m.id.as_str())
            }
            Self::UserLeft(m) => require_non_empty(kind, "id", m.id.as_str()),
            Self::IncomingCall(m) | Self::PeerNegoNeeded(m) => {
                require_non_empty(kind, "from", m.from.as_str())?;
                require_description(kind, "offer", &m.offer, SdpType::Offer)
            }
            Self::CallAccepted(m) | Self::PeerNegoFinal(m) => {
                require_non_empty(kind, "from", m.from.as_str())?;
                require_description(kind, "ans", &m.ans, SdpType::Answer)
            }
            Self::PeerUnreachable(m) => require_non_empty(kind, "to", m.to.as_str()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let (kind, data) = split_frame(frame)?;
        let message = match kind {
            EventKind::RoomJoin => Self::RoomJoined(serde_json::from_value(data)?),
            EventKind::RoomFull => Self::RoomFull(serde_json::from_value(data)?),
            EventKind::UserJoined => Self::UserJoined(serde_json::from_value(data)?),
            EventKind::UserLeft => Self::UserLeft(serde_json::from_value(data)?),
            EventKind::IncomingCall => Self::IncomingCall(serde_json::from_value(data)?),
            EventKind::CallAccepted => Self::CallAccepted(serde_json::from_value(data)?),
            EventKind::PeerNegoNeeded => Self::PeerNegoNeeded(serde_json::from_value(data)?),
            EventKind::PeerNegoFinal => Self::PeerNegoFinal(serde_json::from_value(data)?),
            EventKind::PeerUnreachable => Self::PeerUnreachable(serde_json::from_value(data)?),
            other => {
                return Err(ProtocolError::WrongDirection {
                    event: other.as_str(),
                    direction: "relay to participant",
                })
            }
        };
        message.validate()?;
        Ok(message)
    }
}
