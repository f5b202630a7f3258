pub mod description;
pub mod id;

pub use description::{SdpType, SessionDescription};
pub use id::{generate_id, ConnectionId, RoomId, StreamId, TrackId};

use serde::{Deserialize, Serialize};

/// A participant as seen through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    /// Relay connection handle
    pub id: ConnectionId,
    /// Email given at join time; empty when the participant was only
    /// learned from an incoming call
    pub email: String,
}

impl ParticipantIdentity {
    pub fn new(id: ConnectionId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
        }
    }

    /// Identity known only by its connection handle
    #[must_use]
    pub const fn anonymous(id: ConnectionId) -> Self {
        Self {
            id,
            email: String::new(),
        }
    }
}

impl std::fmt::Display for ParticipantIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.email.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} <{}>", self.id, self.email)
        }
    }
}
