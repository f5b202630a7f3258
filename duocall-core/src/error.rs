use thiserror::Error;

use crate::media::MediaError;
use crate::peer::PeerError;
use crate::protocol::ProtocolError;
use crate::room::MembershipError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media acquisition error: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("Signaling delivery error: {0}")]
    SignalingDelivery(String),

    #[error("Negotiation glare: {0}")]
    NegotiationGlare(String),

    #[error("Stale description: {0}")]
    StaleDescription(String),

    #[error("Malformed description: {0}")]
    MalformedDescription(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Whether a new call attempt can follow this error.
    ///
    /// Media failures need user action and a closed session is gone for good;
    /// every other failure leaves the negotiation idle and ready to retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::MediaAcquisition(_) | Self::SessionClosed)
    }
}

impl From<PeerError> for Error {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::InvalidState(msg) => Self::InvalidState(msg),
            PeerError::StaleDescription(msg) => Self::StaleDescription(msg),
            PeerError::Malformed(msg) => Self::MalformedDescription(msg),
            PeerError::Closed => Self::PeerConnection("peer connection closed".to_string()),
            PeerError::Engine(msg) => Self::PeerConnection(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_error_mapping() {
        let err: Error = PeerError::InvalidState("local offer outstanding".to_string()).into();
        assert!(matches!(err, Error::InvalidState(_)));

        let err: Error = PeerError::StaleDescription("no offer".to_string()).into();
        assert!(matches!(err, Error::StaleDescription(_)));

        let err: Error = PeerError::Malformed("missing v= line".to_string()).into();
        assert!(matches!(err, Error::MalformedDescription(ref m) if m == "missing v= line"));
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::SignalingDelivery("relay gone".to_string()).is_recoverable());
        assert!(Error::InvalidState("busy".to_string()).is_recoverable());
        assert!(!Error::MediaAcquisition(MediaError::Denied).is_recoverable());
        assert!(!Error::SessionClosed.is_recoverable());
    }
}
