//! Offer/answer negotiation
//!
//! Each peer pair has one `Negotiation` value. Transitions are pure:
//! `Negotiation::step` takes an event and returns the next state together
//! with the effects the session driver must perform. Completions of those
//! effects come back in as further events.

mod state;
mod table;

pub use state::{Negotiation, Transition};
pub use table::NegotiationTable;

use serde::Serialize;
use std::fmt;

use crate::error::Error;
use crate::models::{ConnectionId, SessionDescription};
use crate::protocol::ClientMessage;

/// Initial call or a later renegotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Initial,
    Renegotiation,
}

impl RoundKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Renegotiation => "renegotiation",
        }
    }
}

impl fmt::Display for RoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the current round stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "round", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// Our offer is out (or being produced) and we await the answer
    OfferSent(RoundKind),
    /// We are producing the answer to a remote offer
    Answering(RoundKind),
}

impl Phase {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::OfferSent(kind) => write!(f, "offer-sent({kind})"),
            Self::Answering(kind) => write!(f, "answering({kind})"),
        }
    }
}

/// Which side started the current or most recent round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    None,
    Initiator,
    Responder,
}

/// Tunables for a negotiation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiationPolicy {
    /// Attach local tracks before answering an incoming call
    pub attach_tracks_on_answer: bool,
}

impl From<&crate::config::NegotiationConfig> for NegotiationPolicy {
    fn from(config: &crate::config::NegotiationConfig) -> Self {
        Self {
            attach_tracks_on_answer: config.attach_tracks_on_answer,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Local user wants to call the remote participant
    CallRequested,
    OfferCreated(SessionDescription),
    RemoteOffer {
        from: ConnectionId,
        kind: RoundKind,
        offer: SessionDescription,
    },
    AnswerCreated(SessionDescription),
    /// Our answer was handed to the relay
    AnswerSent,
    RemoteAnswer {
        from: ConnectionId,
        kind: RoundKind,
        answer: SessionDescription,
    },
    AnswerApplied,
    /// The peer connection wants a new offer (tracks changed)
    NegotiationNeeded,
    /// An effect could not be performed
    Failed(NegotiationFailure),
}

/// Work the driver performs on behalf of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AcquireMedia,
    /// Completes with `OfferCreated`
    CreateOffer,
    DiscardLocalOffer,
    /// Completes with `AnswerCreated`
    CreateAnswer(SessionDescription),
    /// Completes with `AnswerApplied`
    ApplyAnswer(SessionDescription),
    /// Answers complete with `AnswerSent`
    Emit(ClientMessage),
    AttachLocalTracks,
    /// Roll the peer connection back to a stable state
    ResetPeer,
    Connected(RoundKind),
    Surface(NegotiationFailure),
}

/// Failure category of an aborted or rejected step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MediaAcquisition,
    SignalingDelivery,
    Glare,
    StaleDescription,
    MalformedDescription,
    InvalidState,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl NegotiationFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidState, detail)
    }

    pub fn stale(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::StaleDescription, detail)
    }
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl From<&Error> for NegotiationFailure {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::MediaAcquisition(_) => FailureKind::MediaAcquisition,
            Error::SignalingDelivery(_) => FailureKind::SignalingDelivery,
            Error::NegotiationGlare(_) => FailureKind::Glare,
            Error::StaleDescription(_) => FailureKind::StaleDescription,
            Error::MalformedDescription(_) => FailureKind::MalformedDescription,
            Error::PeerConnection(_) => FailureKind::Peer,
            Error::InvalidState(_)
            | Error::Protocol(_)
            | Error::Membership(_)
            | Error::Serialization(_)
            | Error::Timeout(_)
            | Error::SessionClosed => FailureKind::InvalidState,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<NegotiationFailure> for Error {
    fn from(failure: NegotiationFailure) -> Self {
        match failure.kind {
            FailureKind::MediaAcquisition => {
                Self::MediaAcquisition(crate::media::MediaError::Unavailable(failure.detail))
            }
            FailureKind::Peer => Self::PeerConnection(failure.detail),
            FailureKind::SignalingDelivery => Self::SignalingDelivery(failure.detail),
            FailureKind::Glare => Self::NegotiationGlare(failure.detail),
            FailureKind::StaleDescription => Self::StaleDescription(failure.detail),
            FailureKind::MalformedDescription => Self::MalformedDescription(failure.detail),
            FailureKind::InvalidState => Self::InvalidState(failure.detail),
        }
    }
}
