//! duocall core
//!
//! Signaling and negotiation for two-party peer-to-peer audio/video calls.
//! A relay only carries short signaling frames; media flows directly between
//! the two peer connections once the offer/answer handshake completes.
//!
//! ## Architecture
//!
//! - **`SignalingChannel`**: emit/subscribe for relay events, validated at the boundary
//! - **`PeerConnection`**: wrapper around one peer-connection primitive
//! - **`RoomMembership`**: which remote participant (if any) shares the room
//! - **`Negotiation`**: per-pair offer/answer/renegotiation state machine
//! - **`CallSession`**: the event loop that ties the pieces together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duocall_core::{CallSession, SessionOptions, SignalingChannel};
//!
//! let channel = SignalingChannel::connect(link);
//! let (handle, _task) = CallSession::spawn(channel, factory, media, SessionOptions::new("a@x.com"));
//! handle.join("42").await?;
//! handle.call().await?;
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod models;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod session;
pub mod signaling;

pub use bus::{EventBus, Subscription};
pub use config::Config;
pub use error::{Error, Result};
pub use media::{MediaConstraints, MediaError, MediaSource, MediaStreamHandle, MediaTrackHandle, SyntheticMediaSource, TrackKind};
pub use models::{ConnectionId, ParticipantIdentity, RoomId, SdpType, SessionDescription, StreamId};
pub use negotiation::{
    Effect, FailureKind, Negotiation, NegotiationEvent, NegotiationFailure, NegotiationPolicy, NegotiationTable, Phase,
    RoundKind,
};
pub use peer::{
    MemoryPeerConnectionFactory, PeerConnection, PeerConnectionFactory, PeerConnectionPrimitive, PeerError, PeerEvent,
    WebRtcPeerConnectionFactory,
};
pub use protocol::{ClientMessage, EventKind, ServerMessage};
pub use room::{MembershipError, RoomMembership};
pub use session::{CallSession, SessionEvent, SessionHandle, SessionOptions, SessionSnapshot};
pub use signaling::{SignalingChannel, SignalingLink, SignalingTransport};
