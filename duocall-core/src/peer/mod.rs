//! Peer connection layer
//!
//! `PeerConnectionPrimitive` is the seam to the engine that actually does
//! ICE/DTLS/SRTP. `PeerConnection` wraps one primitive and adds the
//! bookkeeping the negotiation needs: the outstanding local offer, attached
//! track ids and per-stream deduplication of inbound media.

mod connection;
pub mod memory;
pub mod rtc;

pub use connection::{PeerConnection, PeerEvent};
pub use memory::{MemoryPeerConnection, MemoryPeerConnectionFactory};
pub use rtc::{WebRtcPeerConnection, WebRtcPeerConnectionFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaTrackHandle, TrackKind};
use crate::models::{SessionDescription, StreamId, TrackId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    StaleDescription(String),

    #[error("malformed session description: {0}")]
    Malformed(String),

    #[error("peer connection is closed")]
    Closed,

    #[error("engine error: {0}")]
    Engine(String),
}

/// Track delivered by the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: TrackId,
    pub kind: TrackKind,
}

/// Notifications raised by a primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveEvent {
    NegotiationNeeded,
    TrackReceived { stream: StreamId, track: RemoteTrack },
}

/// One underlying peer connection
///
/// `create_offer` and `create_answer` install the description they return
/// as the local description. Setting a remote answer completes the round.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerConnectionPrimitive: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Return to the stable state, dropping any pending local or remote offer
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn add_track(&self, track: MediaTrackHandle, stream: StreamId) -> Result<(), PeerError>;

    /// Event receiver; yields `Some` exactly once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrimitiveEvent>>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates one primitive per peer pair
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, label: &str) -> Result<Arc<dyn PeerConnectionPrimitive>, PeerError>;
}
