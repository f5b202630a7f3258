//! Error types for the relay

use duocall_core::protocol::ProtocolError;
use duocall_core::{ConnectionId, RoomId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {0} already exists")]
    DuplicateConnection(ConnectionId),

    #[error("Connection {id} is already in room {room}")]
    AlreadyInRoom { id: ConnectionId, room: RoomId },

    #[error("Connection {id} is not in room {room}")]
    NotInRoom { id: ConnectionId, room: RoomId },
}

impl RelayError {
    /// Whether the sending connection itself is gone
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::UnknownConnection(_))
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
