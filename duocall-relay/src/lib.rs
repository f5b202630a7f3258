//! In-memory signaling relay
//!
//! Holds rooms of at most two participants and forwards addressed
//! signaling frames between their connections. Frames cross the relay as
//! encoded JSON so both ends exercise the wire protocol.

pub mod error;
pub mod hub;

pub use error::{RelayError, Result};
pub use hub::{OccupantInfo, RelayConnection, RelayHub, DEFAULT_ROOM_CAPACITY};
