use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use duocall_core::models::generate_id;
use duocall_core::protocol::{
    AnswerFrom, AnswerTo, ClientMessage, JoinAck, JoinRequest, OfferFrom, OfferTo, RoomRef, ServerMessage,
    Unreachable, UserJoined, UserLeft,
};
use duocall_core::{ConnectionId, Error, ParticipantIdentity, RoomId, SignalingLink, SignalingTransport};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Participants a room admits
pub const DEFAULT_ROOM_CAPACITY: usize = 2;

/// Frame sender for a relay connection
type FrameSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
struct Occupant {
    id: ConnectionId,
    email: String,
    joined_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: FrameSender,
    room: Option<RoomId>,
    connected_at: DateTime<Utc>,
}

/// Public view of a room occupant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupantInfo {
    pub id: ConnectionId,
    pub email: String,
    pub joined_at: DateTime<Utc>,
}

impl From<&Occupant> for OccupantInfo {
    fn from(occupant: &Occupant) -> Self {
        Self {
            id: occupant.id.clone(),
            email: occupant.email.clone(),
            joined_at: occupant.joined_at,
        }
    }
}

/// In-memory relay routing signaling frames between connections
#[derive(Clone)]
pub struct RelayHub {
    /// Map of room_id -> occupants in join order
    rooms: Arc<DashMap<RoomId, Vec<Occupant>>>,

    /// Map of connection_id -> connection state
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,

    capacity: usize,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }

    /// Relay whose rooms admit `capacity` participants (at least one)
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a connection under a freshly generated handle
    #[must_use]
    pub fn connect(&self) -> SignalingLink {
        loop {
            if let Ok(link) = self.connect_as(ConnectionId::new(generate_id())) {
                return link;
            }
        }
    }

    /// Open a connection under a caller-chosen handle
    pub fn connect_as(&self, id: ConnectionId) -> Result<SignalingLink> {
        let (sender, inbound) = mpsc::unbounded_channel();

        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RelayError::DuplicateConnection(id)),
            Entry::Vacant(entry) => {
                entry.insert(ConnectionEntry {
                    sender,
                    room: None,
                    connected_at: Utc::now(),
                });
            }
        }

        info!(connection_id = %id, "Relay connection opened");

        Ok(SignalingLink {
            connection_id: id.clone(),
            transport: Arc::new(RelayConnection {
                id,
                hub: self.clone(),
            }),
            inbound,
        })
    }

    /// Drop a connection, as if its socket went away
    ///
    /// Remaining room occupants receive `user:left`. Unknown handles are
    /// ignored.
    pub fn disconnect(&self, id: &ConnectionId) {
        let Some((_, entry)) = self.connections.remove(id) else {
            debug!(connection_id = %id, "Disconnect for unknown connection");
            return;
        };

        if let Some(room) = entry.room {
            self.remove_from_room(id, &room);
        }

        let lifetime = Utc::now() - entry.connected_at;
        info!(
            connection_id = %id,
            lifetime_ms = lifetime.num_milliseconds(),
            "Relay connection closed"
        );
    }

    /// Handle one frame sent by connection `from`
    pub fn handle_frame(&self, from: &ConnectionId, frame: &str) -> Result<()> {
        if !self.connections.contains_key(from) {
            return Err(RelayError::UnknownConnection(from.clone()));
        }

        let message = ClientMessage::decode(frame)?;
        debug!(connection_id = %from, event = %message.kind(), "Relay received frame");

        match message {
            ClientMessage::RoomJoin(request) => self.join(from, request),
            ClientMessage::RoomLeave(request) => self.leave(from, &request.room),
            ClientMessage::UserCall(OfferTo { to, offer }) => {
                self.route(from, &to, ServerMessage::IncomingCall(OfferFrom { from: from.clone(), offer }));
                Ok(())
            }
            ClientMessage::CallAccepted(AnswerTo { to, ans }) => {
                self.route(from, &to, ServerMessage::CallAccepted(AnswerFrom { from: from.clone(), ans }));
                Ok(())
            }
            ClientMessage::PeerNegoNeeded(OfferTo { to, offer }) => {
                self.route(from, &to, ServerMessage::PeerNegoNeeded(OfferFrom { from: from.clone(), offer }));
                Ok(())
            }
            ClientMessage::PeerNegoDone(AnswerTo { to, ans }) => {
                self.route(from, &to, ServerMessage::PeerNegoFinal(AnswerFrom { from: from.clone(), ans }));
                Ok(())
            }
        }
    }

    fn join(&self, from: &ConnectionId, request: JoinRequest) -> Result<()> {
        let current = self
            .connections
            .get(from)
            .ok_or_else(|| RelayError::UnknownConnection(from.clone()))?
            .room
            .clone();
        if let Some(room) = current {
            return Err(RelayError::AlreadyInRoom { id: from.clone(), room });
        }

        // Admission is decided under the room's shard lock
        let admitted = {
            let mut occupants = self.rooms.entry(request.room.clone()).or_default();
            if occupants.len() >= self.capacity {
                None
            } else {
                let existing: Vec<UserJoined> = occupants
                    .iter()
                    .map(|occupant| UserJoined {
                        email: occupant.email.clone(),
                        id: occupant.id.clone(),
                    })
                    .collect();
                occupants.push(Occupant {
                    id: from.clone(),
                    email: request.email.clone(),
                    joined_at: Utc::now(),
                });
                Some(existing)
            }
        };

        let Some(existing) = admitted else {
            warn!(
                room_id = %request.room,
                connection_id = %from,
                capacity = self.capacity,
                "Room is full, join rejected"
            );
            self.deliver(from, &ServerMessage::RoomFull(RoomRef { room: request.room }));
            return Ok(());
        };

        if let Some(mut entry) = self.connections.get_mut(from) {
            entry.room = Some(request.room.clone());
        }

        info!(
            room_id = %request.room,
            connection_id = %from,
            email = %request.email,
            occupants = existing.len() + 1,
            "Participant joined room"
        );

        let announcement = ServerMessage::UserJoined(UserJoined {
            email: request.email.clone(),
            id: from.clone(),
        });
        for occupant in &existing {
            self.deliver(&occupant.id, &announcement);
        }

        self.deliver(
            from,
            &ServerMessage::RoomJoined(JoinAck {
                email: request.email,
                room: request.room,
                occupants: existing,
            }),
        );
        Ok(())
    }

    fn leave(&self, from: &ConnectionId, room: &RoomId) -> Result<()> {
        let in_room = {
            let mut entry = self
                .connections
                .get_mut(from)
                .ok_or_else(|| RelayError::UnknownConnection(from.clone()))?;
            if entry.room.as_ref() == Some(room) {
                entry.room = None;
                true
            } else {
                false
            }
        };

        if !in_room {
            return Err(RelayError::NotInRoom {
                id: from.clone(),
                room: room.clone(),
            });
        }

        self.remove_from_room(from, room);
        info!(room_id = %room, connection_id = %from, "Participant left room");
        Ok(())
    }

    /// Remove `id` from `room` and tell whoever remains
    fn remove_from_room(&self, id: &ConnectionId, room: &RoomId) {
        let remaining: Vec<ConnectionId> = match self.rooms.get_mut(room) {
            Some(mut occupants) => {
                occupants.retain(|occupant| &occupant.id != id);
                occupants.iter().map(|occupant| occupant.id.clone()).collect()
            }
            None => Vec::new(),
        };

        if self.rooms.remove_if(room, |_, occupants| occupants.is_empty()).is_some() {
            debug!(room_id = %room, "Room has no more occupants, removed");
        }

        let notice = ServerMessage::UserLeft(UserLeft { id: id.clone() });
        for occupant in &remaining {
            self.deliver(occupant, &notice);
        }
    }

    /// Forward an addressed message, or report the addressee unreachable
    fn route(&self, from: &ConnectionId, to: &ConnectionId, message: ServerMessage) {
        if self.deliver(to, &message) {
            debug!(from = %from, to = %to, event = %message.kind(), "Frame routed");
            return;
        }

        warn!(from = %from, to = %to, event = %message.kind(), "Addressee unreachable");
        self.deliver(from, &ServerMessage::PeerUnreachable(Unreachable { to: to.clone() }));
    }

    /// Encode and push a message to one connection
    fn deliver(&self, to: &ConnectionId, message: &ServerMessage) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(to = %to, event = %message.kind(), error = %err, "Could not encode relay frame");
                return false;
            }
        };

        let sender = match self.connections.get(to) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        match sender.send(frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(to = %to, error = %err, "Connection receiver dropped, disconnecting");
                self.disconnect(to);
                false
            }
        }
    }

    /// Occupants of `room` in join order
    #[must_use]
    pub fn occupants(&self, room: &RoomId) -> Vec<OccupantInfo> {
        self.rooms
            .get(room)
            .map(|occupants| occupants.iter().map(OccupantInfo::from).collect())
            .unwrap_or_default()
    }

    /// Identities of the occupants of `room`
    #[must_use]
    pub fn participants(&self, room: &RoomId) -> Vec<ParticipantIdentity> {
        self.occupants(room)
            .into_iter()
            .map(|occupant| ParticipantIdentity::new(occupant.id, occupant.email))
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Sending half of one relay connection
///
/// Dropping it disconnects the handle from the relay.
pub struct RelayConnection {
    id: ConnectionId,
    hub: RelayHub,
}

impl RelayConnection {
    #[must_use]
    pub const fn id(&self) -> &ConnectionId {
        &self.id
    }
}

#[async_trait]
impl SignalingTransport for RelayConnection {
    async fn send(&self, frame: String) -> duocall_core::Result<()> {
        match self.hub.handle_frame(&self.id, &frame) {
            Ok(()) => Ok(()),
            Err(err) if err.is_disconnected() => Err(Error::SignalingDelivery(err.to_string())),
            Err(err) => {
                // The relay drops frames it cannot act on
                warn!(connection_id = %self.id, error = %err, "Relay rejected frame");
                Ok(())
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.hub.disconnect(&self.id);
    }
}
