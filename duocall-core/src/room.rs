//! Room membership
//!
//! Tracks the local participant's room and the single remote participant
//! sharing it. Rooms hold two participants; a second remote identity while
//! one is held is reported as a capacity violation and never merged.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::error::Result;
use crate::models::{ConnectionId, ParticipantIdentity, RoomId};
use crate::protocol::{ClientMessage, JoinAck, JoinRequest, RoomRef, UserJoined};
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("not in a room")]
    NotInRoom,

    #[error("already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("room capacity exceeded: holding {held}, rejected {incoming}")]
    CapacityExceeded {
        held: ConnectionId,
        incoming: ConnectionId,
    },

    #[error("join acknowledged for unexpected room {room}")]
    UnexpectedAck { room: RoomId },
}

/// Membership changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined { room: RoomId, email: String },
    PeerJoined(ParticipantIdentity),
    PeerLeft(ParticipantIdentity),
    Left(RoomId),
}

#[derive(Debug, Clone)]
struct LocalMembership {
    room: RoomId,
    email: String,
    confirmed: bool,
}

pub struct RoomMembership {
    channel: Arc<SignalingChannel>,
    local: Mutex<Option<LocalMembership>>,
    remote: Mutex<Option<ParticipantIdentity>>,
    events: EventBus<MembershipEvent>,
}

impl RoomMembership {
    #[must_use]
    pub fn new(channel: Arc<SignalingChannel>) -> Self {
        Self {
            channel,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            events: EventBus::new("membership"),
        }
    }

    /// Ask the relay to join `room`; the acknowledgement arrives later
    pub async fn join(&self, room: RoomId, email: impl Into<String>) -> Result<()> {
        let email = email.into();
        {
            let mut local = self.local.lock();
            if let Some(current) = local.as_ref() {
                return Err(MembershipError::AlreadyJoined(current.room.clone()).into());
            }
            *local = Some(LocalMembership {
                room: room.clone(),
                email: email.clone(),
                confirmed: false,
            });
        }

        let request = ClientMessage::RoomJoin(JoinRequest {
            email: email.clone(),
            room: room.clone(),
        });
        if let Err(err) = self.channel.emit(request).await {
            self.local.lock().take();
            return Err(err);
        }

        info!(room_id = %room, email = %email, "Join requested");
        Ok(())
    }

    /// Record the relay's join acknowledgement
    ///
    /// Returns the occupant already in the room, if the relay reported one.
    pub fn handle_joined(&self, ack: &JoinAck) -> std::result::Result<Option<ParticipantIdentity>, MembershipError> {
        {
            let mut local = self.local.lock();
            let membership = local.as_mut().ok_or(MembershipError::NotInRoom)?;
            if membership.room != ack.room {
                return Err(MembershipError::UnexpectedAck {
                    room: ack.room.clone(),
                });
            }
            membership.confirmed = true;
        }

        info!(room_id = %ack.room, email = %ack.email, occupants = ack.occupants.len(), "Join confirmed");
        self.events.publish(MembershipEvent::Joined {
            room: ack.room.clone(),
            email: ack.email.clone(),
        });

        let mut occupant = None;
        for present in &ack.occupants {
            let identity = self.set_remote(ParticipantIdentity::new(present.id.clone(), present.email.clone()))?;
            occupant.get_or_insert(identity);
        }
        Ok(occupant)
    }

    /// Record a participant the relay announced as newly joined
    pub fn handle_peer_joined(&self, joined: &UserJoined) -> std::result::Result<ParticipantIdentity, MembershipError> {
        if self.local.lock().is_none() {
            return Err(MembershipError::NotInRoom);
        }
        self.set_remote(ParticipantIdentity::new(joined.id.clone(), joined.email.clone()))
    }

    /// Record the sender of an incoming call as the remote participant
    ///
    /// The later joiner never sees `user:joined` for the earlier occupant when
    /// the relay omits occupants from the acknowledgement, so the caller's
    /// handle is the first it learns of them.
    pub fn adopt_caller(&self, from: &ConnectionId) -> std::result::Result<ParticipantIdentity, MembershipError> {
        if self.local.lock().is_none() {
            return Err(MembershipError::NotInRoom);
        }
        if let Some(remote) = self.remote.lock().as_ref() {
            if &remote.id == from {
                return Ok(remote.clone());
            }
        }
        self.set_remote(ParticipantIdentity::anonymous(from.clone()))
    }

    fn set_remote(&self, identity: ParticipantIdentity) -> std::result::Result<ParticipantIdentity, MembershipError> {
        {
            let mut remote = self.remote.lock();
            match remote.as_mut() {
                Some(held) if held.id == identity.id => {
                    if held.email.is_empty() && !identity.email.is_empty() {
                        held.email.clone_from(&identity.email);
                    }
                    debug!(peer = %held, "Remote participant already known");
                    return Ok(held.clone());
                }
                Some(held) => {
                    warn!(held = %held.id, incoming = %identity.id, "Room capacity exceeded");
                    return Err(MembershipError::CapacityExceeded {
                        held: held.id.clone(),
                        incoming: identity.id,
                    });
                }
                None => *remote = Some(identity.clone()),
            }
        }

        info!(peer = %identity, "Remote participant joined");
        self.events.publish(MembershipEvent::PeerJoined(identity.clone()));
        Ok(identity)
    }

    /// Forget the remote participant if `id` is the one held
    pub fn handle_peer_left(&self, id: &ConnectionId) -> Option<ParticipantIdentity> {
        let left = {
            let mut remote = self.remote.lock();
            if remote.as_ref().is_some_and(|held| &held.id == id) {
                remote.take()
            } else {
                None
            }
        };

        match &left {
            Some(identity) => {
                info!(peer = %identity, "Remote participant left");
                self.events.publish(MembershipEvent::PeerLeft(identity.clone()));
            }
            None => warn!(peer = %id, "Leave notification for unknown participant"),
        }
        left
    }

    /// Leave the current room; a no-op when not in one
    pub async fn leave(&self) -> Result<Option<RoomId>> {
        let Some(local) = self.local.lock().take() else {
            return Ok(None);
        };
        self.remote.lock().take();

        if let Err(err) = self
            .channel
            .emit(ClientMessage::RoomLeave(RoomRef {
                room: local.room.clone(),
            }))
            .await
        {
            warn!(room_id = %local.room, error = %err, "Could not notify relay of leave");
        }

        info!(room_id = %local.room, "Left room");
        self.events.publish(MembershipEvent::Left(local.room.clone()));
        Ok(Some(local.room))
    }

    /// Drop all membership state without talking to the relay
    pub fn reset(&self) {
        self.local.lock().take();
        self.remote.lock().take();
    }

    pub fn on_joined(&self) -> Subscription<MembershipEvent> {
        self.events
            .subscribe_filtered(|event| matches!(event, MembershipEvent::Joined { .. }))
    }

    pub fn on_peer_joined(&self) -> Subscription<MembershipEvent> {
        self.events
            .subscribe_filtered(|event| matches!(event, MembershipEvent::PeerJoined(_)))
    }

    pub fn on_peer_left(&self) -> Subscription<MembershipEvent> {
        self.events
            .subscribe_filtered(|event| matches!(event, MembershipEvent::PeerLeft(_)))
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription<MembershipEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn remote(&self) -> Option<ParticipantIdentity> {
        self.remote.lock().clone()
    }

    #[must_use]
    pub fn room(&self) -> Option<RoomId> {
        self.local.lock().as_ref().map(|local| local.room.clone())
    }

    #[must_use]
    pub fn email(&self) -> Option<String> {
        self.local.lock().as_ref().map(|local| local.email.clone())
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.local.lock().as_ref().is_some_and(|local| local.confirmed)
    }
}
