//! Call session
//!
//! One task per local participant owns the signaling subscription, room
//! membership, the peer connection, the negotiation table and the local
//! stream. Commands from the `SessionHandle`, inbound signaling and peer
//! connection notifications are handled one at a time, so the negotiation
//! machine never sees two events concurrently.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::{Config, NegotiationConfig};
use crate::error::{Error, Result};
use crate::media::{MediaConstraints, MediaSource, MediaStreamHandle, MediaTrackHandle};
use crate::models::{ConnectionId, ParticipantIdentity, RoomId, StreamId};
use crate::negotiation::{
    Effect, FailureKind, Negotiation, NegotiationEvent, NegotiationFailure, NegotiationPolicy, NegotiationTable,
    RoundKind,
};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::RoomMembership;
use crate::signaling::SignalingChannel;

/// Per-participant settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub email: String,
    pub constraints: MediaConstraints,
    pub negotiation: NegotiationConfig,
}

impl SessionOptions {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            constraints: MediaConstraints::default(),
            negotiation: NegotiationConfig::default(),
        }
    }

    pub fn from_config(email: impl Into<String>, config: &Config) -> Self {
        Self {
            email: email.into(),
            constraints: MediaConstraints::from(&config.media),
            negotiation: config.negotiation.clone(),
        }
    }
}

/// What a session reports to its observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Joined {
        room: RoomId,
        email: String,
        occupant: Option<ParticipantIdentity>,
    },
    JoinRejected {
        room: RoomId,
    },
    PeerJoined {
        peer: ParticipantIdentity,
    },
    PeerLeft {
        peer: ParticipantIdentity,
    },
    LocalStream {
        stream: StreamId,
    },
    Connected {
        remote: ConnectionId,
    },
    Renegotiated {
        remote: ConnectionId,
    },
    RemoteStream {
        remote: ConnectionId,
        stream: StreamId,
    },
    NegotiationFailed {
        remote: ConnectionId,
        failure: NegotiationFailure,
    },
    PeerUnreachable {
        remote: ConnectionId,
    },
    MembershipViolation {
        detail: String,
    },
    ProtocolViolation {
        detail: String,
    },
    Left {
        room: RoomId,
    },
    RelayLost,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub local_id: ConnectionId,
    pub email: String,
    pub room: Option<RoomId>,
    pub joined: bool,
    pub remote: Option<ParticipantIdentity>,
    pub negotiation: Option<Negotiation>,
    pub local_stream: Option<StreamId>,
    pub attached_tracks: usize,
    pub remote_streams: Vec<StreamId>,
    pub relay_connected: bool,
}

enum Command {
    Join {
        room: RoomId,
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        reply: oneshot::Sender<Result<()>>,
    },
    SendStreams {
        reply: oneshot::Sender<Result<()>>,
    },
    AddTrack {
        track: MediaTrackHandle,
        reply: oneshot::Sender<Result<StreamId>>,
    },
    Leave {
        reply: oneshot::Sender<Result<Option<RoomId>>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a running `CallSession`
#[derive(Clone)]
pub struct SessionHandle {
    local_id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<SessionEvent>,
    event_timeout: Duration,
}

impl SessionHandle {
    #[must_use]
    pub const fn local_id(&self) -> &ConnectionId {
        &self.local_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    /// Ask the relay to join `room`; confirmation arrives as `SessionEvent::Joined`
    pub async fn join(&self, room: impl Into<RoomId>) -> Result<()> {
        let room = room.into();
        self.request(|reply| Command::Join { room, reply }).await?
    }

    /// Call the remote participant; returns once the offer is sent
    pub async fn call(&self) -> Result<()> {
        self.request(|reply| Command::Call { reply }).await?
    }

    /// Attach the local stream to the peer connection
    pub async fn send_streams(&self) -> Result<()> {
        self.request(|reply| Command::SendStreams { reply }).await?
    }

    /// Attach an extra track on its own stream, e.g. a shared screen
    pub async fn add_track(&self, track: MediaTrackHandle) -> Result<StreamId> {
        self.request(|reply| Command::AddTrack { track, reply }).await?
    }

    pub async fn leave(&self) -> Result<Option<RoomId>> {
        self.request(|reply| Command::Leave { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the session task
    pub fn shutdown(&self) {
        // Already stopped when the send fails
        let _ = self.commands.send(Command::Shutdown);
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait for the next event matching `predicate` on `subscription`
    pub async fn wait_for<P>(&self, subscription: &mut Subscription<SessionEvent>, predicate: P) -> Result<SessionEvent>
    where
        P: FnMut(&SessionEvent) -> bool,
    {
        match tokio::time::timeout(self.event_timeout, subscription.next_matching(predicate)).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(Error::SessionClosed),
            Err(_) => Err(Error::Timeout(format!(
                "no matching session event within {}ms",
                self.event_timeout.as_millis()
            ))),
        }
    }
}

/// State owned by the session task
pub struct CallSession {
    channel: Arc<SignalingChannel>,
    membership: RoomMembership,
    factory: Arc<dyn PeerConnectionFactory>,
    media: Arc<dyn MediaSource>,
    options: SessionOptions,
    table: NegotiationTable,
    peer: Option<PeerConnection>,
    peer_events: Option<Subscription<PeerEvent>>,
    local_stream: Option<Arc<MediaStreamHandle>>,
    extra_tracks: Vec<(StreamId, MediaTrackHandle)>,
    events: EventBus<SessionEvent>,
}

impl CallSession {
    /// Start a session task on `channel`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        channel: Arc<SignalingChannel>,
        factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaSource>,
        options: SessionOptions,
    ) -> (SessionHandle, JoinHandle<()>) {
        let local_id = channel.local_id().clone();
        let (commands, receiver) = mpsc::unbounded_channel();
        let events = EventBus::new("session");
        let signaling = channel.subscribe_all();

        let handle = SessionHandle {
            local_id: local_id.clone(),
            commands,
            events: events.clone(),
            event_timeout: options.negotiation.event_timeout(),
        };

        let session = Self {
            membership: RoomMembership::new(Arc::clone(&channel)),
            table: NegotiationTable::new(local_id, NegotiationPolicy::from(&options.negotiation)),
            channel,
            factory,
            media,
            options,
            peer: None,
            peer_events: None,
            local_stream: None,
            extra_tracks: Vec::new(),
            events,
        };

        let task = tokio::spawn(session.run(receiver, signaling));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut signaling: Subscription<ServerMessage>) {
        let disconnected = self.channel.disconnected();
        let mut relay_lost = false;

        info!(connection_id = %self.channel.local_id(), email = %self.options.email, "Call session started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                message = signaling.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        error!("Signaling subscription closed");
                        break;
                    }
                },

                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => self.peer_events = None,
                },

                () = disconnected.cancelled(), if !relay_lost => {
                    relay_lost = true;
                    self.handle_relay_lost().await;
                }
            }
        }

        self.close_peer().await;
        info!(connection_id = %self.channel.local_id(), "Call session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room, reply } => {
                let result = self.membership.join(room, self.options.email.clone()).await;
                let _ = reply.send(result);
            }
            Command::Call { reply } => {
                let result = self.call().await;
                let _ = reply.send(result);
            }
            Command::SendStreams { reply } => {
                let result = self.attach_local_tracks().await;
                let _ = reply.send(result);
            }
            Command::AddTrack { track, reply } => {
                let result = self.add_track(track).await;
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                let result = self.leave().await;
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn call(&mut self) -> Result<()> {
        let remote = self
            .membership
            .remote()
            .ok_or_else(|| Error::InvalidState("no remote participant to call".to_string()))?;

        info!(peer = %remote, "Calling remote participant");
        self.ensure_peer(&remote.id).await?;
        self.drive(&remote.id, NegotiationEvent::CallRequested).await
    }

    async fn add_track(&mut self, track: MediaTrackHandle) -> Result<StreamId> {
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no peer connection to add a track to".to_string()))?;

        let stream = StreamId::generate();
        peer.add_track(&track, &stream).await?;
        info!(track_id = %track.id, kind = %track.kind, stream_id = %stream, "Added extra track");
        self.extra_tracks.push((stream.clone(), track));
        Ok(stream)
    }

    async fn leave(&mut self) -> Result<Option<RoomId>> {
        let room = self.membership.leave().await?;

        self.table.clear();
        self.close_peer().await;
        self.local_stream = None;
        self.extra_tracks.clear();

        if let Some(room) = &room {
            self.events.publish(SessionEvent::Left { room: room.clone() });
        }
        Ok(room)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let remote = self.membership.remote();
        let negotiation = remote
            .as_ref()
            .and_then(|remote| self.table.get(&remote.id))
            .or_else(|| self.table.iter().next())
            .cloned();

        SessionSnapshot {
            local_id: self.channel.local_id().clone(),
            email: self.options.email.clone(),
            room: self.membership.room(),
            joined: self.membership.is_confirmed(),
            remote,
            negotiation,
            local_stream: self.local_stream.as_ref().map(|stream| stream.id.clone()),
            attached_tracks: self.peer.as_ref().map_or(0, PeerConnection::attached_track_count),
            remote_streams: self.peer.as_ref().map(PeerConnection::remote_streams).unwrap_or_default(),
            relay_connected: self.channel.is_connected(),
        }
    }

    async fn handle_signal(&mut self, message: ServerMessage) {
        debug!(event = %message.kind(), from = ?message.sender().map(ConnectionId::as_str), "Signaling message received");

        match message {
            ServerMessage::RoomJoined(ack) => match self.membership.handle_joined(&ack) {
                Ok(occupant) => {
                    self.events.publish(SessionEvent::Joined {
                        room: ack.room,
                        email: ack.email,
                        occupant: occupant.clone(),
                    });
                    if let Some(peer) = occupant {
                        self.events.publish(SessionEvent::PeerJoined { peer });
                    }
                }
                Err(err) => self.membership_violation(err.to_string()),
            },
            ServerMessage::RoomFull(full) => {
                warn!(room_id = %full.room, "Room is full");
                self.membership.reset();
                self.events.publish(SessionEvent::JoinRejected { room: full.room });
            }
            ServerMessage::UserJoined(joined) => match self.membership.handle_peer_joined(&joined) {
                Ok(peer) => {
                    self.events.publish(SessionEvent::PeerJoined { peer });
                }
                Err(err) => self.membership_violation(err.to_string()),
            },
            ServerMessage::UserLeft(left) => {
                if let Some(peer) = self.membership.handle_peer_left(&left.id) {
                    self.table.remove(&peer.id);
                    self.close_peer().await;
                    self.events.publish(SessionEvent::PeerLeft { peer });
                }
            }
            ServerMessage::IncomingCall(call) => {
                let caller = match self.membership.adopt_caller(&call.from) {
                    Ok(caller) => caller,
                    Err(err) => {
                        self.membership_violation(err.to_string());
                        return;
                    }
                };
                info!(peer = %caller, "Incoming call");

                if let Err(err) = self.ensure_peer(&caller.id).await {
                    self.surface(&caller.id, &NegotiationFailure::from(&err));
                    return;
                }
                self.drive_logged(
                    &caller.id,
                    NegotiationEvent::RemoteOffer {
                        from: call.from,
                        kind: RoundKind::Initial,
                        offer: call.offer,
                    },
                )
                .await;
            }
            ServerMessage::PeerNegoNeeded(offer) => {
                self.route_description(NegotiationEvent::RemoteOffer {
                    from: offer.from,
                    kind: RoundKind::Renegotiation,
                    offer: offer.offer,
                })
                .await;
            }
            ServerMessage::CallAccepted(answer) => {
                self.route_description(NegotiationEvent::RemoteAnswer {
                    from: answer.from,
                    kind: RoundKind::Initial,
                    answer: answer.ans,
                })
                .await;
            }
            ServerMessage::PeerNegoFinal(answer) => {
                self.route_description(NegotiationEvent::RemoteAnswer {
                    from: answer.from,
                    kind: RoundKind::Renegotiation,
                    answer: answer.ans,
                })
                .await;
            }
            ServerMessage::PeerUnreachable(unreachable) => {
                warn!(peer = %unreachable.to, "Peer unreachable");
                self.events.publish(SessionEvent::PeerUnreachable {
                    remote: unreachable.to.clone(),
                });

                let in_round = self
                    .table
                    .get(&unreachable.to)
                    .is_some_and(|pair| !pair.phase().is_idle());
                if in_round {
                    let failure = NegotiationFailure::new(
                        FailureKind::SignalingDelivery,
                        format!("peer {} is unreachable", unreachable.to),
                    );
                    self.drive_logged(&unreachable.to, NegotiationEvent::Failed(failure)).await;
                }
            }
        }
    }

    /// Hand a remote description to the pair of the held remote participant
    async fn route_description(&mut self, event: NegotiationEvent) {
        let Some(remote) = self.membership.remote() else {
            let detail = format!("description received with no remote participant: {event:?}");
            warn!(detail = %detail, "Dropping description");
            self.events.publish(SessionEvent::ProtocolViolation { detail });
            return;
        };
        self.drive_logged(&remote.id, event).await;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(remote) = self.membership.remote() else {
            debug!(?event, "Peer event with no remote participant");
            return;
        };

        match event {
            PeerEvent::NegotiationNeeded => {
                self.drive_logged(&remote.id, NegotiationEvent::NegotiationNeeded).await;
            }
            PeerEvent::TrackReceived(stream) => {
                info!(peer = %remote.id, stream_id = %stream, "Remote stream received");
                self.events.publish(SessionEvent::RemoteStream {
                    remote: remote.id,
                    stream,
                });
            }
        }
    }

    async fn handle_relay_lost(&mut self) {
        warn!(connection_id = %self.channel.local_id(), "Relay connection lost");
        self.membership.reset();
        self.table.clear();
        self.close_peer().await;
        self.events.publish(SessionEvent::RelayLost);
    }

    async fn drive_logged(&mut self, remote: &ConnectionId, event: NegotiationEvent) {
        if let Err(err) = self.drive(remote, event).await {
            debug!(peer = %remote, error = %err, "Negotiation step did not complete");
        }
    }

    /// Step the pair's machine and perform effects until it rests
    ///
    /// Returns the first failure, which has already been published.
    async fn drive(&mut self, remote: &ConnectionId, event: NegotiationEvent) -> Result<()> {
        let mut pending = VecDeque::from([event]);
        let mut outcome = Ok(());

        while let Some(event) = pending.pop_front() {
            for effect in self.table.step(remote, event) {
                if let Effect::Surface(failure) = effect {
                    self.surface(remote, &failure);
                    if outcome.is_ok() {
                        outcome = Err(failure.into());
                    }
                    continue;
                }

                match self.perform(remote, effect).await {
                    Ok(Some(next)) => pending.push_back(next),
                    Ok(None) => {}
                    Err(err) => {
                        pending.push_back(NegotiationEvent::Failed(NegotiationFailure::from(&err)));
                        if outcome.is_ok() {
                            outcome = Err(err);
                        }
                        break;
                    }
                }
            }
        }

        outcome
    }

    async fn perform(&mut self, remote: &ConnectionId, effect: Effect) -> Result<Option<NegotiationEvent>> {
        match effect {
            Effect::AcquireMedia => {
                self.ensure_local_stream().await?;
                Ok(None)
            }
            Effect::CreateOffer => {
                let offer = self.peer()?.create_offer().await?;
                Ok(Some(NegotiationEvent::OfferCreated(offer)))
            }
            Effect::DiscardLocalOffer => {
                self.peer()?.discard_local_offer().await?;
                Ok(None)
            }
            Effect::CreateAnswer(offer) => {
                let answer = self.peer()?.create_answer(offer).await?;
                Ok(Some(NegotiationEvent::AnswerCreated(answer)))
            }
            Effect::ApplyAnswer(answer) => {
                self.peer()?.apply_answer(answer).await?;
                Ok(Some(NegotiationEvent::AnswerApplied))
            }
            Effect::Emit(message) => {
                let answer = matches!(message, ClientMessage::CallAccepted(_) | ClientMessage::PeerNegoDone(_));
                self.channel.emit(message).await?;
                Ok(answer.then_some(NegotiationEvent::AnswerSent))
            }
            Effect::AttachLocalTracks => {
                self.attach_local_tracks().await?;
                Ok(None)
            }
            Effect::ResetPeer => {
                if let Some(peer) = &self.peer {
                    peer.reset_round().await;
                }
                Ok(None)
            }
            Effect::Connected(kind) => {
                info!(peer = %remote, round = %kind, "Negotiation round complete");
                let event = match kind {
                    RoundKind::Initial => SessionEvent::Connected { remote: remote.clone() },
                    RoundKind::Renegotiation => SessionEvent::Renegotiated { remote: remote.clone() },
                };
                self.events.publish(event);
                Ok(None)
            }
            Effect::Surface(failure) => {
                self.surface(remote, &failure);
                Ok(None)
            }
        }
    }

    fn peer(&self) -> Result<&PeerConnection> {
        self.peer
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no peer connection".to_string()))
    }

    async fn ensure_peer(&mut self, remote: &ConnectionId) -> Result<()> {
        if self.peer.is_some() {
            return Ok(());
        }

        let label = format!("{}->{}", self.channel.local_id(), remote);
        let primitive = self.factory.create(&label).await?;
        let peer = PeerConnection::new(label, primitive);
        self.peer_events = Some(peer.subscribe());
        self.peer = Some(peer);
        Ok(())
    }

    async fn ensure_local_stream(&mut self) -> Result<Arc<MediaStreamHandle>> {
        if let Some(stream) = &self.local_stream {
            return Ok(Arc::clone(stream));
        }

        let stream = self.media.acquire(self.options.constraints).await?;
        info!(stream_id = %stream.id, tracks = stream.tracks.len(), "Local media acquired");
        self.local_stream = Some(Arc::clone(&stream));
        self.events.publish(SessionEvent::LocalStream {
            stream: stream.id.clone(),
        });
        Ok(stream)
    }

    async fn attach_local_tracks(&mut self) -> Result<()> {
        if self.peer.is_none() {
            return Err(Error::InvalidState("no peer connection to send streams on".to_string()));
        }
        let stream = self.ensure_local_stream().await?;
        let added = self.peer()?.attach_stream(&stream).await?;
        debug!(stream_id = %stream.id, added, "Local tracks attached");
        Ok(())
    }

    async fn close_peer(&mut self) {
        self.peer_events = None;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }

    fn surface(&self, remote: &ConnectionId, failure: &NegotiationFailure) {
        warn!(peer = %remote, kind = ?failure.kind, detail = %failure.detail, "Negotiation failure");
        self.events.publish(SessionEvent::NegotiationFailed {
            remote: remote.clone(),
            failure: failure.clone(),
        });
    }

    fn membership_violation(&self, detail: String) {
        warn!(detail = %detail, "Membership violation");
        self.events.publish(SessionEvent::MembershipViolation { detail });
    }
}

async fn next_peer_event(events: &mut Option<Subscription<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
