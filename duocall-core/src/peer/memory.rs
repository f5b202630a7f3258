//! In-process peer connection engine
//!
//! Follows the offer/answer signaling states of a real peer connection
//! without any network I/O. Session descriptions are small SDP-like texts
//! listing the attached tracks, so two instances connected through the
//! relay learn each other's streams exactly as real engines would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{PeerConnectionFactory, PeerConnectionPrimitive, PeerError, PrimitiveEvent, RemoteTrack};
use crate::media::{MediaTrackHandle, TrackKind};
use crate::models::{generate_id, SdpType, SessionDescription, StreamId, TrackId};

/// Signaling state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LocalTrack {
    stream: StreamId,
    track: MediaTrackHandle,
}

struct EngineState {
    signaling: SignalingState,
    version: u64,
    has_session: bool,
    negotiation_flagged: bool,
    local_tracks: Vec<LocalTrack>,
    offered: HashSet<TrackId>,
    negotiated: HashSet<TrackId>,
    remote_tracks: HashSet<TrackId>,
    pending_remote: Vec<(StreamId, RemoteTrack)>,
    events: Option<mpsc::UnboundedSender<PrimitiveEvent>>,
}

impl EngineState {
    fn emit(&self, event: PrimitiveEvent) {
        if let Some(events) = &self.events {
            // Receiver gone means nobody listens any more
            let _ = events.send(event);
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn has_unnegotiated_tracks(&self) -> bool {
        self.local_tracks
            .iter()
            .any(|local| !self.negotiated.contains(&local.track.id))
    }

    /// Raise `NegotiationNeeded` once per batch of unnegotiated tracks
    fn check_negotiation(&mut self) {
        if self.signaling == SignalingState::Stable
            && self.has_session
            && !self.negotiation_flagged
            && self.has_unnegotiated_tracks()
        {
            self.negotiation_flagged = true;
            self.emit(PrimitiveEvent::NegotiationNeeded);
        }
    }

    fn receive_remote_tracks(&mut self, tracks: Vec<(StreamId, RemoteTrack)>) {
        for (stream, track) in tracks {
            if self.remote_tracks.insert(track.id.clone()) {
                self.emit(PrimitiveEvent::TrackReceived { stream, track });
            }
        }
    }
}

/// In-memory `PeerConnectionPrimitive`
pub struct MemoryPeerConnection {
    label: String,
    session_id: String,
    state: Mutex<EngineState>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PrimitiveEvent>>>,
}

impl MemoryPeerConnection {
    pub fn new(label: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            session_id: generate_id(),
            state: Mutex::new(EngineState {
                signaling: SignalingState::Stable,
                version: 0,
                has_session: false,
                negotiation_flagged: false,
                local_tracks: Vec::new(),
                offered: HashSet::new(),
                negotiated: HashSet::new(),
                remote_tracks: HashSet::new(),
                pending_remote: Vec::new(),
                events: Some(sender),
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn render(&self, state: &mut EngineState, sdp_type: SdpType) -> SessionDescription {
        state.version += 1;

        let mut sdp = format!(
            "v=0\r\no=duocall {} {} IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\na=type:{}\r\n",
            self.session_id, state.version, self.label, sdp_type
        );
        for local in &state.local_tracks {
            sdp.push_str(&format!(
                "a=msid:{} {} {}\r\n",
                local.stream, local.track.id, local.track.kind
            ));
        }

        SessionDescription { sdp_type, sdp }
    }
}

/// Extract the announced tracks from a description
fn parse_tracks(description: &SessionDescription) -> Result<Vec<(StreamId, RemoteTrack)>, PeerError> {
    let mut lines = description.sdp.lines().map(str::trim);
    if lines.next() != Some("v=0") {
        return Err(PeerError::Malformed("missing v=0 line".to_string()));
    }

    let mut tracks = Vec::new();
    for line in lines {
        let Some(msid) = line.strip_prefix("a=msid:") else {
            continue;
        };
        let mut parts = msid.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(stream), Some(track), Some(kind)) => tracks.push((
                StreamId::from(stream),
                RemoteTrack {
                    id: TrackId::from(track),
                    kind: TrackKind::from(kind),
                },
            )),
            _ => return Err(PeerError::Malformed(format!("bad msid line: {line}"))),
        }
    }
    Ok(tracks)
}

#[async_trait]
impl PeerConnectionPrimitive for MemoryPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState(
                "cannot create an offer in have-remote-offer".to_string(),
            ));
        }

        let offer = self.render(&mut state, SdpType::Offer);
        state.offered = state.local_tracks.iter().map(|l| l.track.id.clone()).collect();
        state.negotiation_flagged = false;
        state.signaling = SignalingState::HaveLocalOffer;

        debug!(engine = %self.label, version = state.version, "Memory engine created offer");
        Ok(offer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let tracks = parse_tracks(&description)?;
        let mut state = self.state.lock();
        state.ensure_open()?;

        match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => {
                state.pending_remote = tracks;
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                let offered = std::mem::take(&mut state.offered);
                state.negotiated.extend(offered);
                state.has_session = true;
                state.signaling = SignalingState::Stable;
                state.receive_remote_tracks(tracks);
                state.check_negotiation();
            }
            (sdp_type, signaling) => {
                return Err(PeerError::InvalidState(format!(
                    "cannot apply a remote {sdp_type} in {signaling}"
                )));
            }
        }

        debug!(
            engine = %self.label,
            sdp_type = %description.sdp_type,
            state = %state.signaling,
            "Memory engine applied remote description"
        );
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState(format!(
                "cannot create an answer in {}",
                state.signaling
            )));
        }

        let answer = self.render(&mut state, SdpType::Answer);
        let answered: Vec<TrackId> = state.local_tracks.iter().map(|l| l.track.id.clone()).collect();
        state.negotiated.extend(answered);
        state.negotiation_flagged = false;
        state.has_session = true;
        state.signaling = SignalingState::Stable;

        let remote = std::mem::take(&mut state.pending_remote);
        state.receive_remote_tracks(remote);

        debug!(engine = %self.label, version = state.version, "Memory engine created answer");
        Ok(answer)
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        match state.signaling {
            SignalingState::HaveLocalOffer => state.offered.clear(),
            SignalingState::HaveRemoteOffer => state.pending_remote.clear(),
            SignalingState::Stable | SignalingState::Closed => return Ok(()),
        }
        state.signaling = SignalingState::Stable;
        debug!(engine = %self.label, "Memory engine rolled back");
        Ok(())
    }

    async fn add_track(&self, track: MediaTrackHandle, stream: StreamId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.local_tracks.iter().any(|l| l.track.id == track.id) {
            return Err(PeerError::InvalidState(format!("track {} already added", track.id)));
        }

        state.local_tracks.push(LocalTrack { stream, track });
        state.check_negotiation();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrimitiveEvent>> {
        self.receiver.lock().take()
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.events = None;
        Ok(())
    }
}

/// Creates `MemoryPeerConnection`s
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for MemoryPeerConnectionFactory {
    async fn create(&self, label: &str) -> Result<Arc<dyn PeerConnectionPrimitive>, PeerError> {
        Ok(Arc::new(MemoryPeerConnection::new(label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(kind: TrackKind) -> MediaTrackHandle {
        MediaTrackHandle::new(kind, "test")
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<PrimitiveEvent>) -> Vec<PrimitiveEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    async fn handshake(a: &MemoryPeerConnection, b: &MemoryPeerConnection) {
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_stable() {
        let a = MemoryPeerConnection::new("a");
        let b = MemoryPeerConnection::new("b");
        let mut b_events = b.take_events().unwrap();

        let stream = StreamId::from("sa");
        a.add_track(track(TrackKind::Audio), stream.clone()).await.unwrap();
        a.add_track(track(TrackKind::Video), stream.clone()).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(offer.sdp.contains("a=msid:sa"));

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);

        // One event per remote track; the wrapper collapses them per stream
        let received = drain(&mut b_events);
        assert_eq!(received.len(), 2);
        assert!(received
            .iter()
            .all(|e| matches!(e, PrimitiveEvent::TrackReceived { stream, .. } if stream.as_str() == "sa")));
    }

    #[tokio::test]
    async fn test_negotiation_needed_after_session() {
        let a = MemoryPeerConnection::new("a");
        let b = MemoryPeerConnection::new("b");
        let mut a_events = a.take_events().unwrap();

        a.add_track(track(TrackKind::Audio), StreamId::from("sa")).await.unwrap();
        assert!(drain(&mut a_events).is_empty());

        handshake(&a, &b).await;
        assert!(drain(&mut a_events).is_empty());

        a.add_track(track(TrackKind::Video), StreamId::from("screen")).await.unwrap();
        a.add_track(track(TrackKind::Video), StreamId::from("screen2")).await.unwrap();
        assert_eq!(drain(&mut a_events), vec![PrimitiveEvent::NegotiationNeeded]);
    }

    #[tokio::test]
    async fn test_negotiation_deferred_until_stable() {
        let a = MemoryPeerConnection::new("a");
        let b = MemoryPeerConnection::new("b");
        let mut a_events = a.take_events().unwrap();
        handshake(&a, &b).await;

        let offer = a.create_offer().await.unwrap();
        a.add_track(track(TrackKind::Video), StreamId::from("late")).await.unwrap();
        assert!(drain(&mut a_events).is_empty());

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(drain(&mut a_events), vec![PrimitiveEvent::NegotiationNeeded]);
    }

    #[tokio::test]
    async fn test_out_of_sequence_descriptions() {
        let a = MemoryPeerConnection::new("a");

        let err = a.set_remote_description(SessionDescription::answer("v=0")).await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));

        let err = a.create_answer().await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));

        a.create_offer().await.unwrap();
        let err = a.set_remote_description(SessionDescription::offer("v=0")).await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_malformed_description() {
        let a = MemoryPeerConnection::new("a");
        let err = a
            .set_remote_description(SessionDescription::offer("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Malformed(_)));

        let err = a
            .set_remote_description(SessionDescription::offer("v=0\r\na=msid:onlystream\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_rollback_returns_to_stable() {
        let a = MemoryPeerConnection::new("a");
        a.create_offer().await.unwrap();
        a.rollback().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        // Rolling back in stable is harmless
        a.rollback().await.unwrap();
        a.set_remote_description(SessionDescription::offer("v=0")).await.unwrap();
        a.rollback().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_closed_rejects_everything() {
        let a = MemoryPeerConnection::new("a");
        a.close().await.unwrap();

        assert_eq!(a.create_offer().await.unwrap_err(), PeerError::Closed);
        assert_eq!(
            a.add_track(track(TrackKind::Audio), StreamId::from("s")).await.unwrap_err(),
            PeerError::Closed
        );
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let a = MemoryPeerConnection::new("a");
        assert!(a.take_events().is_some());
        assert!(a.take_events().is_none());
    }
}
