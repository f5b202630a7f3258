use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PeerConnectionPrimitive, PeerError, PrimitiveEvent};
use crate::bus::{EventBus, Subscription};
use crate::media::{MediaStreamHandle, MediaTrackHandle};
use crate::models::{SessionDescription, StreamId, TrackId};

/// Notifications surfaced by the wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NegotiationNeeded,
    /// First track of a remote stream arrived
    TrackReceived(StreamId),
}

/// Wrapper around one peer-connection primitive
pub struct PeerConnection {
    label: String,
    primitive: Arc<dyn PeerConnectionPrimitive>,
    outstanding_offer: Mutex<Option<SessionDescription>>,
    attached: Mutex<HashSet<TrackId>>,
    remote_streams: Arc<Mutex<Vec<StreamId>>>,
    events: EventBus<PeerEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Wrap `primitive` and start forwarding its events
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(label: impl Into<String>, primitive: Arc<dyn PeerConnectionPrimitive>) -> Self {
        let label = label.into();
        let events = EventBus::new("peer");
        let remote_streams = Arc::new(Mutex::new(Vec::new()));

        let pump = primitive.take_events().map(|receiver| {
            tokio::spawn(pump_events(
                label.clone(),
                receiver,
                events.clone(),
                Arc::clone(&remote_streams),
            ))
        });
        if pump.is_none() {
            warn!(peer = %label, "Primitive events already taken, notifications disabled");
        }

        Self {
            label,
            primitive,
            outstanding_offer: Mutex::new(None),
            attached: Mutex::new(HashSet::new()),
            remote_streams,
            events,
            pump: Mutex::new(pump),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Create a local offer and arm the connection to expect an answer
    ///
    /// An earlier outstanding offer is replaced.
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.primitive.create_offer().await?;
        let replaced = self.outstanding_offer.lock().replace(offer.clone()).is_some();
        debug!(peer = %self.label, replaced, "Created local offer");
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer to it
    pub async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription, PeerError> {
        if !offer.is_offer() {
            return Err(PeerError::Malformed(format!(
                "expected an offer, got an {}",
                offer.sdp_type
            )));
        }
        let offer_outstanding = self.outstanding_offer.lock().is_some();
        if offer_outstanding {
            return Err(PeerError::InvalidState(
                "cannot answer while a local offer is outstanding".to_string(),
            ));
        }

        self.primitive.set_remote_description(offer).await?;
        match self.primitive.create_answer().await {
            Ok(answer) => {
                debug!(peer = %self.label, "Created answer");
                Ok(answer)
            }
            Err(err) => {
                self.rollback_quietly().await;
                Err(err)
            }
        }
    }

    /// Apply the remote answer to the outstanding local offer
    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        if !answer.is_answer() {
            return Err(PeerError::Malformed(format!(
                "expected an answer, got an {}",
                answer.sdp_type
            )));
        }
        let offer_outstanding = self.outstanding_offer.lock().is_some();
        if !offer_outstanding {
            return Err(PeerError::StaleDescription(
                "no local offer is outstanding".to_string(),
            ));
        }

        let result = self.primitive.set_remote_description(answer).await;
        self.outstanding_offer.lock().take();

        match result {
            Ok(()) => {
                debug!(peer = %self.label, "Applied remote answer");
                Ok(())
            }
            Err(err) => {
                self.rollback_quietly().await;
                Err(err)
            }
        }
    }

    /// Roll back the outstanding local offer, if any
    pub async fn discard_local_offer(&self) -> Result<(), PeerError> {
        let discarded = self.outstanding_offer.lock().take();
        if discarded.is_some() {
            self.primitive.rollback().await?;
            debug!(peer = %self.label, "Discarded local offer");
        }
        Ok(())
    }

    /// Abandon whatever half-finished exchange the primitive is in
    pub async fn reset_round(&self) {
        self.outstanding_offer.lock().take();
        self.rollback_quietly().await;
    }

    async fn rollback_quietly(&self) {
        if let Err(err) = self.primitive.rollback().await {
            warn!(peer = %self.label, error = %err, "Rollback failed");
        }
    }

    /// Attach a local track; returns false if it was already attached
    pub async fn add_track(&self, track: &MediaTrackHandle, stream: &StreamId) -> Result<bool, PeerError> {
        if !self.attached.lock().insert(track.id.clone()) {
            debug!(peer = %self.label, track_id = %track.id, "Track already attached");
            return Ok(false);
        }

        if let Err(err) = self.primitive.add_track(track.clone(), stream.clone()).await {
            self.attached.lock().remove(&track.id);
            return Err(err);
        }

        debug!(
            peer = %self.label,
            track_id = %track.id,
            kind = %track.kind,
            stream_id = %stream,
            "Attached local track"
        );
        Ok(true)
    }

    /// Attach every track of `stream`; returns how many were newly attached
    pub async fn attach_stream(&self, stream: &MediaStreamHandle) -> Result<usize, PeerError> {
        let mut added = 0;
        for track in &stream.tracks {
            if self.add_track(track, &stream.id).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn on_negotiation_needed(&self) -> Subscription<PeerEvent> {
        self.events
            .subscribe_filtered(|event| matches!(event, PeerEvent::NegotiationNeeded))
    }

    pub fn on_track_received(&self) -> Subscription<PeerEvent> {
        self.events
            .subscribe_filtered(|event| matches!(event, PeerEvent::TrackReceived(_)))
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription<PeerEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn has_outstanding_offer(&self) -> bool {
        self.outstanding_offer.lock().is_some()
    }

    #[must_use]
    pub fn attached_track_count(&self) -> usize {
        self.attached.lock().len()
    }

    #[must_use]
    pub fn remote_streams(&self) -> Vec<StreamId> {
        self.remote_streams.lock().clone()
    }

    /// Close the primitive and stop forwarding its events
    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.outstanding_offer.lock().take();
        if let Err(err) = self.primitive.close().await {
            warn!(peer = %self.label, error = %err, "Error closing peer connection");
        }
        debug!(peer = %self.label, "Peer connection closed");
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump_events(
    label: String,
    mut receiver: mpsc::UnboundedReceiver<PrimitiveEvent>,
    events: EventBus<PeerEvent>,
    remote_streams: Arc<Mutex<Vec<StreamId>>>,
) {
    while let Some(event) = receiver.recv().await {
        match event {
            PrimitiveEvent::NegotiationNeeded => {
                debug!(peer = %label, "Negotiation needed");
                events.publish(PeerEvent::NegotiationNeeded);
            }
            PrimitiveEvent::TrackReceived { stream, track } => {
                let first = {
                    let mut streams = remote_streams.lock();
                    if streams.contains(&stream) {
                        false
                    } else {
                        streams.push(stream.clone());
                        true
                    }
                };
                if first {
                    debug!(peer = %label, stream_id = %stream, track_id = %track.id, "Remote stream received");
                    events.publish(PeerEvent::TrackReceived(stream));
                } else {
                    debug!(peer = %label, stream_id = %stream, track_id = %track.id, "Additional track on known stream");
                }
            }
        }
    }
    debug!(peer = %label, "Primitive event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::peer::{MockPeerConnectionPrimitive, RemoteTrack};

    fn quiet_mock() -> MockPeerConnectionPrimitive {
        let mut mock = MockPeerConnectionPrimitive::new();
        mock.expect_take_events().return_once(|| None);
        mock
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\na=type:offer\r\n")
    }

    fn answer() -> SessionDescription {
        SessionDescription::answer("v=0\r\na=type:answer\r\n")
    }

    #[tokio::test]
    async fn test_answer_rejected_while_offer_outstanding() {
        let mut mock = quiet_mock();
        mock.expect_create_offer().times(1).returning(|| Ok(offer()));
        mock.expect_set_remote_description().never();

        let peer = PeerConnection::new("alice", Arc::new(mock));
        peer.create_offer().await.unwrap();

        let err = peer.create_answer(offer()).await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_second_offer_replaces_first() {
        let mut mock = quiet_mock();
        mock.expect_create_offer().times(2).returning(|| Ok(offer()));

        let peer = PeerConnection::new("alice", Arc::new(mock));
        peer.create_offer().await.unwrap();
        peer.create_offer().await.unwrap();
        assert!(peer.has_outstanding_offer());
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_stale() {
        let mut mock = quiet_mock();
        mock.expect_set_remote_description().never();

        let peer = PeerConnection::new("alice", Arc::new(mock));
        let err = peer.apply_answer(answer()).await.unwrap_err();
        assert!(matches!(err, PeerError::StaleDescription(_)));
    }

    #[tokio::test]
    async fn test_failed_answer_rolls_back() {
        let mut mock = quiet_mock();
        mock.expect_create_offer().returning(|| Ok(offer()));
        mock.expect_set_remote_description()
            .times(1)
            .returning(|_| Err(PeerError::Malformed("bad fingerprint".to_string())));
        mock.expect_rollback().times(1).returning(|| Ok(()));

        let peer = PeerConnection::new("alice", Arc::new(mock));
        peer.create_offer().await.unwrap();

        assert!(peer.apply_answer(answer()).await.is_err());
        assert!(!peer.has_outstanding_offer());
    }

    #[tokio::test]
    async fn test_answer_applies_remote_offer_first() {
        let mut mock = quiet_mock();
        let mut seq = mockall::Sequence::new();
        mock.expect_set_remote_description()
            .withf(SessionDescription::is_offer)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_create_answer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(answer()));

        let peer = PeerConnection::new("bob", Arc::new(mock));
        let ans = peer.create_answer(offer()).await.unwrap();
        assert!(ans.is_answer());
    }

    #[tokio::test]
    async fn test_discard_without_offer_is_noop() {
        let mut mock = quiet_mock();
        mock.expect_rollback().never();

        let peer = PeerConnection::new("alice", Arc::new(mock));
        peer.discard_local_offer().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_track_is_noop() {
        let mut mock = quiet_mock();
        mock.expect_add_track().times(1).returning(|_, _| Ok(()));

        let peer = PeerConnection::new("alice", Arc::new(mock));
        let track = MediaTrackHandle::new(TrackKind::Audio, "mic");
        let stream = StreamId::from("local");

        assert!(peer.add_track(&track, &stream).await.unwrap());
        assert!(!peer.add_track(&track, &stream).await.unwrap());
        assert_eq!(peer.attached_track_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_track_can_be_retried() {
        let mut mock = quiet_mock();
        let mut calls = 0;
        mock.expect_add_track().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(PeerError::Engine("codec missing".to_string()))
            } else {
                Ok(())
            }
        });

        let peer = PeerConnection::new("alice", Arc::new(mock));
        let track = MediaTrackHandle::new(TrackKind::Video, "cam");
        let stream = StreamId::from("local");

        assert!(peer.add_track(&track, &stream).await.is_err());
        assert!(peer.add_track(&track, &stream).await.unwrap());
    }

    #[tokio::test]
    async fn test_track_received_once_per_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut mock = MockPeerConnectionPrimitive::new();
        mock.expect_take_events().return_once(move || Some(rx));

        let remote = |stream: &str, track: &str, kind| PrimitiveEvent::TrackReceived {
            stream: StreamId::from(stream),
            track: RemoteTrack {
                id: TrackId::from(track),
                kind,
            },
        };
        tx.send(remote("s1", "a1", TrackKind::Audio)).unwrap();
        tx.send(remote("s1", "v1", TrackKind::Video)).unwrap();
        tx.send(remote("s2", "v2", TrackKind::Video)).unwrap();
        tx.send(PrimitiveEvent::NegotiationNeeded).unwrap();

        let peer = PeerConnection::new("bob", Arc::new(mock));
        let mut events = peer.subscribe();

        assert_eq!(events.recv().await, Some(PeerEvent::TrackReceived(StreamId::from("s1"))));
        assert_eq!(events.recv().await, Some(PeerEvent::TrackReceived(StreamId::from("s2"))));
        assert_eq!(events.recv().await, Some(PeerEvent::NegotiationNeeded));
        assert_eq!(peer.remote_streams().len(), 2);
    }

    #[tokio::test]
    async fn test_callbacks_follow_a_renegotiation() {
        use crate::peer::memory::MemoryPeerConnection;

        let alice = PeerConnection::new("alice", Arc::new(MemoryPeerConnection::new("alice")));
        let bob = PeerConnection::new("bob", Arc::new(MemoryPeerConnection::new("bob")));

        let offer = alice.create_offer().await.unwrap();
        let ans = bob.create_answer(offer).await.unwrap();
        alice.apply_answer(ans).await.unwrap();

        let mut needed = alice.on_negotiation_needed();
        let mut tracks = bob.on_track_received();
        let mut alice_tracks = alice.on_track_received();

        let stream = StreamId::from("local");
        alice
            .add_track(&MediaTrackHandle::new(TrackKind::Video, "cam"), &stream)
            .await
            .unwrap();
        assert_eq!(needed.recv().await, Some(PeerEvent::NegotiationNeeded));

        let offer = alice.create_offer().await.unwrap();
        let ans = bob.create_answer(offer).await.unwrap();
        alice.apply_answer(ans).await.unwrap();

        assert_eq!(tracks.recv().await, Some(PeerEvent::TrackReceived(stream.clone())));
        assert_eq!(bob.remote_streams(), vec![stream]);
        // The negotiation trigger is filtered out of the track subscription
        assert_eq!(alice_tracks.try_recv(), None);
    }
}
