//! `webrtc` crate engine
//!
//! Descriptions are only handed out once ICE gathering has finished, so the
//! SDP carries every candidate and no trickle events need to be signaled.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{PeerConnectionFactory, PeerConnectionPrimitive, PeerError, PrimitiveEvent, RemoteTrack};
use crate::config::WebRtcConfig;
use crate::media::{MediaTrackHandle, TrackKind};
use crate::models::{SdpType, SessionDescription, StreamId, TrackId};

fn engine_error(err: webrtc::Error) -> PeerError {
    PeerError::Engine(err.to_string())
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(|err| PeerError::Malformed(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError::Engine(format!("unexpected local description type {other}"))),
    }
}

fn rollback_of(pending: Option<RTCSessionDescription>) -> Result<RTCSessionDescription, PeerError> {
    let pending = pending.ok_or_else(|| PeerError::InvalidState("no pending description to roll back".to_string()))?;
    let mut rollback = RTCSessionDescription::default();
    rollback.sdp_type = RTCSdpType::Rollback;
    rollback.sdp = pending.sdp;
    Ok(rollback)
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

/// `PeerConnectionPrimitive` backed by `webrtc::RTCPeerConnection`
pub struct WebRtcPeerConnection {
    label: String,
    peer: Arc<RTCPeerConnection>,
    gather_timeout: std::time::Duration,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PrimitiveEvent>>>,
}

impl WebRtcPeerConnection {
    pub async fn new(label: impl Into<String>, config: &WebRtcConfig) -> Result<Self, PeerError> {
        let label = label.into();

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: if config.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        let peer = Arc::new(api.new_peer_connection(rtc_config).await.map_err(engine_error)?);
        let (sender, receiver) = mpsc::unbounded_channel();

        let negotiation_sender = sender.clone();
        peer.on_negotiation_needed(Box::new(move || {
            let _ = negotiation_sender.send(PrimitiveEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let track_label = label.clone();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = RemoteTrack {
                id: TrackId::new(track.id()),
                kind: TrackKind::from(track.kind()),
            };
            debug!(
                peer = %track_label,
                track_id = %remote.id,
                kind = %remote.kind,
                "Remote track arrived"
            );
            let _ = sender.send(PrimitiveEvent::TrackReceived {
                stream: StreamId::new(track.stream_id()),
                track: remote,
            });
            Box::pin(async {})
        }));

        debug!(peer = %label, ice_servers = config.ice_servers.len(), "Created webrtc peer connection");

        Ok(Self {
            label,
            peer,
            gather_timeout: config.gather_timeout(),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Install `description` locally and return it with gathered candidates
    async fn install_local(&self, description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
        let mut gathering = self.peer.gathering_complete_promise().await;
        self.peer
            .set_local_description(description)
            .await
            .map_err(engine_error)?;

        if tokio::time::timeout(self.gather_timeout, gathering.recv()).await.is_err() {
            warn!(
                peer = %self.label,
                timeout_ms = self.gather_timeout.as_millis() as u64,
                "ICE gathering did not finish in time, sending partial candidates"
            );
        }

        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| PeerError::Engine("local description missing after install".to_string()))?;
        from_rtc(local)
    }
}

#[async_trait]
impl PeerConnectionPrimitive for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.peer.create_offer(None).await.map_err(engine_error)?;
        self.install_local(offer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = to_rtc(description)?;
        self.peer
            .set_remote_description(description)
            .await
            .map_err(engine_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.peer.create_answer(None).await.map_err(engine_error)?;
        self.install_local(answer).await
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        // The engine parses the rollback description, so it carries the SDP being undone
        match self.peer.signaling_state() {
            RTCSignalingState::HaveLocalOffer => {
                let pending = self.peer.local_description().await;
                self.peer
                    .set_local_description(rollback_of(pending)?)
                    .await
                    .map_err(engine_error)
            }
            RTCSignalingState::HaveRemoteOffer => {
                let pending = self.peer.remote_description().await;
                self.peer
                    .set_remote_description(rollback_of(pending)?)
                    .await
                    .map_err(engine_error)
            }
            RTCSignalingState::Closed => Err(PeerError::Closed),
            _ => Ok(()),
        }
    }

    async fn add_track(&self, track: MediaTrackHandle, stream: StreamId) -> Result<(), PeerError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.to_string(),
            stream.to_string(),
        ));

        let sender = self
            .peer
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;

        // RTCP must be drained for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrimitiveEvent>> {
        self.receiver.lock().take()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.peer.close().await.map_err(engine_error)
    }
}

/// Creates `WebRtcPeerConnection`s from shared settings
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerConnectionFactory {
    config: WebRtcConfig,
}

impl WebRtcPeerConnectionFactory {
    #[must_use]
    pub const fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create(&self, label: &str) -> Result<Arc<dyn PeerConnectionPrimitive>, PeerError> {
        Ok(Arc::new(WebRtcPeerConnection::new(label, &self.config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn peer_with_audio(label: &str) -> WebRtcPeerConnection {
        let peer = WebRtcPeerConnection::new(label, &WebRtcConfig::default()).await.unwrap();
        peer.add_track(MediaTrackHandle::new(TrackKind::Audio, "mic"), StreamId::from(label))
            .await
            .unwrap();
        peer
    }

    #[tokio::test]
    async fn test_description_conversion() {
        let peer = peer_with_audio("alice").await;
        let offer = peer.create_offer().await.unwrap();

        let rtc = to_rtc(offer.clone()).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Offer);

        let back = from_rtc(rtc).unwrap();
        assert!(back.is_offer());
        assert_eq!(back.sdp, offer.sdp);

        assert!(matches!(
            to_rtc(SessionDescription::answer("not sdp")),
            Err(PeerError::Malformed(_))
        ));
        peer.close().await.unwrap();
    }

    #[test]
    fn test_rollback_is_not_a_local_description() {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        assert!(from_rtc(rollback).is_err());
    }

    #[test]
    fn test_rollback_needs_pending_description() {
        assert!(matches!(rollback_of(None), Err(PeerError::InvalidState(_))));
    }

    #[test]
    fn test_codecs() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Video).clock_rate, 90_000);
    }

    #[tokio::test]
    async fn test_offer_carries_added_track() {
        let peer = peer_with_audio("alice").await;

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.is_offer());
        assert!(offer.sdp.contains("m=audio"));

        peer.rollback().await.unwrap();
        assert_eq!(peer.peer.signaling_state(), RTCSignalingState::Stable);
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_glare_loser_rolls_back_and_answers() {
        let alice = peer_with_audio("alice").await;
        let bob = peer_with_audio("bob").await;

        // Both offer at once; bob yields to alice
        let alice_offer = alice.create_offer().await.unwrap();
        bob.create_offer().await.unwrap();

        bob.rollback().await.unwrap();
        bob.set_remote_description(alice_offer).await.unwrap();
        let answer = bob.create_answer().await.unwrap();
        assert!(answer.is_answer());

        alice.set_remote_description(answer).await.unwrap();
        assert_eq!(alice.peer.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(bob.peer.signaling_state(), RTCSignalingState::Stable);

        alice.close().await.unwrap();
        bob.close().await.unwrap();
    }
}
