//! Local media capture
//!
//! Capture devices are outside this crate; the session only needs a source
//! that turns constraints into a stream of track handles which can be attached
//! to a peer connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::MediaConfig;
use crate::models::{generate_id, StreamId, TrackId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to capture media was denied")]
    Denied,

    #[error("Media device unavailable: {0}")]
    Unavailable(String),

    #[error("Constraints request neither audio nor video")]
    NoTracksRequested,
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl From<&str> for TrackKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "audio" => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<webrtc::rtp_transceiver::rtp_codec::RTPCodecType> for TrackKind {
    fn from(codec_type: webrtc::rtp_transceiver::rtp_codec::RTPCodecType) -> Self {
        match codec_type {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local media track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrackHandle {
    pub id: TrackId,
    pub kind: TrackKind,
    pub label: String,
}

impl MediaTrackHandle {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(format!("{}-{}", kind.as_str(), generate_id())),
            kind,
            label: label.into(),
        }
    }
}

/// Local media stream: a set of tracks sharing one stream id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStreamHandle {
    pub id: StreamId,
    pub tracks: Vec<MediaTrackHandle>,
}

impl MediaStreamHandle {
    #[must_use]
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            audio: config.audio,
            video: config.video,
        }
    }
}

/// Source of local media streams
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<MediaStreamHandle>, MediaError>;
}

/// Media source producing track handles without touching any device
///
/// Used by the demo binary and tests; can be built in a failing mode to
/// exercise capture errors.
#[derive(Debug)]
pub struct SyntheticMediaSource {
    label: String,
    failure: Option<MediaError>,
    acquisitions: AtomicUsize,
}

impl SyntheticMediaSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            failure: None,
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Source whose every acquisition fails with `error`
    pub fn failing(label: impl Into<String>, error: MediaError) -> Self {
        Self {
            label: label.into(),
            failure: Some(error),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Extra video track, e.g. a shared screen added mid-call
    #[must_use]
    pub fn screen_share(&self) -> MediaTrackHandle {
        MediaTrackHandle::new(TrackKind::Video, format!("{} screen", self.label))
    }

    /// Number of successful acquisitions so far
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<MediaStreamHandle>, MediaError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::NoTracksRequested);
        }

        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(MediaTrackHandle::new(TrackKind::Audio, format!("{} microphone", self.label)));
        }
        if constraints.video {
            tracks.push(MediaTrackHandle::new(TrackKind::Video, format!("{} camera", self.label)));
        }

        let stream = MediaStreamHandle {
            id: StreamId::generate(),
            tracks,
        };
        self.acquisitions.fetch_add(1, Ordering::Relaxed);

        debug!(
            source = %self.label,
            stream_id = %stream.id,
            track_count = stream.tracks.len(),
            "Acquired synthetic media stream"
        );

        Ok(Arc::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_follows_constraints() {
        let source = SyntheticMediaSource::new("alice");
        let stream = source
            .acquire(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();

        assert_eq!(stream.tracks.len(), 1);
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(!stream.has_kind(TrackKind::Video));
        assert_eq!(source.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_acquire_without_tracks_fails() {
        let source = SyntheticMediaSource::new("alice");
        let err = source
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await
            .unwrap_err();

        assert_eq!(err, MediaError::NoTracksRequested);
    }

    #[tokio::test]
    async fn test_failing_source() {
        let source = SyntheticMediaSource::failing("bob", MediaError::Denied);
        assert_eq!(source.acquire(MediaConstraints::default()).await.unwrap_err(), MediaError::Denied);
        assert_eq!(source.acquisitions(), 0);
    }

    #[test]
    fn test_track_ids_unique() {
        let source = SyntheticMediaSource::new("alice");
        assert_ne!(source.screen_share().id, source.screen_share().id);
        assert_eq!(TrackKind::from("AUDIO"), TrackKind::Audio);
    }
}
