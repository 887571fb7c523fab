//! Local media: tracks shared by every outbound link, and the acquisition
//! capability that produces them.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaAccessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// One local track. Clones share the same underlying track and flags, so
/// flipping `enabled` is seen by every link the track is attached to.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds a sample track with the default codec for `kind`.
    pub fn with_default_codec(kind: TrackKind, stream_id: &str) -> Self {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            kind.as_str().to_owned(),
            stream_id.to_owned(),
        ));
        Self::new(kind, track)
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Pushes one encoded frame. Frames written while the track is disabled
    /// or stopped are dropped; returns whether the frame went out.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        match self.track.write_sample(&sample).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(kind = self.kind.as_str(), error = %e, "write_sample failed");
                false
            }
        }
    }

    /// True when both handles point at the same underlying track.
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.track(kind).map(LocalTrack::is_enabled).unwrap_or(false)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaRequest {
    pub video: bool,
    pub audio: bool,
}

/// Snapshot of the local camera/mic controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMediaState {
    pub camera_enabled: bool,
    pub mic_enabled: bool,
    pub has_stream: bool,
}

/// Capability that opens local capture devices.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, request: MediaRequest) -> Result<LocalStream, MediaAccessError>;
}

/// Allocates VP8/Opus sample tracks. Frames are fed by whatever owns the
/// capture devices through [`LocalTrack::write_frame`].
#[derive(Debug, Default, Clone)]
pub struct StaticMediaSource;

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, request: MediaRequest) -> Result<LocalStream, MediaAccessError> {
        if !request.video && !request.audio {
            return Err(MediaAccessError::DeviceUnavailable(
                "nothing requested".to_string(),
            ));
        }
        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if request.video {
            tracks.push(LocalTrack::with_default_codec(TrackKind::Video, &stream_id));
        }
        if request.audio {
            tracks.push(LocalTrack::with_default_codec(TrackKind::Audio, &stream_id));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }
}

/// Owner of the local stream. The epoch changes on every teardown so that an
/// acquisition finishing afterwards can be recognised and discarded.
#[derive(Debug, Default)]
pub struct LocalMedia {
    stream: Option<LocalStream>,
    epoch: u64,
    acquiring: Option<MediaRequest>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring.is_some()
    }

    pub fn state(&self) -> LocalMediaState {
        match &self.stream {
            Some(stream) => LocalMediaState {
                camera_enabled: stream.is_enabled(TrackKind::Video),
                mic_enabled: stream.is_enabled(TrackKind::Audio),
                has_stream: true,
            },
            None => LocalMediaState::default(),
        }
    }

    /// Marks an acquisition as started. Returns the epoch to hand back to
    /// [`LocalMedia::complete_acquire`], or `None` if one is already running
    /// or a stream already exists.
    pub fn begin_acquire(&mut self, request: MediaRequest) -> Option<u64> {
        if self.acquiring.is_some() || self.stream.is_some() {
            return None;
        }
        self.acquiring = Some(request);
        Some(self.epoch)
    }

    /// Installs an acquired stream if `epoch` is still current; otherwise the
    /// stream is stopped and `None` is returned.
    pub fn complete_acquire(&mut self, epoch: u64, stream: LocalStream) -> Option<&LocalStream> {
        if epoch != self.epoch || self.acquiring.is_none() {
            tracing::debug!(epoch, current = self.epoch, "discarding stale media acquisition");
            stream.stop();
            return None;
        }
        self.acquiring = None;
        self.stream = Some(stream);
        self.stream.as_ref()
    }

    /// Clears the in-progress marker after a failed acquisition.
    pub fn fail_acquire(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.acquiring = None;
        true
    }

    /// Stops the stream and invalidates any acquisition in flight.
    pub fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
        self.acquiring = None;
        self.epoch += 1;
    }
}
