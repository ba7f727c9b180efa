use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use super::recording::TrackTap;
use crate::error::{ClassroomError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// What the local client can contribute to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    Full,
    AudioOnly,
    VideoOnly,
    /// Receives only.
    Spectator,
}

/// One captured track. Disabled tracks drop their samples.
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticRTP>,
    enabled: AtomicBool,
    tap: Arc<TrackTap>,
}

impl LocalTrack {
    pub fn new(participant_id: &str, kind: MediaKind) -> Self {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track = TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            kind.to_string(),
            format!("{participant_id}-capture"),
        );
        Self {
            kind,
            track: Arc::new(track),
            enabled: AtomicBool::new(true),
            tap: Arc::new(TrackTap::new(participant_id, kind)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    pub fn tap(&self) -> Arc<TrackTap> {
        self.tap.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Feeds one captured packet to every peer and, if attached, the recorder.
    pub async fn write_rtp(&self, packet: &Packet) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.tap.forward(packet);
        self.track.write_rtp(packet).await?;
        Ok(())
    }
}

/// Local capture acquired by [`CaptureDevices::acquire`].
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn mode(&self) -> MediaMode {
        match (&self.audio, &self.video) {
            (Some(_), Some(_)) => MediaMode::Full,
            (Some(_), None) => MediaMode::AudioOnly,
            (None, Some(_)) => MediaMode::VideoOnly,
            (None, None) => MediaMode::Spectator,
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter())
    }
}

#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Fails with `DeviceUnavailable` only when nothing at all can be captured.
    async fn acquire(&self, participant_id: &str) -> Result<LocalMedia>;
}

/// Devices whose availability is fixed up front.
#[derive(Debug, Clone, Copy)]
pub struct StaticDevices {
    pub microphone: bool,
    pub camera: bool,
}

impl StaticDevices {
    pub fn all() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }

    pub fn none() -> Self {
        Self {
            microphone: false,
            camera: false,
        }
    }
}

#[async_trait]
impl CaptureDevices for StaticDevices {
    async fn acquire(&self, participant_id: &str) -> Result<LocalMedia> {
        if !self.microphone && !self.camera {
            return Err(ClassroomError::DeviceUnavailable(
                "no camera or microphone available".to_string(),
            ));
        }
        Ok(LocalMedia {
            audio: self
                .microphone
                .then(|| Arc::new(LocalTrack::new(participant_id, MediaKind::Audio))),
            video: self
                .camera
                .then(|| Arc::new(LocalTrack::new(participant_id, MediaKind::Video))),
        })
    }
}
