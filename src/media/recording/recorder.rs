use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::rtp::packet::Packet;

use super::state::RecordingState;
use crate::error::{ClassroomError, Result};
use crate::media::devices::MediaKind;
use crate::model::{ParticipantId, RoomId, Timestamp};

/// Key for one recorded stream: (participant_id, kind)
type SinkKey = (ParticipantId, MediaKind);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes the room's media to per-participant files: VP8 into IVF, Opus
/// into Ogg.
pub struct Recorder {
    room_id: RoomId,
    room_dir: PathBuf,
    started_at: Timestamp,
    state: Mutex<RecordingState>,
    sinks: Mutex<HashMap<SinkKey, Box<dyn Writer + Send>>>,
    files: Mutex<Vec<PathBuf>>,
}

impl Recorder {
    /// Fails with `RecordingUnsupported` when the output directory cannot be
    /// created.
    pub fn start(output_dir: &Path, room_id: &str, started_at: Timestamp) -> Result<Self> {
        let room_dir = output_dir.join(sanitize(room_id));
        std::fs::create_dir_all(&room_dir).map_err(|e| {
            ClassroomError::RecordingUnsupported(format!(
                "cannot create {}: {}",
                room_dir.display(),
                e
            ))
        })?;

        tracing::info!(room_id = %room_id, dir = %room_dir.display(), "Recording started");
        Ok(Self {
            room_id: room_id.to_string(),
            room_dir,
            started_at,
            state: Mutex::new(RecordingState::Recording),
            sinks: Mutex::new(HashMap::new()),
            files: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> RecordingState {
        lock(&self.state).clone()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        lock(&self.files).clone()
    }

    /// Opens the output file for one stream. Opening twice is a no-op.
    pub fn open(&self, participant_id: &str, kind: MediaKind) -> Result<()> {
        if !self.state().is_active() {
            return Err(ClassroomError::Recording(format!(
                "recorder for room {} is not active",
                self.room_id
            )));
        }
        let key = (participant_id.to_string(), kind);
        let mut sinks = lock(&self.sinks);
        if sinks.contains_key(&key) {
            return Ok(());
        }

        let extension = match kind {
            MediaKind::Video => "ivf",
            MediaKind::Audio => "ogg",
        };
        let path = self.room_dir.join(format!(
            "{}_{}_{}.{}",
            sanitize(participant_id),
            kind,
            self.started_at,
            extension
        ));
        let file = File::create(&path)?;
        let writer: Box<dyn Writer + Send> = match kind {
            MediaKind::Video => Box::new(IVFWriter::new(file, &vp8_header()).map_err(recording_error)?),
            MediaKind::Audio => Box::new(OggWriter::new(file, 48000, 2).map_err(recording_error)?),
        };

        tracing::debug!(
            room_id = %self.room_id,
            participant_id = %participant_id,
            kind = %kind,
            file = %path.display(),
            "Opened recording sink"
        );
        sinks.insert(key, writer);
        lock(&self.files).push(path);
        Ok(())
    }

    /// Appends one RTP packet. A sink that fails is dropped; the rest keep going.
    pub fn write(&self, participant_id: &str, kind: MediaKind, packet: &Packet) {
        let key = (participant_id.to_string(), kind);
        let mut sinks = lock(&self.sinks);
        let Some(writer) = sinks.get_mut(&key) else {
            return;
        };
        if let Err(e) = writer.write_rtp(packet) {
            tracing::warn!(
                room_id = %self.room_id,
                participant_id = %participant_id,
                kind = %kind,
                error = %e,
                "Recording sink failed, dropping it"
            );
            sinks.remove(&key);
        }
    }

    /// Closes every sink and returns the files written.
    pub fn stop(&self) -> Result<Vec<PathBuf>> {
        {
            let mut state = lock(&self.state);
            if !state.is_active() {
                return Ok(self.files());
            }
            *state = RecordingState::Stopping;
        }

        let mut failure = None;
        for ((participant_id, kind), mut writer) in lock(&self.sinks).drain() {
            if let Err(e) = writer.close() {
                tracing::error!(
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    kind = %kind,
                    error = %e,
                    "Failed to finalize recording file"
                );
                failure = Some(e.to_string());
            }
        }

        let files = self.files();
        match failure {
            Some(reason) => {
                *lock(&self.state) = RecordingState::Error(reason.clone());
                Err(ClassroomError::Recording(reason))
            }
            None => {
                *lock(&self.state) = RecordingState::Stopped;
                tracing::info!(room_id = %self.room_id, files = files.len(), "Recording stopped");
                Ok(files)
            }
        }
    }
}

fn vp8_header() -> IVFFileHeader {
    IVFFileHeader {
        signature: *b"DKIF",
        version: 0,
        header_size: 32,
        four_cc: *b"VP80",
        width: 640,
        height: 480,
        timebase_denominator: 30,
        timebase_numerator: 1,
        num_frames: 900,
        unused: 0,
    }
}

fn recording_error(err: impl std::fmt::Display) -> ClassroomError {
    ClassroomError::Recording(err.to_string())
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Recording hook on one media stream, local or remote.
pub struct TrackTap {
    participant_id: ParticipantId,
    kind: MediaKind,
    recorder: Mutex<Option<Arc<Recorder>>>,
}

impl TrackTap {
    pub fn new(participant_id: impl Into<ParticipantId>, kind: MediaKind) -> Self {
        Self {
            participant_id: participant_id.into(),
            kind,
            recorder: Mutex::new(None),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn attach(&self, recorder: Arc<Recorder>) -> Result<()> {
        recorder.open(&self.participant_id, self.kind)?;
        *lock(&self.recorder) = Some(recorder);
        Ok(())
    }

    pub fn detach(&self) {
        lock(&self.recorder).take();
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.recorder).is_some()
    }

    pub fn forward(&self, packet: &Packet) {
        let recorder = lock(&self.recorder).clone();
        if let Some(recorder) = recorder {
            recorder.write(&self.participant_id, self.kind, packet);
        }
    }
}
