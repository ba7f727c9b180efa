//! Media Service.
//!
//! Owns the local capture, the mesh of peer links and the local presence
//! record. Nothing in here touches the session channel directly: every
//! operation returns the signals and presence updates the caller has to
//! publish, so the same service runs over any transport.

pub mod devices;
pub mod peer;
pub mod quality;
pub mod recording;
pub mod webrtc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

pub use devices::{CaptureDevices, LocalMedia, LocalTrack, MediaKind, MediaMode, StaticDevices};
pub use peer::{LinkEvent, PeerConnector, PeerEvent, PeerEventSender, PeerLink, PeerState, PeerStats};
pub use quality::{aggregate, estimate_quality};
pub use recording::{Recorder, RecordingState, TrackTap};
pub use self::webrtc::WebRtcConnector;

use crate::channel::{IceCandidate, PresenceUpdate, SignalMessage, SignalPayload};
use crate::config::RecordingConfig;
use crate::error::{ClassroomError, Result};
use crate::model::{ConnectionQuality, Participant, ParticipantId, PresencePatch, Role, RoomId, Timestamp};
use crate::presence::{Roster, RosterChange};

/// Result of a local toggle: the new flag value and the presence delta to
/// publish, if anything changed.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub value: bool,
    pub update: Option<PresenceUpdate>,
}

struct PeerEntry {
    link_id: u64,
    link: Arc<dyn PeerLink>,
    state: PeerState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    quality: ConnectionQuality,
}

impl PeerEntry {
    fn new(link_id: u64, link: Arc<dyn PeerLink>) -> Self {
        Self {
            link_id,
            link,
            state: PeerState::New,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            quality: ConnectionQuality::Good,
        }
    }
}

pub struct MediaService {
    room_id: RoomId,
    role: Role,
    connector: Arc<dyn PeerConnector>,
    devices: Arc<dyn CaptureDevices>,
    local: LocalMedia,
    mode: MediaMode,
    roster: Roster,
    peers: HashMap<ParticipantId, PeerEntry>,
    joined: bool,
    /// Negotiation received before `join_room`, answered on join.
    deferred: HashMap<ParticipantId, Vec<SignalPayload>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    next_link_id: u64,
    recording: RecordingConfig,
    recorder: Option<Arc<Recorder>>,
    remote_taps: Vec<Arc<TrackTap>>,
}

impl MediaService {
    pub fn new(
        room_id: impl Into<RoomId>,
        local: Participant,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn CaptureDevices>,
        recording: RecordingConfig,
        presence_grace: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let role = local.role;
        let service = Self {
            room_id: room_id.into(),
            role,
            connector,
            devices,
            local: LocalMedia::default(),
            mode: MediaMode::Spectator,
            roster: Roster::new(local, presence_grace),
            peers: HashMap::new(),
            joined: false,
            deferred: HashMap::new(),
            events_tx,
            next_link_id: 1,
            recording,
            recorder: None,
            remote_taps: Vec::new(),
        };
        (service, events_rx)
    }

    fn local_id(&self) -> &str {
        &self.roster.local().participant_id
    }

    pub fn mode(&self) -> MediaMode {
        self.mode
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.local
    }

    /// Acquires capture devices. On failure the service stays usable in
    /// spectator mode and the error is returned for the caller to report.
    pub async fn initialize(&mut self, now: Timestamp) -> Result<MediaMode> {
        let acquired = self.devices.acquire(self.local_id()).await;
        let result = match acquired {
            Ok(local) => {
                self.local = local;
                Ok(self.local.mode())
            }
            Err(e) => {
                tracing::warn!(
                    room_id = %self.room_id,
                    participant_id = %self.local_id(),
                    error = %e,
                    "Capture unavailable, continuing as spectator"
                );
                self.local = LocalMedia::default();
                Err(e)
            }
        };
        self.mode = self.local.mode();

        // Local record mirrors what can actually be sent
        let patch = PresencePatch {
            is_muted: Some(self.local.audio.is_none()),
            is_camera_off: Some(self.local.video.is_none()),
            ..Default::default()
        };
        self.roster.apply_local(patch, now);

        tracing::info!(
            room_id = %self.room_id,
            participant_id = %self.local_id(),
            mode = ?self.mode,
            "Media initialized"
        );
        result
    }

    /// Connects to every known participant. The smaller id of each pair
    /// sends the offer. Calling this while joined is a no-op.
    pub async fn join_room(&mut self) -> Result<Vec<SignalMessage>> {
        if self.joined {
            return Ok(Vec::new());
        }
        self.joined = true;
        tracing::info!(
            room_id = %self.room_id,
            participant_id = %self.local_id(),
            peers = self.roster.remote_ids().len(),
            "Joining media mesh"
        );

        let mut outbound = Vec::new();
        for peer_id in self.roster.remote_ids() {
            match self.offer_if_initiator(&peer_id).await {
                Ok(Some(signal)) => outbound.push(signal),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to start peer negotiation");
                }
            }
        }

        let deferred: Vec<(ParticipantId, Vec<SignalPayload>)> = self.deferred.drain().collect();
        for (from, payloads) in deferred {
            for payload in payloads {
                match self.handle_signal(&from, payload).await {
                    Ok(mut signals) => outbound.append(&mut signals),
                    Err(e) => {
                        tracing::warn!(peer_id = %from, error = %e, "Failed to apply deferred signal");
                    }
                }
            }
        }
        Ok(outbound)
    }

    /// Closes every peer link. Idempotent.
    pub async fn leave_room(&mut self) {
        if !self.joined && self.peers.is_empty() {
            return;
        }
        self.joined = false;
        self.deferred.clear();
        for (peer_id, entry) in self.peers.drain() {
            tracing::debug!(peer_id = %peer_id, "Closing peer link");
            entry.link.close().await;
        }
        for tap in self.remote_taps.drain(..) {
            tap.detach();
        }
        tracing::info!(room_id = %self.room_id, participant_id = %self.roster.local().participant_id, "Left media mesh");
    }

    pub async fn on_participant_joined(&mut self, peer_id: &str) -> Result<Option<SignalMessage>> {
        if !self.joined || self.peers.contains_key(peer_id) {
            return Ok(None);
        }
        self.offer_if_initiator(peer_id).await
    }

    pub async fn on_participant_left(&mut self, peer_id: &str) {
        self.deferred.remove(peer_id);
        self.drop_remote_taps(peer_id);
        if let Some(entry) = self.peers.remove(peer_id) {
            tracing::info!(room_id = %self.room_id, peer_id = %peer_id, "Closing link to departed participant");
            entry.link.close().await;
        }
    }

    /// A participant came back as a new process under the same id. The
    /// initiator replaces the dead link with a fresh offer; otherwise the
    /// rejoined side offers and that offer replaces the link.
    pub async fn on_participant_rejoined(&mut self, peer_id: &str) -> Result<Option<SignalMessage>> {
        if self.local_id() >= peer_id {
            return Ok(None);
        }
        tracing::info!(room_id = %self.room_id, peer_id = %peer_id, "Participant rejoined, renegotiating");
        self.on_participant_left(peer_id).await;
        self.on_participant_joined(peer_id).await
    }

    fn drop_remote_taps(&mut self, peer_id: &str) {
        self.remote_taps.retain(|tap| {
            let departed = tap.participant_id() == peer_id;
            if departed {
                tap.detach();
            }
            !departed
        });
    }

    async fn offer_if_initiator(&mut self, peer_id: &str) -> Result<Option<SignalMessage>> {
        if self.local_id() >= peer_id || self.peers.contains_key(peer_id) {
            return Ok(None);
        }
        let (link_id, link) = self.connect(peer_id).await?;
        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                link.close().await;
                return Err(ClassroomError::peer_failed(peer_id, e));
            }
        };
        self.peers.insert(peer_id.to_string(), PeerEntry::new(link_id, link));
        Ok(Some(SignalMessage {
            to: peer_id.to_string(),
            payload: SignalPayload::Offer { sdp },
        }))
    }

    async fn connect(&mut self, peer_id: &str) -> Result<(u64, Arc<dyn PeerLink>)> {
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        let events = PeerEventSender::new(link_id, self.events_tx.clone());
        let link = self
            .connector
            .connect(peer_id, &self.local, events)
            .await
            .map_err(|e| ClassroomError::peer_failed(peer_id, e))?;
        Ok((link_id, link))
    }

    /// Id of the current link to `peer_id`.
    pub fn link_id(&self, peer_id: &str) -> Option<u64> {
        self.peers.get(peer_id).map(|entry| entry.link_id)
    }

    /// Applies negotiation addressed to us by `from`.
    pub async fn handle_signal(&mut self, from: &str, payload: SignalPayload) -> Result<Vec<SignalMessage>> {
        if from == self.local_id() {
            return Ok(Vec::new());
        }
        if !self.joined {
            let queue = self.deferred.entry(from.to_string()).or_default();
            if matches!(payload, SignalPayload::Offer { .. }) {
                // A newer offer supersedes whatever was negotiated before it
                queue.clear();
            }
            queue.push(payload);
            return Ok(Vec::new());
        }

        match payload {
            SignalPayload::Offer { sdp } => {
                if let Some(old) = self.peers.remove(from) {
                    tracing::info!(peer_id = %from, "Renegotiating peer link");
                    old.link.close().await;
                }
                let (link_id, link) = self.connect(from).await?;
                let answer = match link.accept_offer(&sdp).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        link.close().await;
                        return Err(ClassroomError::peer_failed(from, e));
                    }
                };
                let mut entry = PeerEntry::new(link_id, link);
                entry.remote_description_set = true;
                if let Some(early) = self.deferred.remove(from) {
                    entry.pending_candidates.extend(early.into_iter().filter_map(|p| match p {
                        SignalPayload::Candidate { candidate } => Some(candidate),
                        _ => None,
                    }));
                }
                Self::flush_candidates(from, &mut entry).await;
                self.peers.insert(from.to_string(), entry);
                Ok(vec![SignalMessage {
                    to: from.to_string(),
                    payload: SignalPayload::Answer { sdp: answer },
                }])
            }
            SignalPayload::Answer { sdp } => {
                let entry = self
                    .peers
                    .get_mut(from)
                    .ok_or_else(|| ClassroomError::PeerNotFound(from.to_string()))?;
                if let Err(e) = entry.link.accept_answer(&sdp).await {
                    entry.state = PeerState::Failed;
                    return Err(ClassroomError::peer_failed(from, e));
                }
                entry.remote_description_set = true;
                Self::flush_candidates(from, entry).await;
                Ok(Vec::new())
            }
            SignalPayload::Candidate { candidate } => {
                match self.peers.get_mut(from) {
                    Some(entry) if entry.remote_description_set => {
                        if let Err(e) = entry.link.add_ice_candidate(candidate).await {
                            tracing::warn!(peer_id = %from, error = %e, "Rejected ICE candidate");
                        }
                    }
                    Some(entry) => entry.pending_candidates.push(candidate),
                    None => {
                        // Offer still in flight from their side
                        self.deferred
                            .entry(from.to_string())
                            .or_default()
                            .push(SignalPayload::Candidate { candidate });
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    async fn flush_candidates(peer_id: &str, entry: &mut PeerEntry) {
        for candidate in entry.pending_candidates.drain(..) {
            if let Err(e) = entry.link.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %peer_id, error = %e, "Rejected queued ICE candidate");
            }
        }
    }

    /// Folds one peer event. A failed peer is reported as
    /// `PeerConnectionFailed` and affects nobody else. Events from links that
    /// were closed or replaced are dropped.
    pub fn handle_peer_event(&mut self, event: LinkEvent) -> Result<Option<SignalMessage>> {
        let LinkEvent { link_id, event } = event;
        if self.link_id(event.peer_id()) != Some(link_id) {
            tracing::debug!(peer_id = %event.peer_id(), link_id, "Dropping event from a stale peer link");
            return Ok(None);
        }
        match event {
            PeerEvent::LocalCandidate { peer_id, candidate } => Ok(Some(SignalMessage {
                to: peer_id,
                payload: SignalPayload::Candidate { candidate },
            })),
            PeerEvent::StateChanged { peer_id, state } => {
                let Some(entry) = self.peers.get_mut(&peer_id) else {
                    return Ok(None);
                };
                entry.state = state;
                entry.quality = estimate_quality(&PeerStats {
                    state,
                    round_trip_time: None,
                });
                if state == PeerState::Failed {
                    return Err(ClassroomError::peer_failed(peer_id, "ICE connection failed"));
                }
                Ok(None)
            }
            PeerEvent::TrackAdded { peer_id, tap } => {
                if let Some(recorder) = self.active_recorder() {
                    if let Err(e) = tap.attach(recorder) {
                        tracing::warn!(peer_id = %peer_id, error = %e, "Failed to record remote track");
                    }
                }
                self.remote_taps.retain(|t| {
                    let replaced = t.participant_id() == peer_id && t.kind() == tap.kind();
                    if replaced {
                        t.detach();
                    }
                    !replaced
                });
                self.remote_taps.push(tap);
                Ok(None)
            }
        }
    }

    pub fn peer_states(&self) -> Vec<(ParticipantId, PeerState)> {
        let mut states: Vec<_> = self.peers.iter().map(|(id, e)| (id.clone(), e.state)).collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn peer_quality(&self, peer_id: &str) -> Option<ConnectionQuality> {
        self.peers.get(peer_id).map(|e| e.quality)
    }

    /// Flips the microphone. The local record changes before anything is
    /// published.
    pub fn toggle_microphone(&mut self, now: Timestamp) -> Result<LocalChange> {
        let track = self
            .local
            .audio
            .as_ref()
            .ok_or_else(|| ClassroomError::DeviceUnavailable("no microphone".to_string()))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        let update = self.roster.apply_local(
            PresencePatch {
                is_muted: Some(!enabled),
                ..Default::default()
            },
            now,
        );
        Ok(LocalChange { value: enabled, update })
    }

    pub fn toggle_camera(&mut self, now: Timestamp) -> Result<LocalChange> {
        let track = self
            .local
            .video
            .as_ref()
            .ok_or_else(|| ClassroomError::DeviceUnavailable("no camera".to_string()))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        let update = self.roster.apply_local(
            PresencePatch {
                is_camera_off: Some(!enabled),
                ..Default::default()
            },
            now,
        );
        Ok(LocalChange { value: enabled, update })
    }

    pub fn raise_hand(&mut self, now: Timestamp) -> LocalChange {
        let raised = !self.roster.local().hand_raised;
        let update = self.roster.apply_local(
            PresencePatch {
                hand_raised: Some(raised),
                ..Default::default()
            },
            now,
        );
        LocalChange { value: raised, update }
    }

    fn active_recorder(&self) -> Option<Arc<Recorder>> {
        self.recorder.clone().filter(|r| r.state().is_active())
    }

    pub fn is_recording(&self) -> bool {
        self.active_recorder().is_some()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recorder
            .as_ref()
            .map(|r| r.state())
            .unwrap_or_default()
    }

    fn require_teacher(&self) -> Result<()> {
        if self.role != Role::Teacher {
            return Err(ClassroomError::Unauthorized(self.local_id().to_string()));
        }
        Ok(())
    }

    /// Starts recording local and remote tracks. Teacher only.
    pub fn start_recording(&mut self, now: Timestamp) -> Result<Option<PresenceUpdate>> {
        self.require_teacher()?;
        if !self.recording.enabled {
            return Err(ClassroomError::RecordingUnsupported(
                "recording is disabled".to_string(),
            ));
        }
        if self.is_recording() {
            return Ok(None);
        }

        let recorder = Arc::new(Recorder::start(&self.recording.output_dir, &self.room_id, now)?);
        let taps = self
            .local
            .tracks()
            .map(|t| t.tap())
            .chain(self.remote_taps.iter().cloned());
        for tap in taps {
            if let Err(e) = tap.attach(recorder.clone()) {
                tracing::warn!(
                    participant_id = %tap.participant_id(),
                    kind = %tap.kind(),
                    error = %e,
                    "Failed to attach recording tap"
                );
            }
        }
        self.recorder = Some(recorder);

        Ok(self.roster.apply_local(
            PresencePatch {
                is_recording: Some(true),
                ..Default::default()
            },
            now,
        ))
    }

    pub fn stop_recording(&mut self, now: Timestamp) -> Result<Option<PresenceUpdate>> {
        self.require_teacher()?;
        let Some(recorder) = self.active_recorder() else {
            return Ok(None);
        };

        for tap in self.local.tracks().map(|t| t.tap()).chain(self.remote_taps.iter().cloned()) {
            tap.detach();
        }
        match recorder.stop() {
            Ok(files) => {
                tracing::info!(room_id = %self.room_id, files = files.len(), "Recording finalized");
            }
            Err(e) => {
                tracing::error!(room_id = %self.room_id, error = %e, "Recording ended with errors");
            }
        }

        Ok(self.roster.apply_local(
            PresencePatch {
                is_recording: Some(false),
                ..Default::default()
            },
            now,
        ))
    }

    /// Samples every peer and republishes the local quality if it changed.
    pub async fn sample_quality(&mut self, now: Timestamp) -> Option<PresenceUpdate> {
        for entry in self.peers.values_mut() {
            let stats = entry.link.stats().await;
            entry.state = stats.state;
            entry.quality = estimate_quality(&stats);
        }
        let overall = aggregate(self.peers.values().map(|e| e.quality));
        self.roster.apply_local(
            PresencePatch {
                connection_quality: Some(overall),
                ..Default::default()
            },
            now,
        )
    }

    pub fn apply_presence(&mut self, update: &PresenceUpdate, sender: &str, seen: Instant) -> RosterChange {
        self.roster.apply_remote(update, sender, seen)
    }

    /// Stops recording, leaves the mesh and releases capture.
    pub async fn dispose(&mut self, now: Timestamp) {
        if self.role == Role::Teacher {
            if let Err(e) = self.stop_recording(now) {
                tracing::warn!(room_id = %self.room_id, error = %e, "Failed to stop recording on dispose");
            }
        }
        self.leave_room().await;
        for track in self.local.tracks() {
            track.set_enabled(false);
        }
        self.local = LocalMedia::default();
        self.remote_taps.clear();
        self.mode = MediaMode::Spectator;
    }
}
