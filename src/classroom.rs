//! Classroom Orchestrator.
//!
//! One [`Classroom`] per client and room. It owns the lifecycle replica, the
//! media service and the drawing controller, feeds them from a single event
//! loop and enforces the cross-cutting gates:
//!
//! * students join media once the class is `started`, teachers immediately;
//! * the teacher may draw while `waiting`, students only while `started`,
//!   nobody after `ended`;
//! * at `ended` the room is archived once, best-effort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::archive::{ArchiveQueue, SessionArchive};
use crate::channel::{
    ChannelEvent, ChannelMessage, ChannelState, Envelope, PresenceUpdate, SessionChannel, SignalMessage,
};
use crate::clock::Clock;
use crate::config::{PresenceConfig, RecordingConfig};
use crate::drawing::{DrawingSurfaceController, RasterSurface};
use crate::error::{ClassroomError, Result};
use crate::identity::{self, IdentityProvider};
use crate::lifecycle::{SessionStateMachine, Transition};
use crate::media::{CaptureDevices, LinkEvent, MediaMode, MediaService, PeerConnector};
use crate::model::{Color, MaterialRef, Participant, ParticipantId, Role, RoomId, SessionStatus, Tool};
use crate::presence::RosterChange;

const TICK: Duration = Duration::from_secs(1);

pub struct ClassroomSetup {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    /// Used when the identity provider cannot be reached.
    pub requested_role: Role,
    pub material: Option<MaterialRef>,
    pub surface_size: (u32, u32),
    pub presence: PresenceConfig,
    pub recording: RecordingConfig,
}

/// Collaborators injected into a classroom.
pub struct ClassroomDeps {
    pub channel: Arc<dyn SessionChannel>,
    pub identity: Arc<dyn IdentityProvider>,
    pub devices: Arc<dyn CaptureDevices>,
    pub connector: Arc<dyn PeerConnector>,
    /// Receives the final room state at `ended`; teacher clients only.
    pub archive: Option<Arc<ArchiveQueue>>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassroomCommand {
    StartClass,
    EndClass,
    ToggleMicrophone,
    ToggleCamera,
    RaiseHand,
    StartRecording,
    StopRecording,
    /// Pixel coordinates on the drawing surface.
    PointerDown { x: f32, y: f32 },
    PointerMove { x: f32, y: f32 },
    PointerUp,
    SetTool(Tool),
    SetColor(Color),
    SetWidth(f32),
    Clear,
    Resize { width: u32, height: u32 },
    Leave,
}

/// Read-only snapshot for UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassroomView {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub role: Role,
    pub status: SessionStatus,
    pub can_start_session: bool,
    pub can_join_video: bool,
    pub is_waiting_for_teacher: bool,
    pub roster: Vec<Participant>,
    pub channel: ChannelState,
    pub media_mode: MediaMode,
    pub media_joined: bool,
    pub recording: bool,
    pub drawing_enabled: bool,
    pub stroke_count: usize,
    pub material: Option<MaterialRef>,
    pub last_error: Option<String>,
}

enum Inbound {
    Channel(ChannelEvent),
    Peer(LinkEvent),
    Tick,
    Command(Option<ClassroomCommand>),
}

pub struct Classroom {
    room_id: RoomId,
    local_id: ParticipantId,
    role: Role,
    channel: Arc<dyn SessionChannel>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    peer_events: mpsc::UnboundedReceiver<LinkEvent>,
    lifecycle: SessionStateMachine,
    media: MediaService,
    drawing: DrawingSurfaceController<RasterSurface>,
    archive: Option<Arc<ArchiveQueue>>,
    clock: Arc<dyn Clock>,
    material: Option<MaterialRef>,
    channel_state: ChannelState,
    heartbeat: Duration,
    last_announce: Option<Instant>,
    archived: bool,
    disposed: bool,
    last_error: Option<String>,
}

impl Classroom {
    /// Resolves identity, acquires media and subscribes to the room. Identity
    /// and device failures degrade the session instead of failing it.
    pub async fn open(setup: ClassroomSetup, deps: ClassroomDeps) -> Result<Self> {
        let (width, height) = setup.surface_size;
        if width == 0 || height == 0 {
            return Err(ClassroomError::Configuration(format!(
                "drawing surface must not be empty, got {width}x{height}"
            )));
        }

        let profile =
            identity::resolve_or_guest(deps.identity.as_ref(), &setup.participant_id, setup.requested_role).await;
        let role = profile.role;
        let now = deps.clock.now_millis();
        let local = Participant::new(setup.participant_id.clone(), profile.display_name, role, now);

        let (mut media, peer_events) = MediaService::new(
            setup.room_id.clone(),
            local,
            deps.connector,
            deps.devices,
            setup.recording,
            setup.presence.grace,
        );
        let mut last_error = None;
        if let Err(e) = media.initialize(now).await {
            last_error = Some(e.to_string());
        }

        let channel_events = deps.channel.subscribe();
        let mut classroom = Self {
            room_id: setup.room_id.clone(),
            local_id: setup.participant_id.clone(),
            role,
            channel_state: deps.channel.state(),
            channel: deps.channel,
            channel_events,
            peer_events,
            lifecycle: SessionStateMachine::new(setup.room_id.clone(), setup.participant_id.clone(), role),
            media,
            drawing: DrawingSurfaceController::new(setup.participant_id.clone(), RasterSurface::new(width, height)),
            archive: deps.archive,
            clock: deps.clock,
            material: setup.material,
            heartbeat: setup.presence.heartbeat,
            last_announce: None,
            archived: false,
            disposed: false,
            last_error,
        };

        if role == Role::Teacher {
            let signals = classroom.media.join_room().await?;
            classroom.publish_signals(signals);
        }
        classroom.apply_drawing_gate();

        tracing::info!(
            room_id = %classroom.room_id,
            participant_id = %classroom.local_id,
            role = %role,
            mode = ?classroom.media.mode(),
            "Classroom opened"
        );
        Ok(classroom)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn lifecycle(&self) -> &SessionStateMachine {
        &self.lifecycle
    }

    pub fn media(&self) -> &MediaService {
        &self.media
    }

    pub fn drawing(&self) -> &DrawingSurfaceController<RasterSurface> {
        &self.drawing
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn view(&self) -> ClassroomView {
        ClassroomView {
            room_id: self.room_id.clone(),
            participant_id: self.local_id.clone(),
            role: self.role,
            status: self.lifecycle.status(),
            can_start_session: self.lifecycle.can_start_session(),
            can_join_video: self.lifecycle.can_join_video(),
            is_waiting_for_teacher: self.lifecycle.is_waiting_for_teacher(),
            roster: self.media.roster().snapshot(),
            channel: self.channel_state,
            media_mode: self.media.mode(),
            media_joined: self.media.is_joined(),
            recording: self.media.is_recording(),
            drawing_enabled: self.drawing.is_enabled(),
            stroke_count: self.drawing.log().len(),
            material: self.material.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Processes inputs until `Leave`, the command queue closing or the
    /// channel going away, then disposes.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<ClassroomCommand>,
        views: Option<watch::Sender<ClassroomView>>,
    ) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.disposed {
            let inbound = tokio::select! {
                event = self.channel_events.recv() => match event {
                    Some(event) => Inbound::Channel(event),
                    None => break,
                },
                Some(event) = self.peer_events.recv() => Inbound::Peer(event),
                _ = tick.tick() => Inbound::Tick,
                command = commands.recv() => Inbound::Command(command),
            };

            match inbound {
                Inbound::Channel(event) => self.handle_channel_event(event).await,
                Inbound::Peer(event) => self.handle_peer_event(event),
                Inbound::Tick => self.tick(Instant::now()).await,
                Inbound::Command(Some(command)) => {
                    if let Err(e) = self.execute(command).await {
                        tracing::warn!(room_id = %self.room_id, error = %e, "Command rejected");
                    }
                }
                Inbound::Command(None) => break,
            }

            if let Some(views) = &views {
                let _ = views.send(self.view());
            }
        }

        self.dispose().await;
        if let Some(views) = &views {
            let _ = views.send(self.view());
        }
    }

    /// Handles every channel and peer event already queued. Returns how many
    /// were processed.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.channel_events.try_recv() {
                self.handle_channel_event(event).await;
            } else if let Ok(event) = self.peer_events.try_recv() {
                self.handle_peer_event(event);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Applies one command. Rejections are also kept as the view's last error.
    pub async fn execute(&mut self, command: ClassroomCommand) -> Result<()> {
        let result = self.dispatch(command).await;
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    async fn dispatch(&mut self, command: ClassroomCommand) -> Result<()> {
        if self.disposed {
            return Err(ClassroomError::ChannelDisconnected(self.room_id.clone()));
        }
        let now = self.clock.now_millis();

        match command {
            ClassroomCommand::StartClass => {
                let mut next = self.lifecycle.clone();
                let session = next.request_start(now)?;
                self.channel.publish(ChannelMessage::Lifecycle { session })?;
                let from = self.lifecycle.status();
                self.lifecycle = next;
                self.on_transition(Transition {
                    from,
                    to: SessionStatus::Started,
                })
                .await;
            }
            ClassroomCommand::EndClass => {
                let mut next = self.lifecycle.clone();
                let session = next.request_end(now)?;
                self.channel.publish(ChannelMessage::Lifecycle { session })?;
                let from = self.lifecycle.status();
                self.lifecycle = next;
                self.on_transition(Transition {
                    from,
                    to: SessionStatus::Ended,
                })
                .await;
            }
            ClassroomCommand::ToggleMicrophone => {
                let change = self.media.toggle_microphone(now)?;
                self.publish_presence(change.update);
            }
            ClassroomCommand::ToggleCamera => {
                let change = self.media.toggle_camera(now)?;
                self.publish_presence(change.update);
            }
            ClassroomCommand::RaiseHand => {
                let change = self.media.raise_hand(now);
                self.publish_presence(change.update);
            }
            ClassroomCommand::StartRecording => {
                let update = self.media.start_recording(now)?;
                self.publish_presence(update);
            }
            ClassroomCommand::StopRecording => {
                let update = self.media.stop_recording(now)?;
                self.publish_presence(update);
            }
            ClassroomCommand::PointerDown { x, y } => {
                self.drawing.start_stroke(x, y);
            }
            ClassroomCommand::PointerMove { x, y } => {
                self.drawing.extend_stroke(x, y);
            }
            ClassroomCommand::PointerUp => {
                if !self.drawing.has_pending() {
                    return Ok(());
                }
                if let Err(e) = self.ensure_connected() {
                    self.drawing.cancel_stroke();
                    return Err(e);
                }
                if let Some(stroke) = self.drawing.commit_stroke(now) {
                    self.channel.publish(ChannelMessage::Stroke { stroke })?;
                }
            }
            ClassroomCommand::SetTool(tool) => self.drawing.set_tool(tool),
            ClassroomCommand::SetColor(color) => self.drawing.set_color(color),
            ClassroomCommand::SetWidth(width) => self.drawing.set_width(width),
            ClassroomCommand::Clear => {
                if !self.drawing.is_enabled() {
                    return Ok(());
                }
                self.ensure_connected()?;
                if let Some(stroke) = self.drawing.clear_surface(now) {
                    self.channel.publish(ChannelMessage::Stroke { stroke })?;
                }
            }
            ClassroomCommand::Resize { width, height } => {
                if width == 0 || height == 0 {
                    return Err(ClassroomError::Configuration(format!(
                        "drawing surface must not be empty, got {width}x{height}"
                    )));
                }
                self.drawing.resize(width, height);
            }
            ClassroomCommand::Leave => self.dispose().await,
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.channel.state() != ChannelState::Connected {
            return Err(ClassroomError::ChannelDisconnected(self.room_id.clone()));
        }
        Ok(())
    }

    /// Folds one channel event.
    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => {
                self.channel_state = state;
            }
            ChannelEvent::Message(envelope) => {
                if envelope.room_id != self.room_id {
                    tracing::warn!(room_id = %envelope.room_id, "Dropping message for another room");
                    return;
                }
                self.handle_envelope(envelope).await;
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope {
            sender_id, message, ..
        } = envelope;
        match message {
            ChannelMessage::Lifecycle { session } => {
                let was_pending = self.lifecycle.session().is_pending();
                if let Some(transition) = self.lifecycle.observe_remote_transition(&session, &sender_id) {
                    // Resumed an already ended room: it was archived when it ended
                    if was_pending && transition.to == SessionStatus::Ended {
                        self.archived = true;
                    }
                    self.on_transition(transition).await;
                }
            }
            ChannelMessage::Presence { update } => {
                match self.media.apply_presence(&update, &sender_id, Instant::now()) {
                    RosterChange::Joined(participant) => {
                        match self.media.on_participant_joined(&participant.participant_id).await {
                            Ok(Some(signal)) => self.publish_signals(vec![signal]),
                            Ok(None) => {}
                            Err(e) => self.record_error(e),
                        }
                    }
                    RosterChange::Rejoined(participant) => {
                        match self.media.on_participant_rejoined(&participant.participant_id).await {
                            Ok(Some(signal)) => self.publish_signals(vec![signal]),
                            Ok(None) => {}
                            Err(e) => self.record_error(e),
                        }
                    }
                    RosterChange::Left(participant_id) => {
                        self.media.on_participant_left(&participant_id).await;
                    }
                    RosterChange::Updated(_) | RosterChange::Unchanged | RosterChange::Ignored => {}
                }
            }
            ChannelMessage::Stroke { stroke } => {
                self.drawing.apply_remote_stroke(stroke);
            }
            ChannelMessage::Signal { signal } => {
                if signal.to != self.local_id {
                    return;
                }
                match self.media.handle_signal(&sender_id, signal.payload).await {
                    Ok(signals) => self.publish_signals(signals),
                    Err(e) => self.record_error(e),
                }
            }
            ChannelMessage::SyncComplete => self.on_sync_complete().await,
        }
    }

    async fn on_sync_complete(&mut self) {
        let now = self.clock.now_millis();
        if let Some(session) = self.lifecycle.resync_record(now) {
            if let Err(e) = self.channel.publish(ChannelMessage::Lifecycle { session }) {
                self.record_error(e);
            }
        }
        // Peers learn about changes made while we were offline
        self.announce(Instant::now());
        self.apply_drawing_gate();
    }

    fn handle_peer_event(&mut self, event: LinkEvent) {
        match self.media.handle_peer_event(event) {
            Ok(Some(signal)) => self.publish_signals(vec![signal]),
            Ok(None) => {}
            Err(e) => self.record_error(e),
        }
    }

    async fn on_transition(&mut self, transition: Transition) {
        tracing::info!(
            room_id = %self.room_id,
            participant_id = %self.local_id,
            from = %transition.from,
            to = %transition.to,
            "Session status changed"
        );
        match transition.to {
            SessionStatus::Started => {
                if !self.media.is_joined() {
                    match self.media.join_room().await {
                        Ok(signals) => self.publish_signals(signals),
                        Err(e) => self.record_error(e),
                    }
                }
            }
            SessionStatus::Ended => {
                let now = self.clock.now_millis();
                if self.role == Role::Teacher {
                    match self.media.stop_recording(now) {
                        Ok(update) => self.publish_presence(update),
                        Err(e) => self.record_error(e),
                    }
                }
                self.media.leave_room().await;
                self.archive_once();
            }
            SessionStatus::Waiting => {}
        }
        self.apply_drawing_gate();
    }

    fn drawing_allowed(&self) -> bool {
        match self.lifecycle.status() {
            SessionStatus::Ended => false,
            SessionStatus::Started => true,
            SessionStatus::Waiting => self.role == Role::Teacher,
        }
    }

    fn apply_drawing_gate(&mut self) {
        let allowed = !self.disposed && self.drawing_allowed();
        if allowed != self.drawing.is_enabled() {
            self.drawing.set_enabled(allowed);
        }
    }

    fn archive_once(&mut self) {
        if self.archived || self.role != Role::Teacher {
            return;
        }
        let Some(queue) = &self.archive else {
            return;
        };
        queue.submit(SessionArchive {
            session: self.lifecycle.session().clone(),
            strokes: self.drawing.log().strokes().to_vec(),
            material: self.material.clone(),
        });
        self.archived = true;
    }

    /// Housekeeping: heartbeat, staleness pruning and quality sampling.
    pub async fn tick(&mut self, now: Instant) {
        if self.disposed {
            return;
        }
        let due = self
            .last_announce
            .map_or(true, |last| now.saturating_duration_since(last) >= self.heartbeat);
        if due && self.channel_state == ChannelState::Connected {
            self.announce(now);
        }

        for participant_id in self.media.roster_mut().prune(now) {
            self.media.on_participant_left(&participant_id).await;
        }

        let update = self.media.sample_quality(self.clock.now_millis()).await;
        self.publish_presence(update);
    }

    fn announce(&mut self, now: Instant) {
        let update = self.media.roster_mut().announce(self.clock.now_millis());
        match self.channel.publish(ChannelMessage::Presence { update }) {
            Ok(()) => self.last_announce = Some(now),
            Err(e) => tracing::debug!(room_id = %self.room_id, error = %e, "Announce not sent"),
        }
    }

    /// Local state already changed; a failed publish is caught up by the
    /// announce after reconnection.
    fn publish_presence(&self, update: Option<PresenceUpdate>) {
        let Some(update) = update else {
            return;
        };
        if let Err(e) = self.channel.publish(ChannelMessage::Presence { update }) {
            tracing::debug!(room_id = %self.room_id, error = %e, "Presence delta not sent");
        }
    }

    fn publish_signals(&self, signals: Vec<SignalMessage>) {
        for signal in signals {
            let to = signal.to.clone();
            if let Err(e) = self.channel.publish(ChannelMessage::Signal { signal }) {
                tracing::warn!(room_id = %self.room_id, peer_id = %to, error = %e, "Failed to send signal");
            }
        }
    }

    fn record_error(&mut self, error: ClassroomError) {
        tracing::warn!(room_id = %self.room_id, participant_id = %self.local_id, error = %error, "Classroom error");
        self.last_error = Some(error.to_string());
    }

    /// Publishes `leave`, closes peers, releases capture, stops recording and
    /// closes the channel. Safe to call more than once.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let now = self.clock.now_millis();

        let leave = self.media.roster_mut().leave(now);
        if let Err(e) = self.channel.publish(ChannelMessage::Presence { update: leave }) {
            tracing::debug!(room_id = %self.room_id, error = %e, "Leave not sent");
        }
        self.drawing.set_enabled(false);
        self.media.dispose(now).await;
        self.channel.close().await;
        self.channel_state = self.channel.state();

        tracing::info!(room_id = %self.room_id, participant_id = %self.local_id, "Classroom disposed");
    }
}
