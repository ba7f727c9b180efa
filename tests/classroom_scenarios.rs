// End-to-end classroom scenarios
// Teacher and student clients share an in-process channel hub and a manual clock

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use classroom_sync::archive::{ArchiveQueue, FileArchiveSink, SessionArchive};
use classroom_sync::channel::{ChannelEvent, IceCandidate, MemoryHub, SessionChannel};
use classroom_sync::clock::ManualClock;
use classroom_sync::config::{PresenceConfig, RecordingConfig};
use classroom_sync::drawing::{DrawingSurfaceController, RasterSurface};
use classroom_sync::identity::StaticDirectory;
use classroom_sync::media::{LocalMedia, PeerConnector, PeerEventSender, PeerLink, PeerState, PeerStats, StaticDevices};
use classroom_sync::model::{Color, MaterialRef, Point, Role, SessionStatus, Stroke, Tool};
use classroom_sync::{Classroom, ClassroomCommand, ClassroomDeps, ClassroomError, ClassroomSetup, Result};

const ROOM: &str = "physics-101";

/// Records who was dialed and answers every negotiation step.
#[derive(Default)]
struct LoopbackConnector {
    dialed: Mutex<Vec<String>>,
}

impl LoopbackConnector {
    fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

struct LoopbackLink {
    peer_id: String,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        peer_id: &str,
        _local: &LocalMedia,
        _events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        self.dialed.lock().unwrap().push(peer_id.to_string());
        Ok(Arc::new(LoopbackLink {
            peer_id: peer_id.to_string(),
        }))
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn create_offer(&self) -> Result<String> {
        Ok(format!("offer-for-{}", self.peer_id))
    }

    async fn accept_offer(&self, _sdp: &str) -> Result<String> {
        Ok(format!("answer-for-{}", self.peer_id))
    }

    async fn accept_answer(&self, _sdp: &str) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> PeerStats {
        PeerStats {
            state: PeerState::Connected,
            round_trip_time: Some(Duration::from_millis(40)),
        }
    }

    async fn close(&self) {}
}

struct Client {
    classroom: Classroom,
    connector: Arc<LoopbackConnector>,
}

async fn join(
    hub: &MemoryHub,
    id: &str,
    role: Role,
    clock: &Arc<ManualClock>,
    archive: Option<Arc<ArchiveQueue>>,
) -> Client {
    let connector = Arc::new(LoopbackConnector::default());
    let setup = ClassroomSetup {
        room_id: ROOM.into(),
        participant_id: id.into(),
        requested_role: role,
        material: Some(MaterialRef("lessons/optics.pdf".into())),
        surface_size: (64, 48),
        presence: PresenceConfig::default(),
        recording: RecordingConfig {
            enabled: false,
            output_dir: "./unused".into(),
        },
    };
    let deps = ClassroomDeps {
        channel: Arc::new(hub.connect(ROOM, id)),
        identity: Arc::new(StaticDirectory::new().with("t1", "Ms. Frizzle", Role::Teacher)),
        devices: Arc::new(StaticDevices::all()),
        connector: connector.clone(),
        archive,
        clock: clock.clone(),
    };
    let classroom = Classroom::open(setup, deps).await.unwrap();
    Client { classroom, connector }
}

/// Pumps every client until no events are left anywhere.
async fn settle(clients: &mut [&mut Client]) {
    loop {
        let mut handled = 0;
        for client in clients.iter_mut() {
            handled += client.classroom.pump().await;
        }
        if handled == 0 {
            return;
        }
    }
}

async fn draw(client: &mut Client, points: &[(f32, f32)]) {
    let (first, rest) = points.split_first().unwrap();
    client
        .classroom
        .execute(ClassroomCommand::PointerDown { x: first.0, y: first.1 })
        .await
        .unwrap();
    for (x, y) in rest {
        client
            .classroom
            .execute(ClassroomCommand::PointerMove { x: *x, y: *y })
            .await
            .unwrap();
    }
    client.classroom.execute(ClassroomCommand::PointerUp).await.unwrap();
}

async fn classroom_of_two(hub: &MemoryHub, clock: &Arc<ManualClock>) -> (Client, Client) {
    let mut teacher = join(hub, "t1", Role::Teacher, clock, None).await;
    settle(&mut [&mut teacher]).await;
    clock.advance(100);
    let mut student = join(hub, "s1", Role::Student, clock, None).await;
    settle(&mut [&mut teacher, &mut student]).await;
    (teacher, student)
}

#[tokio::test]
async fn test_start_class_admits_student_to_media() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;

    let view = student.classroom.view();
    assert_eq!(view.status, SessionStatus::Waiting);
    assert!(view.is_waiting_for_teacher);
    assert!(!view.media_joined);
    assert!(student.connector.dialed().is_empty());

    let roster = teacher.classroom.view().roster;
    assert_eq!(roster.len(), 2);
    assert!(roster.iter().any(|p| p.display_name == "Ms. Frizzle"));
    assert!(roster.iter().any(|p| p.participant_id == "s1" && p.role == Role::Student));

    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::StartClass).await.unwrap();
    settle(&mut [&mut teacher, &mut student]).await;

    let view = student.classroom.view();
    assert_eq!(view.status, SessionStatus::Started);
    assert!(view.can_join_video);
    assert!(view.media_joined);

    // The smaller id dials and the other side answers
    assert_eq!(student.connector.dialed(), vec!["t1".to_string()]);
    assert_eq!(teacher.connector.dialed(), vec!["s1".to_string()]);
    assert_eq!(student.classroom.media().peer_states().len(), 1);
    assert_eq!(teacher.classroom.media().peer_states().len(), 1);
}

#[tokio::test]
async fn test_two_strokes_render_identically_everywhere() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;
    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::StartClass).await.unwrap();
    settle(&mut [&mut teacher, &mut student]).await;

    clock.advance(100);
    teacher
        .classroom
        .execute(ClassroomCommand::SetColor(Color::rgb(200, 30, 30)))
        .await
        .unwrap();
    draw(&mut teacher, &[(4.0, 4.0), (12.0, 8.0), (20.0, 12.0), (28.0, 16.0), (36.0, 20.0)]).await;

    clock.advance(100);
    student
        .classroom
        .execute(ClassroomCommand::SetTool(Tool::Highlighter))
        .await
        .unwrap();
    draw(&mut student, &[(60.0, 40.0), (50.0, 34.0), (40.0, 28.0), (30.0, 22.0), (20.0, 16.0)]).await;

    settle(&mut [&mut teacher, &mut student]).await;

    assert_eq!(teacher.classroom.view().stroke_count, 2);
    assert_eq!(student.classroom.view().stroke_count, 2);
    assert_eq!(
        teacher.classroom.drawing().surface().pixels(),
        student.classroom.drawing().surface().pixels()
    );
    assert!(teacher.classroom.drawing().surface().painted_pixels() > 0);
}

#[tokio::test]
async fn test_tap_leaves_no_stroke() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;

    draw(&mut teacher, &[(10.0, 10.0)]).await;
    settle(&mut [&mut teacher, &mut student]).await;

    assert_eq!(teacher.classroom.view().stroke_count, 0);
    assert_eq!(student.classroom.view().stroke_count, 0);
    assert_eq!(teacher.classroom.drawing().surface().painted_pixels(), 0);
}

#[tokio::test]
async fn test_student_is_gated_by_role_and_status() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;
    let watcher = hub.connect(ROOM, "watcher");
    let mut seen = watcher.subscribe();
    while seen.try_recv().is_ok() {}

    assert!(matches!(
        student.classroom.execute(ClassroomCommand::StartClass).await,
        Err(ClassroomError::Unauthorized(_))
    ));
    assert!(matches!(
        student.classroom.execute(ClassroomCommand::EndClass).await,
        Err(ClassroomError::Unauthorized(_))
    ));
    assert!(matches!(
        student.classroom.execute(ClassroomCommand::StartRecording).await,
        Err(ClassroomError::Unauthorized(_))
    ));
    assert!(student.classroom.view().last_error.is_some());

    // Drawing while waiting is silently ignored for students
    draw(&mut student, &[(1.0, 1.0), (30.0, 30.0)]).await;
    settle(&mut [&mut teacher, &mut student]).await;
    assert_eq!(teacher.classroom.view().stroke_count, 0);
    assert_eq!(teacher.classroom.view().status, SessionStatus::Waiting);

    // Nothing the student tried reached the room
    let from_student: Vec<&'static str> = std::iter::from_fn(|| seen.try_recv().ok())
        .filter_map(|event| match event {
            ChannelEvent::Message(envelope) if envelope.sender_id == "s1" => Some(envelope.message.family()),
            _ => None,
        })
        .collect();
    assert!(from_student.is_empty(), "student published {from_student:?}");
}

#[tokio::test]
async fn test_reopened_student_gets_a_new_media_link() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;
    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::StartClass).await.unwrap();
    settle(&mut [&mut teacher, &mut student]).await;
    assert_eq!(teacher.connector.dialed(), vec!["s1".to_string()]);

    // The student's process dies without sending leave
    drop(student);
    clock.advance(2_000);
    let mut reopened = join(&hub, "s1", Role::Student, &clock, None).await;
    settle(&mut [&mut teacher, &mut reopened]).await;

    assert_eq!(teacher.connector.dialed(), vec!["s1".to_string(), "s1".to_string()]);
    assert_eq!(reopened.connector.dialed(), vec!["t1".to_string()]);
    assert!(reopened.classroom.view().media_joined);
    assert_eq!(reopened.classroom.media().peer_states().len(), 1);
    assert_eq!(teacher.classroom.media().peer_states().len(), 1);
    assert_eq!(teacher.classroom.view().roster.len(), 2);
}

#[tokio::test]
async fn test_ended_is_terminal() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;

    assert!(matches!(
        teacher.classroom.execute(ClassroomCommand::EndClass).await,
        Err(ClassroomError::InvalidTransition { .. })
    ));

    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::StartClass).await.unwrap();
    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::EndClass).await.unwrap();
    settle(&mut [&mut teacher, &mut student]).await;

    for client in [&teacher, &student] {
        let view = client.classroom.view();
        assert_eq!(view.status, SessionStatus::Ended);
        assert!(!view.drawing_enabled);
        assert!(!view.media_joined);
        assert!(!view.can_join_video);
    }

    clock.advance(100);
    assert!(matches!(
        teacher.classroom.execute(ClassroomCommand::StartClass).await,
        Err(ClassroomError::InvalidTransition { .. })
    ));
    assert_eq!(teacher.classroom.view().status, SessionStatus::Ended);
}

#[tokio::test]
async fn test_stroke_echo_is_applied_once() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;

    clock.advance(100);
    draw(&mut teacher, &[(5.0, 5.0), (25.0, 25.0), (45.0, 5.0)]).await;
    settle(&mut [&mut teacher, &mut student]).await;
    let stroke = teacher.classroom.drawing().log().strokes()[0].clone();

    // The author's own echo is deduplicated
    assert_eq!(teacher.classroom.drawing().log().strokes(), &[stroke.clone()]);
    assert_eq!(student.classroom.drawing().log().strokes(), &[stroke.clone()]);
    let before = student.classroom.drawing().surface().pixels().to_vec();

    // Resync after a transport drop keeps the local log
    hub.disconnect(ROOM, "s1");
    hub.reconnect(ROOM, "s1");
    settle(&mut [&mut teacher, &mut student]).await;

    assert_eq!(student.classroom.drawing().log().strokes(), &[stroke]);
    assert_eq!(student.classroom.drawing().surface().pixels(), &before[..]);
}

#[tokio::test]
async fn test_mic_toggle_while_offline_is_announced_on_reconnect() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;

    hub.disconnect(ROOM, "s1");
    settle(&mut [&mut teacher, &mut student]).await;

    clock.advance(100);
    student.classroom.execute(ClassroomCommand::ToggleMicrophone).await.unwrap();
    assert!(student.classroom.media().roster().local().is_muted);
    settle(&mut [&mut teacher, &mut student]).await;
    let seen_by_teacher = |teacher: &Client| {
        teacher
            .classroom
            .view()
            .roster
            .into_iter()
            .find(|p| p.participant_id == "s1")
            .map(|p| p.is_muted)
    };
    assert_eq!(seen_by_teacher(&teacher), Some(false));

    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::StartClass).await.unwrap();
    settle(&mut [&mut teacher, &mut student]).await;

    clock.advance(100);
    hub.reconnect(ROOM, "s1");
    settle(&mut [&mut teacher, &mut student]).await;
    assert_eq!(seen_by_teacher(&teacher), Some(true));
    assert_eq!(student.classroom.view().status, SessionStatus::Started);
}

#[tokio::test]
async fn test_stroke_is_refused_while_disconnected() {
    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let (mut teacher, mut student) = classroom_of_two(&hub, &clock).await;

    hub.disconnect(ROOM, "t1");
    settle(&mut [&mut teacher, &mut student]).await;

    teacher
        .classroom
        .execute(ClassroomCommand::PointerDown { x: 2.0, y: 2.0 })
        .await
        .unwrap();
    teacher
        .classroom
        .execute(ClassroomCommand::PointerMove { x: 40.0, y: 40.0 })
        .await
        .unwrap();
    assert!(matches!(
        teacher.classroom.execute(ClassroomCommand::PointerUp).await,
        Err(ClassroomError::ChannelDisconnected(_))
    ));
    assert!(matches!(
        teacher.classroom.execute(ClassroomCommand::StartClass).await,
        Err(ClassroomError::ChannelDisconnected(_))
    ));
    assert_eq!(teacher.classroom.view().stroke_count, 0);
    assert_eq!(teacher.classroom.drawing().surface().painted_pixels(), 0);
    assert_eq!(teacher.classroom.view().status, SessionStatus::Waiting);
}

#[tokio::test]
async fn test_end_of_class_is_archived_once() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArchiveSink::new(dir.path()));
    let path = sink.path_for(ROOM);
    let queue = Arc::new(ArchiveQueue::with_retry_delay(sink, 1, Duration::from_millis(10)));

    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::new(10_000));
    let mut teacher = join(&hub, "t1", Role::Teacher, &clock, Some(queue)).await;
    settle(&mut [&mut teacher]).await;

    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::StartClass).await.unwrap();
    clock.advance(100);
    draw(&mut teacher, &[(3.0, 3.0), (30.0, 20.0), (60.0, 40.0)]).await;
    clock.advance(100);
    teacher.classroom.execute(ClassroomCommand::EndClass).await.unwrap();
    teacher.classroom.dispose().await;

    let mut stored: Option<SessionArchive> = None;
    for _ in 0..100 {
        if let Ok(text) = tokio::fs::read_to_string(&path).await {
            if let Ok(archive) = serde_json::from_str(&text) {
                stored = Some(archive);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let archive = stored.expect("archive was not written");

    assert_eq!(archive.session.status, SessionStatus::Ended);
    assert_eq!(archive.session.teacher_id.as_deref(), Some("t1"));
    assert_eq!(archive.strokes.len(), 1);
    assert_eq!(archive.material, Some(MaterialRef("lessons/optics.pdf".into())));
}

fn stroke_strategy() -> impl Strategy<Value = Vec<Stroke>> {
    let stroke = (
        0u64..4,
        prop::collection::vec((0.0f32..1.0, 0.0f32..1.0), 2..6),
        prop::sample::select(vec![Tool::Pen, Tool::Highlighter, Tool::Eraser]),
        any::<(u8, u8, u8)>(),
    );
    prop::collection::vec(stroke, 1..8).prop_map(|parts| {
        parts
            .into_iter()
            .enumerate()
            .map(|(i, (at, points, tool, (r, g, b)))| Stroke {
                stroke_id: format!("stroke-{i}"),
                author_id: format!("p{}", i % 3),
                points: points.into_iter().map(|(x, y)| Point::new(x, y)).collect(),
                tool,
                color: Color::rgb(r, g, b),
                width: 0.08,
                created_at: 1_000 + at,
            })
            .collect()
    })
}

fn merged(strokes: &[Stroke]) -> DrawingSurfaceController<RasterSurface> {
    let mut controller = DrawingSurfaceController::new("observer", RasterSurface::new(32, 24));
    for stroke in strokes {
        controller.apply_remote_stroke(stroke.clone());
    }
    controller
}

proptest! {
    #[test]
    fn test_merge_is_order_independent(
        (strokes, shuffled) in stroke_strategy()
            .prop_flat_map(|strokes| (Just(strokes.clone()), Just(strokes).prop_shuffle()))
    ) {
        let a = merged(&strokes);
        let b = merged(&shuffled);
        prop_assert_eq!(a.log().strokes(), b.log().strokes());
        prop_assert_eq!(a.surface().pixels(), b.surface().pixels());
    }

    #[test]
    fn test_merge_is_idempotent(strokes in stroke_strategy()) {
        let once = merged(&strokes);
        let doubled: Vec<Stroke> = strokes.iter().chain(strokes.iter()).cloned().collect();
        let twice = merged(&doubled);
        prop_assert_eq!(once.log().len(), strokes.len());
        prop_assert_eq!(once.surface().pixels(), twice.surface().pixels());
    }
}
