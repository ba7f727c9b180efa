// Integration tests for the classroom relay
// A relay is bound to an ephemeral loopback port and driven by real WebSocket clients

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use classroom_sync::channel::{
    ChannelEvent, ChannelMessage, ChannelState, Envelope, SessionChannel, WebSocketChannel,
};
use classroom_sync::clock::SystemClock;
use classroom_sync::config::{ChannelConfig, PresenceConfig, RecordingConfig};
use classroom_sync::identity::StaticDirectory;
use classroom_sync::media::{LocalMedia, PeerConnector, PeerEventSender, PeerLink, StaticDevices};
use classroom_sync::model::{Color, Point, Role, RoomSession, SessionStatus, Stroke, Tool};
use classroom_sync::relay::{self, RelayState};
use classroom_sync::{Classroom, ClassroomCommand, ClassroomDeps, ClassroomError, ClassroomSetup, ClassroomView, Result};

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    let state = RelayState::new();
    let (addr, server) = warp::serve(relay::routes(state.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, state)
}

fn channel_config(addr: SocketAddr) -> ChannelConfig {
    ChannelConfig {
        relay_url: format!("ws://{}", addr),
        reconnect_initial: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(500),
        failure_threshold: 3,
    }
}

/// Waits for the next message of `family`, skipping everything else.
async fn next_message(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>, family: &str) -> Envelope {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(ChannelEvent::Message(envelope)) if envelope.message.family() == family => return envelope,
                Some(_) => continue,
                None => panic!("channel closed while waiting for {family}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {family}"))
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _state) = start_relay().await;

    let resp = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(resp.status(), 200, "Health endpoint should return 200 OK");

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "classroom-relay");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_socket_requires_participant() {
    let (addr, _state) = start_relay().await;

    let result = tokio_tungstenite::connect_async(format!("ws://{}/rooms/r1?participant=", addr)).await;
    assert!(result.is_err(), "Upgrade without a participant should be refused");
}

#[tokio::test]
async fn test_publish_echo_and_late_join_resync() {
    let (addr, state) = start_relay().await;
    let config = channel_config(addr);

    let teacher = WebSocketChannel::connect(&config, "room 7", "t1");
    let mut teacher_rx = teacher.subscribe();
    next_message(&mut teacher_rx, "sync_complete").await;
    assert_eq!(teacher.state(), ChannelState::Connected);

    let session = RoomSession::waiting("room 7", "t1", 1_000);
    teacher
        .publish(ChannelMessage::Lifecycle {
            session: session.clone(),
        })
        .unwrap();
    let echo = next_message(&mut teacher_rx, "lifecycle").await;
    assert_eq!(echo.sender_id, "t1");
    assert_eq!(echo.message, ChannelMessage::Lifecycle { session: session.clone() });

    // A late joiner gets the retained lifecycle before sync_complete
    let student = WebSocketChannel::connect(&config, "room 7", "s1");
    let mut student_rx = student.subscribe();
    let replayed = next_message(&mut student_rx, "lifecycle").await;
    assert_eq!(replayed.message, ChannelMessage::Lifecycle { session });
    next_message(&mut student_rx, "sync_complete").await;

    let stroke = Stroke {
        stroke_id: "stroke-1".into(),
        author_id: "s1".into(),
        points: vec![Point::new(0.1, 0.1), Point::new(0.9, 0.9)],
        tool: Tool::Pen,
        color: Color::BLACK,
        width: 0.01,
        created_at: 2_000,
    };
    student.publish(ChannelMessage::Stroke { stroke: stroke.clone() }).unwrap();
    for rx in [&mut teacher_rx, &mut student_rx] {
        let received = next_message(rx, "stroke").await;
        assert_eq!(received.message, ChannelMessage::Stroke { stroke: stroke.clone() });
    }

    assert_eq!(state.connection_count().await, 2);
    teacher.close().await;
    student.close().await;
    assert_eq!(teacher.state(), ChannelState::Disconnected);
    assert!(matches!(
        teacher.publish(ChannelMessage::SyncComplete),
        Err(ClassroomError::ChannelDisconnected(_))
    ));
}

#[tokio::test]
async fn test_snapshot_endpoint_reflects_retained_state() {
    let (addr, _state) = start_relay().await;

    let teacher = WebSocketChannel::connect(&channel_config(addr), "r1", "t1");
    let mut rx = teacher.subscribe();
    next_message(&mut rx, "sync_complete").await;
    teacher
        .publish(ChannelMessage::Lifecycle {
            session: RoomSession::waiting("r1", "t1", 1_000),
        })
        .unwrap();
    next_message(&mut rx, "lifecycle").await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/rooms/r1/snapshot", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["lifecycle"]["message"]["kind"], "lifecycle");
    assert_eq!(body["lifecycle"]["message"]["session"]["status"], "waiting");
    teacher.close().await;
}

struct NoMedia;

#[async_trait]
impl PeerConnector for NoMedia {
    async fn connect(
        &self,
        peer_id: &str,
        _local: &LocalMedia,
        _events: PeerEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        Err(ClassroomError::peer_failed(peer_id, "media is not exercised here"))
    }
}

async fn open(addr: SocketAddr, id: &str, role: Role) -> Classroom {
    let setup = ClassroomSetup {
        room_id: "algebra".into(),
        participant_id: id.into(),
        requested_role: role,
        material: None,
        surface_size: (64, 48),
        presence: PresenceConfig::default(),
        recording: RecordingConfig {
            enabled: false,
            output_dir: "./unused".into(),
        },
    };
    let deps = ClassroomDeps {
        channel: Arc::new(WebSocketChannel::connect(&channel_config(addr), "algebra", id)),
        identity: Arc::new(StaticDirectory::new()),
        devices: Arc::new(StaticDevices::none()),
        connector: Arc::new(NoMedia),
        archive: None,
        clock: Arc::new(SystemClock),
    };
    Classroom::open(setup, deps).await.unwrap()
}

async fn wait_until<F>(classroom: &mut Classroom, predicate: F) -> ClassroomView
where
    F: Fn(&ClassroomView) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        classroom.pump().await;
        let view = classroom.view();
        if predicate(&view) {
            return view;
        }
        assert!(Instant::now() < deadline, "condition not reached, last view: {view:?}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_classroom_over_relay() {
    let (addr, _state) = start_relay().await;

    let mut teacher = open(addr, "t1", Role::Teacher).await;
    wait_until(&mut teacher, |v| v.channel == ChannelState::Connected && v.can_start_session).await;

    let mut student = open(addr, "s1", Role::Student).await;
    wait_until(&mut student, |v| v.is_waiting_for_teacher && v.roster.len() == 2).await;
    wait_until(&mut teacher, |v| v.roster.len() == 2).await;

    teacher.execute(ClassroomCommand::StartClass).await.unwrap();
    wait_until(&mut student, |v| v.status == SessionStatus::Started && v.drawing_enabled).await;

    for command in [
        ClassroomCommand::PointerDown { x: 5.0, y: 5.0 },
        ClassroomCommand::PointerMove { x: 30.0, y: 20.0 },
        ClassroomCommand::PointerMove { x: 60.0, y: 40.0 },
        ClassroomCommand::PointerUp,
    ] {
        teacher.execute(command).await.unwrap();
    }
    wait_until(&mut student, |v| v.stroke_count == 1).await;
    wait_until(&mut teacher, |v| v.stroke_count == 1).await;
    assert_eq!(teacher.drawing().surface().pixels(), student.drawing().surface().pixels());

    student.execute(ClassroomCommand::RaiseHand).await.unwrap();
    wait_until(&mut teacher, |v| {
        v.roster.iter().any(|p| p.participant_id == "s1" && p.hand_raised)
    })
    .await;

    teacher.execute(ClassroomCommand::EndClass).await.unwrap();
    let view = wait_until(&mut student, |v| v.status == SessionStatus::Ended).await;
    assert!(!view.drawing_enabled);

    student.dispose().await;
    teacher.dispose().await;
}

async fn wait_for_relay<F>(state: &RelayState, predicate: F)
where
    F: Fn(Option<SessionStatus>, usize) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = state
            .snapshot("algebra")
            .await
            .and_then(|snapshot| snapshot.lifecycle().map(|session| session.status));
        if predicate(status, state.connection_count().await) {
            return;
        }
        assert!(Instant::now() < deadline, "relay did not reach the expected state");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_room_resumes_after_everyone_left() {
    let (addr, state) = start_relay().await;

    let mut teacher = open(addr, "t1", Role::Teacher).await;
    wait_until(&mut teacher, |v| v.channel == ChannelState::Connected && v.can_start_session).await;
    teacher.execute(ClassroomCommand::StartClass).await.unwrap();
    wait_for_relay(&state, |status, _| status == Some(SessionStatus::Started)).await;
    teacher.dispose().await;
    wait_for_relay(&state, |_, connections| connections == 0).await;

    let mut student = open(addr, "s1", Role::Student).await;
    let view = wait_until(&mut student, |v| v.status == SessionStatus::Started).await;
    assert!(!view.is_waiting_for_teacher);
    assert!(view.can_join_video);

    let mut returning = open(addr, "t1", Role::Teacher).await;
    wait_until(&mut returning, |v| v.status == SessionStatus::Started && v.roster.len() == 2).await;
    returning.execute(ClassroomCommand::EndClass).await.unwrap();
    wait_until(&mut student, |v| v.status == SessionStatus::Ended).await;
    student.dispose().await;
    returning.dispose().await;
    wait_for_relay(&state, |_, connections| connections == 0).await;

    // Ended stays ended for a teacher who opens the room again
    let mut late = open(addr, "t1", Role::Teacher).await;
    let view = wait_until(&mut late, |v| v.status == SessionStatus::Ended).await;
    assert!(!view.can_start_session);
    assert!(matches!(
        late.execute(ClassroomCommand::StartClass).await,
        Err(ClassroomError::InvalidTransition { .. })
    ));
    late.dispose().await;
}
