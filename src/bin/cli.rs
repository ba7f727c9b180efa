// Classroom relay CLI
// Checks relay health, inspects rooms and joins a room as teacher or student

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use classroom_sync::archive::{sink_from_config, ArchiveQueue};
use classroom_sync::channel::{SessionChannel, WebSocketChannel};
use classroom_sync::clock::SystemClock;
use classroom_sync::config::{ChannelConfig, Config};
use classroom_sync::identity::{HttpDirectory, IdentityProvider, StaticDirectory};
use classroom_sync::media::{StaticDevices, WebRtcConnector};
use classroom_sync::model::{Color, MaterialRef, Role, SessionStatus, Tool};
use classroom_sync::{telemetry, Classroom, ClassroomCommand, ClassroomDeps, ClassroomSetup, ClassroomView};

const SURFACE_SIZE: (u32, u32) = (800, 600);

#[derive(Parser)]
#[command(name = "classroom-cli")]
#[command(about = "Classroom relay CLI", long_about = None)]
struct Cli {
    /// Relay address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Teacher,
    Student,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Teacher => Role::Teacher,
            RoleArg::Student => Role::Student,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check relay health endpoint
    Health,

    /// Show the retained snapshot of a room
    Snapshot {
        #[arg(short, long)]
        room: String,
    },

    /// Join a room interactively
    Join {
        #[arg(short, long)]
        room: String,

        #[arg(short, long)]
        participant: String,

        /// Display name used when no identity service is configured
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value = "student")]
        role: RoleArg,

        /// Lesson material shown next to the drawing surface
        #[arg(long)]
        material: Option<String>,

        #[arg(long)]
        no_mic: bool,

        #[arg(long)]
        no_camera: bool,
    },

    /// Run a scripted two-client scenario against the relay
    Validate,
}

#[tokio::main]
async fn main() {
    telemetry::init();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            println!("{} Invalid configuration: {}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::Snapshot { room } => show_snapshot(&cli.server, &room).await,
        Commands::Join {
            room,
            participant,
            name,
            role,
            material,
            no_mic,
            no_camera,
        } => {
            let devices = StaticDevices {
                microphone: !no_mic,
                camera: !no_camera,
            };
            join(&cli.server, &config, room, participant, name, role.into(), material, devices).await;
        }
        Commands::Validate => {
            if !validate(&cli.server, &config).await {
                std::process::exit(1);
            }
        }
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking relay health...".cyan());

    let url = format!("http://{}/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                    println!("  Rooms: {}", body["rooms"]);
                    println!("  Connections: {}", body["connections"]);
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
            println!("  Make sure the relay is running on {}", server);
        }
    }
}

async fn show_snapshot(server: &str, room: &str) {
    let url = format!("http://{}/rooms/{}/snapshot", server, urlencoding::encode(room));
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
            Ok(body) => {
                println!("{} Retained snapshot of {}", "✓".green(), room.bold());
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            }
            Err(e) => println!("{} Invalid snapshot: {}", "✗".red(), e),
        },
        Ok(resp) => println!("{} Snapshot request failed: {}", "✗".red(), resp.status()),
        Err(e) => println!("{} Cannot connect to relay: {}", "✗".red(), e),
    }
}

fn channel_config(server: &str, config: &Config) -> ChannelConfig {
    ChannelConfig {
        relay_url: format!("ws://{}", server),
        ..config.channel.clone()
    }
}

fn identity_for(config: &Config, participant: &str, name: Option<&str>, role: Role) -> Arc<dyn IdentityProvider> {
    if let Some(url) = &config.identity.url {
        match HttpDirectory::new(url.clone(), Duration::from_secs(5)) {
            Ok(directory) => return Arc::new(directory),
            Err(e) => println!("{} Identity service unavailable: {}", "⚠".yellow(), e),
        }
    }
    let mut directory = StaticDirectory::new();
    if let Some(name) = name {
        directory = directory.with(participant, name, role);
    }
    Arc::new(directory)
}

#[allow(clippy::too_many_arguments)]
async fn open_classroom(
    server: &str,
    config: &Config,
    room: &str,
    participant: &str,
    name: Option<&str>,
    role: Role,
    material: Option<String>,
    devices: StaticDevices,
    archive: Option<Arc<ArchiveQueue>>,
) -> Option<Classroom> {
    let connector = match WebRtcConnector::new(&config.webrtc) {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            println!("{} Failed to initialize WebRTC: {}", "✗".red(), e);
            return None;
        }
    };
    let channel: Arc<dyn SessionChannel> =
        Arc::new(WebSocketChannel::connect(&channel_config(server, config), room, participant));

    let setup = ClassroomSetup {
        room_id: room.to_string(),
        participant_id: participant.to_string(),
        requested_role: role,
        material: material.map(MaterialRef),
        surface_size: SURFACE_SIZE,
        presence: config.presence.clone(),
        recording: config.recording.clone(),
    };
    let deps = ClassroomDeps {
        channel,
        identity: identity_for(config, participant, name, role),
        devices: Arc::new(devices),
        connector,
        archive,
        clock: Arc::new(SystemClock),
    };

    match Classroom::open(setup, deps).await {
        Ok(classroom) => Some(classroom),
        Err(e) => {
            println!("{} Failed to open classroom: {}", "✗".red(), e);
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn join(
    server: &str,
    config: &Config,
    room: String,
    participant: String,
    name: Option<String>,
    role: Role,
    material: Option<String>,
    devices: StaticDevices,
) {
    println!("{}", "Joining room...".cyan());
    println!("  Room: {}", room);
    println!("  Participant: {} ({})", participant, role);

    let archive = if role == Role::Teacher {
        match sink_from_config(&config.archive) {
            Ok(sink) => Some(Arc::new(ArchiveQueue::new(sink, config.archive.retry_count))),
            Err(e) => {
                println!("{} Archive disabled: {}", "⚠".yellow(), e);
                None
            }
        }
    } else {
        None
    };

    let Some(mut classroom) = open_classroom(
        server,
        config,
        &room,
        &participant,
        name.as_deref(),
        role,
        material,
        devices,
        archive.clone(),
    )
    .await
    else {
        return;
    };

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (views_tx, mut views_rx) = watch::channel(classroom.view());
    let runner = tokio::spawn(async move {
        classroom.run(commands_rx, Some(views_tx)).await;
    });

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_status = views_rx.borrow().status;

    loop {
        tokio::select! {
            changed = views_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = views_rx.borrow().status;
                if status != last_status {
                    println!("{} Session is now {}", "◀".green(), status.to_string().bold());
                    last_status = status;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    let _ = commands_tx.send(ClassroomCommand::Leave);
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    "help" => print_help(),
                    "status" => print_status(&views_rx.borrow()),
                    "roster" => print_roster(&views_rx.borrow()),
                    _ => match parse_command(line) {
                        Ok(commands) => {
                            let leaving = commands.contains(&ClassroomCommand::Leave);
                            for command in commands {
                                let _ = commands_tx.send(command);
                            }
                            if leaving {
                                break;
                            }
                        }
                        Err(e) => println!("{} {}", "✗".red(), e),
                    },
                }
            }
        }
    }

    drop(commands_tx);
    if let Err(e) = runner.await {
        println!("{} Classroom task failed: {}", "✗".red(), e);
    }
    if let Some(queue) = archive.and_then(|queue| Arc::try_unwrap(queue).ok()) {
        queue.shutdown().await;
    }
    println!("{} Left room {}", "✓".green(), room);
}

fn print_help() {
    println!("\n{}", "Commands:".bold());
    println!("  start | end                 start or end the class (teacher)");
    println!("  mic | cam | hand            toggle microphone, camera, raised hand");
    println!("  record | stop-record        recording (teacher)");
    println!("  draw x,y x,y ...            draw a stroke in surface pixels");
    println!("  tool pen|highlighter|eraser");
    println!("  color #rrggbb");
    println!("  width <fraction>");
    println!("  clear                       clear the drawing surface");
    println!("  roster | status | leave\n");
}

fn print_status(view: &ClassroomView) {
    let status = match view.status {
        SessionStatus::Waiting => "waiting".yellow(),
        SessionStatus::Started => "started".green(),
        SessionStatus::Ended => "ended".red(),
    };
    println!("  Status: {}", status);
    println!("  Channel: {:?}", view.channel);
    println!("  Media: {:?} (joined: {})", view.media_mode, view.media_joined);
    println!("  Drawing enabled: {}", view.drawing_enabled);
    println!("  Strokes: {}", view.stroke_count);
    println!("  Recording: {}", view.recording);
    if let Some(material) = &view.material {
        println!("  Material: {}", material.0);
    }
    if let Some(error) = &view.last_error {
        println!("  Last error: {}", error.red());
    }
}

fn print_roster(view: &ClassroomView) {
    for participant in &view.roster {
        let mut flags = Vec::new();
        if participant.is_muted {
            flags.push("muted");
        }
        if participant.is_camera_off {
            flags.push("camera off");
        }
        if participant.hand_raised {
            flags.push("✋");
        }
        if participant.is_recording {
            flags.push("● rec");
        }
        println!(
            "  {} {} [{}] {} {}",
            "•".cyan(),
            participant.display_name.bold(),
            participant.role,
            participant.connection_quality,
            flags.join(", ")
        );
    }
}

fn parse_point(token: &str) -> Result<(f32, f32), String> {
    let (x, y) = token
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got {token:?}"))?;
    let x = x.trim().parse().map_err(|_| format!("invalid x in {token:?}"))?;
    let y = y.trim().parse().map_err(|_| format!("invalid y in {token:?}"))?;
    Ok((x, y))
}

fn parse_command(line: &str) -> Result<Vec<ClassroomCommand>, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let single = |command: ClassroomCommand| -> Result<Vec<ClassroomCommand>, String> { Ok(vec![command]) };
    match verb {
        "start" => single(ClassroomCommand::StartClass),
        "end" => single(ClassroomCommand::EndClass),
        "mic" => single(ClassroomCommand::ToggleMicrophone),
        "cam" => single(ClassroomCommand::ToggleCamera),
        "hand" => single(ClassroomCommand::RaiseHand),
        "record" => single(ClassroomCommand::StartRecording),
        "stop-record" => single(ClassroomCommand::StopRecording),
        "clear" => single(ClassroomCommand::Clear),
        "leave" => single(ClassroomCommand::Leave),
        "tool" => {
            let tool: Tool = args.first().ok_or("usage: tool pen|highlighter|eraser")?.parse()?;
            single(ClassroomCommand::SetTool(tool))
        }
        "color" => {
            let hex = args.first().ok_or("usage: color #rrggbb")?;
            let color = Color::from_hex(hex).ok_or_else(|| format!("invalid color {hex:?}"))?;
            single(ClassroomCommand::SetColor(color))
        }
        "width" => {
            let width: f32 = args
                .first()
                .ok_or("usage: width <fraction>")?
                .parse()
                .map_err(|_| "width must be a number".to_string())?;
            single(ClassroomCommand::SetWidth(width))
        }
        "draw" => {
            let points = args.iter().map(|t| parse_point(t)).collect::<Result<Vec<_>, _>>()?;
            let Some(((x, y), rest)) = points.split_first() else {
                return Err("usage: draw x,y x,y ...".to_string());
            };
            let mut commands = vec![ClassroomCommand::PointerDown { x: *x, y: *y }];
            commands.extend(rest.iter().map(|(x, y)| ClassroomCommand::PointerMove { x: *x, y: *y }));
            commands.push(ClassroomCommand::PointerUp);
            Ok(commands)
        }
        other => Err(format!("unknown command {other:?}, type 'help'")),
    }
}

async fn wait_for<F>(classroom: &mut Classroom, what: &str, predicate: F) -> bool
where
    F: Fn(&ClassroomView) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        classroom.pump().await;
        if predicate(&classroom.view()) {
            println!("{} {}", "✓".green(), what);
            return true;
        }
        if Instant::now() >= deadline {
            println!("{} {} (timed out)", "✗".red(), what);
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

async fn validate(server: &str, config: &Config) -> bool {
    println!("{}", "Running two-client validation...".cyan());
    let room = format!("validate-{}", uuid::Uuid::new_v4().simple());

    let Some(mut teacher) = open_classroom(
        server,
        config,
        &room,
        "validate-teacher",
        Some("Validation Teacher"),
        Role::Teacher,
        None,
        StaticDevices::none(),
        None,
    )
    .await
    else {
        return false;
    };
    let mut passed = wait_for(&mut teacher, "Teacher created the room", |v| {
        v.channel == classroom_sync::channel::ChannelState::Connected && v.can_start_session
    })
    .await;

    let Some(mut student) = open_classroom(
        server,
        config,
        &room,
        "validate-student",
        Some("Validation Student"),
        Role::Student,
        None,
        StaticDevices::none(),
        None,
    )
    .await
    else {
        teacher.dispose().await;
        return false;
    };
    passed &= wait_for(&mut student, "Student is waiting for the teacher", |v| v.is_waiting_for_teacher).await;
    passed &= wait_for(&mut teacher, "Teacher sees the student", |v| v.roster.len() == 2).await;

    if teacher.execute(ClassroomCommand::StartClass).await.is_err() {
        println!("{} Teacher could not start the class", "✗".red());
        passed = false;
    }
    passed &= wait_for(&mut student, "Student observed class start", |v| v.can_join_video).await;

    for command in [
        ClassroomCommand::PointerDown { x: 100.0, y: 100.0 },
        ClassroomCommand::PointerMove { x: 200.0, y: 150.0 },
        ClassroomCommand::PointerMove { x: 300.0, y: 120.0 },
        ClassroomCommand::PointerUp,
    ] {
        let _ = teacher.execute(command).await;
    }
    passed &= wait_for(&mut student, "Stroke replicated to student", |v| v.stroke_count == 1).await;

    let _ = student.execute(ClassroomCommand::RaiseHand).await;
    passed &= wait_for(&mut teacher, "Raised hand visible to teacher", |v| {
        v.roster.iter().any(|p| p.participant_id == "validate-student" && p.hand_raised)
    })
    .await;

    if teacher.execute(ClassroomCommand::EndClass).await.is_err() {
        println!("{} Teacher could not end the class", "✗".red());
        passed = false;
    }
    passed &= wait_for(&mut student, "Student observed class end", |v| {
        v.status == SessionStatus::Ended && !v.drawing_enabled
    })
    .await;

    student.dispose().await;
    teacher.dispose().await;

    if passed {
        println!("\n{}", "All validation steps passed".green().bold());
    } else {
        println!("\n{}", "Some validation steps failed".red().bold());
    }
    passed
}
