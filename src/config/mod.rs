use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClassroomError, Result};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub struct Config {
    pub server: ServerConfig,
    pub channel: ChannelConfig,
    pub presence: PresenceConfig,
    pub webrtc: WebRtcConfig,
    pub recording: RecordingConfig,
    pub archive: ArchiveConfig,
    pub identity: IdentityConfig,
}

/// Relay bind address.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Client side of the session channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub relay_url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Consecutive failed attempts before `Disconnected` is surfaced.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat: Duration,
    pub grace: Duration,
}

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// HTTP sink base URL; the file sink is used when unset.
    pub url: Option<String>,
    pub dir: PathBuf,
    pub timeout: Duration,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub url: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_millis(8000),
            failure_threshold: 3,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(5),
            grace: Duration::from_secs(15),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("./recordings"),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url: None,
            dir: PathBuf::from("./archive"),
            timeout: Duration::from_secs(10),
            retry_count: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let channel_defaults = ChannelConfig::default();
        let presence_defaults = PresenceConfig::default();
        let archive_defaults = ArchiveConfig::default();

        let stun_server = lookup("STUN_SERVER_URL").unwrap_or_else(|| DEFAULT_STUN_SERVER.to_string());
        let mut turn_servers = Vec::new();
        if let (Some(url), Some(username), Some(credential)) = (
            lookup("TURN_SERVER_URL"),
            lookup("TURN_USERNAME"),
            lookup("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![url],
                username,
                credential,
            });
        }

        Ok(Self {
            server: ServerConfig {
                host: lookup("RELAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_or(&lookup, "RELAY_PORT", 8080)?,
            },
            channel: ChannelConfig {
                relay_url: lookup("RELAY_URL").unwrap_or(channel_defaults.relay_url),
                reconnect_initial: Duration::from_millis(parse_or(&lookup, "CHANNEL_RECONNECT_INITIAL_MS", 250)?),
                reconnect_max: Duration::from_millis(parse_or(&lookup, "CHANNEL_RECONNECT_MAX_MS", 8000)?),
                failure_threshold: parse_or(&lookup, "CHANNEL_FAILURE_THRESHOLD", channel_defaults.failure_threshold)?,
            },
            presence: PresenceConfig {
                heartbeat: Duration::from_secs(parse_or(
                    &lookup,
                    "PRESENCE_HEARTBEAT_SECS",
                    presence_defaults.heartbeat.as_secs(),
                )?),
                grace: Duration::from_secs(parse_or(&lookup, "PRESENCE_GRACE_SECS", presence_defaults.grace.as_secs())?),
            },
            webrtc: WebRtcConfig {
                stun_servers: vec![stun_server],
                turn_servers,
            },
            recording: RecordingConfig {
                enabled: parse_or(&lookup, "RECORDING_ENABLED", true)?,
                output_dir: lookup("RECORDING_OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./recordings")),
            },
            archive: ArchiveConfig {
                url: lookup("ARCHIVE_URL").filter(|v| !v.is_empty()),
                dir: lookup("ARCHIVE_DIR").map(PathBuf::from).unwrap_or(archive_defaults.dir),
                timeout: Duration::from_secs(parse_or(&lookup, "ARCHIVE_TIMEOUT_SECS", 10)?),
                retry_count: parse_or(&lookup, "ARCHIVE_RETRY_COUNT", archive_defaults.retry_count)?,
            },
            identity: IdentityConfig {
                url: lookup("IDENTITY_URL").filter(|v| !v.is_empty()),
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ClassroomError::Configuration(format!("{key} has invalid value {raw:?}"))),
    }
}
