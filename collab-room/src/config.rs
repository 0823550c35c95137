//! Server and room configuration.
//!
//! Defaults mirror the production timings: 5s autosave, 30s idle check,
//! 5 minute idle shutdown, 10s write/persist deadlines, 60s read deadline
//! with pings every 54s.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Timing and capacity knobs for a single room actor.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How often the room checks whether the log advanced past the last save
    pub autosave_interval: Duration,
    /// How often the room evaluates idleness
    pub idle_check_interval: Duration,
    /// Inactivity after which a dirty room persists on the idle check
    pub idle_save_after: Duration,
    /// Inactivity (with zero connections) after which the room drains
    pub idle_shutdown_after: Duration,
    /// Upper bound for a single load/save call against the store
    pub persist_timeout: Duration,
    /// Capacity of the room's inbound event queue
    pub event_capacity: usize,
    /// Compact the update log once it holds this many blobs (None = never)
    pub compact_after: Option<usize>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(5),
            idle_check_interval: Duration::from_secs(30),
            idle_save_after: Duration::from_secs(30),
            idle_shutdown_after: Duration::from_secs(5 * 60),
            persist_timeout: Duration::from_secs(10),
            event_capacity: 256,
            compact_after: None,
        }
    }
}

impl RoomConfig {
    /// Millisecond-scale timings so tests observe autosave and reaping quickly.
    pub fn for_testing() -> Self {
        Self {
            autosave_interval: Duration::from_millis(20),
            idle_check_interval: Duration::from_millis(25),
            idle_save_after: Duration::from_millis(50),
            idle_shutdown_after: Duration::from_millis(150),
            persist_timeout: Duration::from_secs(2),
            event_capacity: 64,
            compact_after: None,
        }
    }
}

/// WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection (messages beyond it are dropped)
    pub outbound_capacity: usize,
    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,
    /// Deadline for writing a single frame
    pub write_timeout: Duration,
    /// Read idle deadline, reset by every received frame
    pub pong_wait: Duration,
    /// Keepalive ping period (must be shorter than `pong_wait`)
    pub ping_interval: Duration,
    /// Persistence storage path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Accept connections without credentials as a fixed development user
    pub allow_dev_identity: bool,
    /// JSON file with users, tokens and document grants
    pub auth_file: Option<PathBuf>,
    /// Redis server shared by all instances (None = in-process backbone)
    pub redis_url: Option<String>,
    /// How long shutdown waits for rooms to save and terminate
    pub shutdown_timeout: Duration,
    /// Per-room settings
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            bind_addr: "127.0.0.1:8081".to_string(),
            outbound_capacity: 256,
            max_message_size: 512 * 1024,
            write_timeout: Duration::from_secs(10),
            pong_wait,
            ping_interval: pong_wait * 9 / 10,
            storage_path: None,
            allow_dev_identity: false,
            auth_file: None,
            redis_url: None,
            shutdown_timeout: Duration::from_secs(15),
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from environment variables on top of the defaults.
    ///
    /// Recognized: `COLLAB_BIND_ADDR`, `PORT` (binds `0.0.0.0:<port>` when no
    /// bind address is given), `COLLAB_STORAGE_PATH`, `COLLAB_DEV_IDENTITY`,
    /// `COLLAB_AUTH_FILE`, `REDIS_URL`, `COLLAB_AUTOSAVE_SECS`,
    /// `COLLAB_IDLE_SHUTDOWN_SECS`, `COLLAB_COMPACT_AFTER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] but with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        if let Some(path) = lookup("COLLAB_STORAGE_PATH") {
            if !path.is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }

        if let Some(flag) = lookup("COLLAB_DEV_IDENTITY") {
            config.allow_dev_identity = parse_flag("COLLAB_DEV_IDENTITY", &flag)?;
        }

        if let Some(path) = lookup("COLLAB_AUTH_FILE") {
            if !path.is_empty() {
                config.auth_file = Some(PathBuf::from(path));
            }
        }

        if let Some(url) = lookup("REDIS_URL") {
            if !url.trim().is_empty() {
                config.redis_url = Some(url.trim().to_string());
            }
        }

        if let Some(secs) = lookup("COLLAB_AUTOSAVE_SECS") {
            config.room.autosave_interval =
                Duration::from_secs(parse("COLLAB_AUTOSAVE_SECS", &secs)?);
        }

        if let Some(secs) = lookup("COLLAB_IDLE_SHUTDOWN_SECS") {
            config.room.idle_shutdown_after =
                Duration::from_secs(parse("COLLAB_IDLE_SHUTDOWN_SECS", &secs)?);
        }

        if let Some(count) = lookup("COLLAB_COMPACT_AFTER") {
            let count: usize = parse("COLLAB_COMPACT_AFTER", &count)?;
            config.room.compact_after = (count > 0).then_some(count);
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
