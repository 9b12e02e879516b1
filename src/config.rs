//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::BanMode;
use crate::net::flood::FloodPolicy;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Realm name
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Realm ID
    #[serde(default = "default_realm_id")]
    pub realm_id: u32,

    /// Address the world listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// World listener port (TCP)
    #[serde(default = "default_world_port")]
    pub world_port: u16,

    /// World update interval in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Sessions admitted before the login queue kicks in (0 = no queue)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Outbound frames buffered per connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer_frames: usize,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub flood: FloodConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,
}

/// Per-session tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds without traffic before a session is dropped (0 = never)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Handler time in milliseconds above which an opcode is recorded (0 = off)
    #[serde(default = "default_slow_opcode_threshold")]
    pub slow_opcode_threshold_ms: u64,

    #[serde(default = "default_logout_delay")]
    pub logout_delay_secs: u64,

    /// Times a packet may be deferred before it is dropped (0 = unlimited)
    #[serde(default = "default_max_deferrals")]
    pub max_packet_deferrals: u32,

    /// zlib level for compressed packets (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

/// Anti-flood configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    #[serde(default)]
    pub policy: FloodPolicy,

    #[serde(default = "default_ban_mode")]
    pub ban_mode: BanMode,

    /// Ban length in seconds (0 = permanent)
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,

    /// Per-second ceilings by opcode name, replacing the built-in ones
    #[serde(default)]
    pub overrides: BTreeMap<String, u32>,
}

/// Producer-side throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Packets per second kept, by opcode name
    #[serde(default)]
    pub limits: BTreeMap<String, u32>,

    #[serde(default = "default_throttle_log_interval")]
    pub log_interval_secs: u64,
}

// Default value functions
fn default_server_name() -> String {
    "Realmcore".to_string()
}

fn default_realm_id() -> u32 {
    1
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_world_port() -> u16 {
    8085
}

fn default_tick_rate() -> u64 {
    50
}

fn default_max_sessions() -> usize {
    0
}

fn default_send_buffer() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    900 // 15 minutes
}

fn default_slow_opcode_threshold() -> u64 {
    50
}

fn default_logout_delay() -> u64 {
    20
}

fn default_max_deferrals() -> u32 {
    100
}

fn default_compression_level() -> u32 {
    1
}

fn default_ban_mode() -> BanMode {
    BanMode::Account
}

fn default_ban_duration() -> u64 {
    300
}

fn default_throttle_log_interval() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            slow_opcode_threshold_ms: default_slow_opcode_threshold(),
            logout_delay_secs: default_logout_delay(),
            max_packet_deferrals: default_max_deferrals(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            policy: FloodPolicy::default(),
            ban_mode: default_ban_mode(),
            ban_duration_secs: default_ban_duration(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            limits: BTreeMap::new(),
            log_interval_secs: default_throttle_log_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            realm_id: default_realm_id(),
            bind_address: default_bind_address(),
            world_port: default_world_port(),
            tick_rate_ms: default_tick_rate(),
            max_sessions: default_max_sessions(),
            send_buffer_frames: default_send_buffer(),
            session: SessionConfig::default(),
            flood: FloodConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("REALMCORE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", config_path.display());
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REALMCORE_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("REALMCORE_REALM_ID") {
            if let Ok(id) = val.parse() {
                self.realm_id = id;
            }
        }
        if let Ok(val) = env::var("REALMCORE_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("REALMCORE_WORLD_PORT") {
            if let Ok(port) = val.parse() {
                self.world_port = port;
            }
        }
        if let Ok(val) = env::var("REALMCORE_MAX_SESSIONS") {
            if let Ok(max) = val.parse() {
                self.max_sessions = max;
            }
        }
        if let Ok(val) = env::var("REALMCORE_IDLE_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                self.session.idle_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("REALMCORE_FLOOD_POLICY") {
            match val.to_lowercase().as_str() {
                "log" => self.flood.policy = FloodPolicy::Log,
                "kick" => self.flood.policy = FloodPolicy::Kick,
                "ban" => self.flood.policy = FloodPolicy::Ban,
                other => tracing::warn!(value = other, "Ignoring unknown REALMCORE_FLOOD_POLICY"),
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.realm_id == 0 {
            anyhow::bail!("Realm ID must be non-zero");
        }

        if self.world_port == 0 {
            anyhow::bail!("World port must be non-zero");
        }

        if self.tick_rate_ms < 10 || self.tick_rate_ms > 1000 {
            anyhow::bail!("Tick rate must be between 10ms and 1000ms");
        }

        if self.send_buffer_frames == 0 {
            anyhow::bail!("Send buffer must hold at least one frame");
        }

        if self.session.compression_level > 9 {
            anyhow::bail!("Compression level must be between 0 and 9");
        }

        if let Some((name, _)) = self.throttle.limits.iter().find(|(_, &limit)| limit == 0) {
            anyhow::bail!("Throttle limit for {} must be non-zero", name);
        }

        Ok(())
    }

    /// Socket address of the world listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.world_port)
    }
}
