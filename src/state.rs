//! Application state module
//!
//! Contains the shared state used across all server connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::auth::InMemoryAccountBans;
use crate::config::ServerConfig;
use crate::db::MemoryDatabase;
use crate::error::{RealmError, Result};
use crate::game::handlers::AccountHandlers;
use crate::game::world::{GameWorld, WorldSettings};
use crate::net::flood::{FloodSettings, ThrottleSettings};
use crate::net::manager::SessionManager;
use crate::net::session::{SessionServices, SessionSettings};
use crate::protocol::addon::AddonRegistry;
use crate::protocol::opcodes::{OpcodeTable, OpcodeTableBuilder};

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Collaborators handed to every new session
    pub services: SessionServices,
    /// Registry of live sessions
    pub session_manager: Arc<SessionManager>,
    /// World tick loop
    pub world: Arc<GameWorld>,
    /// Account names and issued bans
    pub bans: Arc<InMemoryAccountBans>,
    /// Persistent store
    pub database: Arc<MemoryDatabase>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create the application state with in-memory account and character stores
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let opcodes = Arc::new(Self::create_opcode_table(&config)?);
        let settings = Arc::new(Self::create_session_settings(&config, &opcodes)?);

        info!(
            opcodes = opcodes.len(),
            flood_policy = ?settings.flood.policy,
            throttled = settings.throttle.limits.len(),
            "Opcode table ready"
        );

        let bans = Arc::new(InMemoryAccountBans::new());
        let database = Arc::new(MemoryDatabase::new());

        let services = SessionServices {
            opcodes,
            handlers: Arc::new(AccountHandlers),
            database: database.clone(),
            bans: bans.clone(),
            addons: Arc::new(AddonRegistry::new()),
            settings,
        };

        let session_manager = Arc::new(SessionManager::new(config.max_sessions));
        let world = Arc::new(GameWorld::new(
            Self::create_world_settings(&config),
            Arc::clone(&session_manager),
        ));

        Ok(Self {
            config,
            services,
            session_manager,
            world,
            bans,
            database,
            shutdown_tx,
        })
    }

    /// Build the opcode table with configured flood ceilings
    fn create_opcode_table(config: &ServerConfig) -> Result<OpcodeTable> {
        let mut builder = OpcodeTableBuilder::standard()?;
        for (name, &limit) in &config.flood.overrides {
            builder.set_flood_limit(name, limit)?;
        }
        Ok(builder.build())
    }

    /// Create session settings from server config
    fn create_session_settings(config: &ServerConfig, opcodes: &OpcodeTable) -> Result<SessionSettings> {
        let ban_duration = match config.flood.ban_duration_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let mut limits = HashMap::with_capacity(config.throttle.limits.len());
        for (name, &limit) in &config.throttle.limits {
            let descriptor = opcodes
                .by_name(name)
                .ok_or_else(|| RealmError::Config(format!("Unknown throttled opcode: {}", name)))?;
            limits.insert(descriptor.opcode, limit);
        }

        Ok(SessionSettings {
            idle_timeout_secs: config.session.idle_timeout_secs,
            slow_opcode_threshold_ms: config.session.slow_opcode_threshold_ms,
            logout_delay_secs: config.session.logout_delay_secs,
            max_packet_deferrals: config.session.max_packet_deferrals,
            compression_level: config.session.compression_level,
            flood: Arc::new(FloodSettings {
                policy: config.flood.policy,
                ban_mode: config.flood.ban_mode,
                ban_duration,
            }),
            throttle: Arc::new(ThrottleSettings {
                limits,
                log_interval_secs: config.throttle.log_interval_secs,
            }),
        })
    }

    /// Create world settings from server config
    fn create_world_settings(config: &ServerConfig) -> WorldSettings {
        WorldSettings::new(config.realm_id)
            .with_name(config.server_name.clone())
            .with_tick_rate(config.tick_rate_ms)
    }
}
