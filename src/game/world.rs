//! World module
//!
//! Drives the world tick loop. Each tick runs, in order:
//! - the map update: map-safe packets of every session, in parallel
//! - the world update: everything else, plus logout and session teardown

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::net::manager::SessionManager;

/// Default world update interval in milliseconds
pub const TICK_RATE_MS: u64 = 50;

/// World settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// Realm ID
    pub realm_id: u32,
    /// Realm name
    pub name: String,
    /// Tick rate in milliseconds
    pub tick_rate_ms: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            realm_id: 1,
            name: "Realmcore".to_string(),
            tick_rate_ms: TICK_RATE_MS,
        }
    }
}

impl WorldSettings {
    pub fn new(realm_id: u32) -> Self {
        Self {
            realm_id,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tick_rate(mut self, tick_rate_ms: u64) -> Self {
        self.tick_rate_ms = tick_rate_ms.max(1);
        self
    }
}

/// World state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    Initializing,
    Running,
    /// Shutdown countdown active
    ShuttingDown,
    Stopped,
}

impl WorldState {
    /// Check if the world is accepting new connections
    pub fn accepting_connections(&self) -> bool {
        matches!(self, WorldState::Running)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, WorldState::Running | WorldState::ShuttingDown)
    }
}

/// Realm world: owns the tick loop over the session registry
pub struct GameWorld {
    pub settings: WorldSettings,
    state: RwLock<WorldState>,
    tick: AtomicU64,
    running: AtomicBool,
    start_time: RwLock<Option<Instant>>,
    /// Ticks until shutdown (0 = none scheduled)
    shutdown_countdown: AtomicU64,
    sessions: Arc<SessionManager>,
}

impl GameWorld {
    pub fn new(settings: WorldSettings, sessions: Arc<SessionManager>) -> Self {
        info!(
            realm_id = settings.realm_id,
            name = %settings.name,
            "Creating game world"
        );

        Self {
            settings,
            state: RwLock::new(WorldState::Initializing),
            tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
            start_time: RwLock::new(None),
            shutdown_countdown: AtomicU64::new(0),
            sessions,
        }
    }

    pub fn state(&self) -> WorldState {
        *self.state.read()
    }

    pub fn set_state(&self, new_state: WorldState) {
        let mut state = self.state.write();
        let old_state = *state;
        *state = new_state;
        info!(
            old_state = ?old_state,
            new_state = ?new_state,
            "World state changed"
        );
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Stop the world after `ticks` more ticks
    pub fn start_shutdown(&self, ticks: u64) {
        self.shutdown_countdown.store(ticks.max(1), Ordering::SeqCst);
        self.set_state(WorldState::ShuttingDown);
        info!(ticks, "Shutdown countdown started");
    }

    pub fn cancel_shutdown(&self) {
        self.shutdown_countdown.store(0, Ordering::SeqCst);
        self.set_state(WorldState::Running);
        info!("Shutdown countdown cancelled");
    }

    /// Run the tick loop until shutdown
    pub async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        info!(
            realm_id = self.settings.realm_id,
            tick_rate_ms = self.settings.tick_rate_ms,
            "Starting game world"
        );

        self.running.store(true, Ordering::SeqCst);
        *self.start_time.write() = Some(Instant::now());
        self.set_state(WorldState::Running);

        let mut tick_interval = interval(Duration::from_millis(self.settings.tick_rate_ms));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if !self.is_running() {
                        break;
                    }

                    self.process_tick().await;

                    let countdown = self.shutdown_countdown.load(Ordering::SeqCst);
                    if countdown > 0 {
                        self.shutdown_countdown.store(countdown - 1, Ordering::SeqCst);
                        if countdown == 1 {
                            info!("Shutdown countdown reached zero");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.sessions.disconnect_all("Server shutdown");
        // One last world update runs the logouts
        self.process_tick().await;
        self.sessions.clear();

        self.running.store(false, Ordering::SeqCst);
        self.set_state(WorldState::Stopped);

        info!(
            total_ticks = self.tick(),
            uptime_secs = self.uptime_secs(),
            "Game world stopped"
        );
    }

    /// Run one map update followed by one world update
    async fn process_tick(&self) {
        let tick_num = self.tick.fetch_add(1, Ordering::SeqCst);

        if tick_num % 1000 == 0 {
            debug!(
                tick = tick_num,
                sessions = self.sessions.count(),
                queued = self.sessions.queued_count(),
                "Game tick milestone"
            );
        }

        let sessions = Arc::clone(&self.sessions);
        let result = tokio::task::spawn_blocking(move || {
            sessions.update_map_sessions();
            sessions.update_sessions();
        })
        .await;

        if let Err(e) = result {
            error!(tick = tick_num, error = %e, "Session update task failed");
        }
    }

    pub fn info(&self) -> String {
        format!(
            "Realm {} ({}) - {} sessions ({} queued) - Tick {} - Uptime {}s",
            self.settings.realm_id,
            self.settings.name,
            self.sessions.count(),
            self.sessions.queued_count(),
            self.tick(),
            self.uptime_secs()
        )
    }
}

impl std::fmt::Debug for GameWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameWorld")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("tick", &self.tick())
            .field("running", &self.is_running())
            .field("sessions", &self.sessions.count())
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}
