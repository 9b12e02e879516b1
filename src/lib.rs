//! Realmcore World Server Library
//!
//! This library provides the per-connection world session engine: opcode
//! dispatch, the inbound packet queue, anti-flood protection, asynchronous
//! query callbacks and the session lifecycle.
//!
//! ## Modules
//!
//! - `auth` - Account identity and the ban store seam
//! - `config` - Server configuration management
//! - `db` - Persistent store seam and query callbacks
//! - `error` - Error types and result definitions
//! - `game` - Player and handler seams, the world tick loop
//! - `net` - Packets, queueing, flood protection and sessions
//! - `protocol` - Opcode table and addon protocol

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{RealmError, Result};
pub use net::session::WorldSession;
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
