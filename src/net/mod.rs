//! Networking module
//!
//! This module handles the per-connection side of the world server:
//! - Byte buffers, packets and wire framing
//! - The inbound packet queue and its update filters
//! - Flood protection and producer-side throttling
//! - The world session and the registry of live sessions
//! - Connection lifecycle

pub mod buffer;
pub mod compression;
pub mod filter;
pub mod flood;
pub mod handler;
pub mod manager;
pub mod packet;
pub mod queue;
pub mod session;
pub mod transport;
