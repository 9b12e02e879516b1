//! Error handling module
//!
//! Defines custom error types for the Realmcore server.

use std::io;

use thiserror::Error;

/// Main error type for the Realmcore server
#[derive(Error, Debug)]
pub enum RealmError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Session not found for account {0}")]
    SessionNotFound(u32),

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Protocol-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet size: {0}")]
    InvalidPacketSize(usize),

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected opcode {opcode:#06x} during {state}")]
    UnexpectedOpcode { state: String, opcode: u16 },

    #[error("Duplicate opcode registration: {0:#06x}")]
    DuplicateOpcode(u16),

    #[error("Reserved opcode value: {0:#06x}")]
    ReservedOpcode(u16),

    #[error("Unknown opcode name: {0}")]
    UnknownOpcodeName(String),
}

/// Persistent store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Connection to the store was lost")]
    ConnectionLost,

    #[error("Unexpected column {index} type: expected {expected}")]
    ColumnType { index: usize, expected: &'static str },
}

/// Result type alias for Realmcore operations
pub type Result<T> = std::result::Result<T, RealmError>;

impl From<String> for RealmError {
    fn from(s: String) -> Self {
        RealmError::Internal(s)
    }
}

impl From<&str> for RealmError {
    fn from(s: &str) -> Self {
        RealmError::Internal(s.to_string())
    }
}
