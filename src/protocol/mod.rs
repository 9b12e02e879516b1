//! Protocol module
//!
//! - Opcode identifiers and the opcode descriptor table
//! - Addon manifest decoding and the addon info reply

pub mod addon;
pub mod opcodes;
