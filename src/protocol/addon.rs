//! Addon handshake codec
//!
//! The client announces its installed addons once, in the auth session
//! packet, as a zlib-compressed manifest:
//!
//! ```text
//! [u32 declared_len][zlib bytes]
//! declared_len bytes once inflated:
//! [u32 count] { [cstring name][u8 enabled][u32 crc][u32 reserved] } x count [u32 client_time]
//! ```
//!
//! The server answers with `SMSG_ADDON_INFO`, embedding the addon signing
//! key for every addon whose checksum differs from the stock one.
//!
//! Registered addon message prefixes (`CMSG_ADDON_REGISTERED_PREFIXES`) are
//! tracked here as well.

use std::io::Read;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flate2::read::ZlibDecoder;
use thiserror::Error;
use tracing::{debug, info};

use crate::net::buffer::{BufferError, ByteBuffer};
use crate::net::packet::WorldPacket;
use crate::protocol::opcodes::SMSG_ADDON_INFO;

/// Checksum shared by every addon shipped with the client
pub const STANDARD_ADDON_CRC: u32 = 0x4C1C776D;

/// Largest inflated manifest the server accepts
pub const MAX_ADDON_INFO_SIZE: u32 = 0xFFFFF;

/// State byte reported back for every announced addon
pub const DEFAULT_ADDON_STATE: u8 = 2;

/// Smallest possible manifest entry: empty name terminator, flag, crc, reserved
const MIN_ADDON_ENTRY_SIZE: usize = 1 + 1 + 4 + 4;

/// Above this many registered prefixes the client stops filtering addon messages
pub const REGISTERED_ADDON_PREFIX_SOFTCAP: usize = 64;

/// Key sent to clients whose addon checksums do not match the stock value
pub const ADDON_PUBLIC_KEY: [u8; 256] = [
    0xC3, 0x5B, 0x50, 0x84, 0xB9, 0x3E, 0x32, 0x42, 0x8C, 0xD0, 0xC7, 0x48, 0xFA, 0x0E, 0x5D, 0x54,
    0x5A, 0xA3, 0x0E, 0x14, 0xBA, 0x9E, 0x0D, 0xB9, 0x5D, 0x8B, 0xEE, 0xB6, 0x84, 0x93, 0x45, 0x75,
    0xFF, 0x31, 0xFE, 0x2F, 0x64, 0x3F, 0x3D, 0x6D, 0x07, 0xD9, 0x44, 0x9B, 0x40, 0x85, 0x59, 0x34,
    0x4E, 0x10, 0xE1, 0xE7, 0x43, 0x69, 0xEF, 0x7C, 0x16, 0xFC, 0xB4, 0xED, 0x1B, 0x95, 0x28, 0xA8,
    0x23, 0x76, 0x51, 0x31, 0x57, 0x30, 0x2B, 0x79, 0x08, 0x50, 0x10, 0x1C, 0x4A, 0x1A, 0x2C, 0xC8,
    0x8B, 0x8F, 0x05, 0x2D, 0x22, 0x3D, 0xDB, 0x5A, 0x24, 0x7A, 0x0F, 0x13, 0x50, 0x37, 0x8F, 0x5A,
    0xCC, 0x9E, 0x04, 0x44, 0x0E, 0x87, 0x01, 0xD4, 0xA3, 0x15, 0x94, 0x16, 0x34, 0xC6, 0xC2, 0xC3,
    0xFB, 0x49, 0xFE, 0xE1, 0xF9, 0xDA, 0x8C, 0x50, 0x3C, 0xBE, 0x2C, 0xBB, 0x57, 0xED, 0x46, 0xB9,
    0xAD, 0x8B, 0xC6, 0xDF, 0x0E, 0xD6, 0x0F, 0xBE, 0x80, 0xB3, 0x8B, 0x1E, 0x77, 0xCF, 0xAD, 0x22,
    0xCF, 0xB7, 0x4B, 0xCF, 0xFB, 0xF0, 0x6B, 0x11, 0x45, 0x2D, 0x7A, 0x81, 0x18, 0xF2, 0x92, 0x7E,
    0x98, 0x56, 0x5D, 0x5E, 0x69, 0x72, 0x0A, 0x0D, 0x03, 0x0A, 0x85, 0xA2, 0x85, 0x9C, 0xCB, 0xFB,
    0x56, 0x6E, 0x8F, 0x44, 0xBB, 0x8F, 0x02, 0x22, 0x68, 0x63, 0x97, 0xBC, 0x85, 0xBA, 0xA8, 0xF7,
    0xB5, 0x40, 0x68, 0x3C, 0x77, 0x86, 0x6F, 0x4B, 0xD7, 0x88, 0xCA, 0x8A, 0xD7, 0xCE, 0x36, 0xF0,
    0x45, 0x6E, 0xD5, 0x64, 0x79, 0x0F, 0x17, 0xFC, 0x64, 0xDD, 0x10, 0x6F, 0xF3, 0xF5, 0xE0, 0xA6,
    0xC3, 0xFB, 0x1B, 0x8C, 0x29, 0xEF, 0x8E, 0xE5, 0x34, 0xCB, 0xD1, 0x2A, 0xCE, 0x79, 0xC3, 0x9A,
    0x0D, 0x36, 0xEA, 0x01, 0xE0, 0xAA, 0x91, 0x20, 0x54, 0xF0, 0x72, 0xD8, 0x1E, 0xC7, 0x89, 0xD2
];

/// Reasons a client addon manifest is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddonError {
    #[error("addon manifest missing")]
    Missing,

    #[error("addon manifest declared empty")]
    Empty,

    #[error("addon info too big, size {size}")]
    TooLarge { size: u32 },

    #[error("addon packet uncompress error: {0}")]
    Decompress(String),

    #[error("addon manifest inflated to {actual} bytes, declared {declared}")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("addon manifest claims {count} entries but only {available} fit")]
    TooManyEntries { count: u32, available: usize },

    #[error("addon manifest truncated: {0}")]
    Truncated(#[from] BufferError),
}

/// One addon announced by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonInfo {
    pub name: String,
    pub enabled: u8,
    pub crc: u32,
    pub state: u8,
    pub use_public_key_or_crc: bool,
}

impl AddonInfo {
    pub fn new(name: impl Into<String>, enabled: u8, crc: u32) -> Self {
        Self {
            name: name.into(),
            enabled,
            crc,
            state: DEFAULT_ADDON_STATE,
            use_public_key_or_crc: true,
        }
    }

    /// Whether the reply must carry the signing key for this addon
    #[inline]
    pub fn needs_public_key(&self) -> bool {
        self.use_public_key_or_crc && self.crc != STANDARD_ADDON_CRC
    }
}

/// Decoded client manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddonManifest {
    pub addons: Vec<AddonInfo>,
    /// Client clock, absent on clients that omit it
    pub client_time: Option<u32>,
    /// Inflated bytes left unread after the last field
    pub unread: usize,
}

/// Decode the addon manifest starting at the buffer's read position
///
/// Consumes the rest of the buffer. The result is all-or-nothing: any
/// malformed entry rejects the whole manifest.
pub fn decode_manifest(data: &mut ByteBuffer) -> Result<AddonManifest, AddonError> {
    if data.remaining() < 4 {
        data.rfinish();
        return Err(AddonError::Missing);
    }

    let size = data.read_u32()?;
    if size == 0 {
        data.rfinish();
        return Err(AddonError::Empty);
    }
    if size > MAX_ADDON_INFO_SIZE {
        data.rfinish();
        return Err(AddonError::TooLarge { size });
    }

    let compressed = data.read_remaining();
    let mut inflated = Vec::with_capacity(size as usize);
    ZlibDecoder::new(compressed)
        .take(u64::from(size) + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| AddonError::Decompress(e.to_string()))?;

    if inflated.len() != size as usize {
        return Err(AddonError::SizeMismatch {
            declared: size,
            actual: inflated.len(),
        });
    }

    let mut manifest = ByteBuffer::from(inflated);
    let count = manifest.read_u32()?;
    let available = manifest.remaining() / MIN_ADDON_ENTRY_SIZE;
    if count as usize > available {
        return Err(AddonError::TooManyEntries { count, available });
    }

    let mut addons = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = manifest.read_cstring()?;
        let enabled = manifest.read_u8()?;
        let crc = manifest.read_u32()?;
        let reserved = manifest.read_u32()?;

        debug!(
            target: "addon",
            name = %name,
            enabled,
            crc = format_args!("{:#x}", crc),
            reserved = format_args!("{:#x}", reserved),
            "Addon announced"
        );
        addons.push(AddonInfo::new(name, enabled, crc));
    }

    let client_time = manifest.read_u32().ok();

    Ok(AddonManifest {
        addons,
        client_time,
        unread: manifest.remaining(),
    })
}

/// Build the `SMSG_ADDON_INFO` reply for the announced addons
pub fn encode_addon_info(addons: &[AddonInfo]) -> WorldPacket {
    let mut data = WorldPacket::new(SMSG_ADDON_INFO, 4 + addons.len() * 8);

    for addon in addons {
        data.write_u8(addon.state);
        data.write_u8(u8::from(addon.use_public_key_or_crc));

        if addon.use_public_key_or_crc {
            let use_key = addon.needs_public_key();
            data.write_u8(u8::from(use_key));
            if use_key {
                info!(
                    target: "addon",
                    name = %addon.name,
                    crc = format_args!("{:#x}", addon.crc),
                    expected = format_args!("{:#x}", STANDARD_ADDON_CRC),
                    "Addon CRC does not match the standard value, sending public key"
                );
                data.write_bytes(&ADDON_PUBLIC_KEY);
            }
            data.write_u32(0);
        }

        // No update URL
        data.write_u8(0);
    }

    data.write_u32(0);
    data
}

/// Outcome of checking an addon against previously seen checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonCheck {
    Matched,
    Mismatched { known: u32 },
    Learned,
}

/// Checksums learned from clients, keyed by addon name
#[derive(Debug, Default)]
pub struct AddonRegistry {
    known: DashMap<String, u32>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare against the learned checksum, learning it on first sight
    pub fn check(&self, addon: &AddonInfo) -> AddonCheck {
        match self.known.entry(addon.name.clone()) {
            Entry::Occupied(entry) => {
                let known = *entry.get();
                if known == addon.crc {
                    AddonCheck::Matched
                } else {
                    AddonCheck::Mismatched { known }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(addon.crc);
                AddonCheck::Learned
            }
        }
    }

    pub fn known_crc(&self, name: &str) -> Option<u32> {
        self.known.get(name).map(|crc| *crc)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Addon message prefixes the client asked to receive
#[derive(Debug, Clone, Default)]
pub struct AddonPrefixFilter {
    prefixes: Vec<String>,
    filtering: bool,
}

impl AddonPrefixFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every registered prefix
    pub fn clear(&mut self) {
        self.prefixes.clear();
    }

    /// Parse a `CMSG_ADDON_REGISTERED_PREFIXES` body and append its prefixes
    ///
    /// `[25 bits count] { [5 bits len] } x count, then the prefix bytes`
    pub fn register(&mut self, packet: &mut ByteBuffer) -> Result<(), BufferError> {
        let count = packet.read_bits(25)? as usize;
        if count > REGISTERED_ADDON_PREFIX_SOFTCAP {
            // The client stops filtering altogether past the softcap
            self.filtering = false;
            packet.rfinish();
            return Ok(());
        }

        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            lengths.push(packet.read_bits(5)? as usize);
        }

        let mut prefixes = Vec::with_capacity(count);
        for length in lengths {
            prefixes.push(packet.read_string(length)?);
        }
        self.prefixes.extend(prefixes);

        self.filtering = self.prefixes.len() <= REGISTERED_ADDON_PREFIX_SOFTCAP;
        Ok(())
    }

    /// Whether addon messages with this prefix should reach the client
    pub fn is_registered(&self, prefix: &str) -> bool {
        if !self.filtering {
            return true;
        }
        self.prefixes.iter().any(|p| p == prefix)
    }

    pub fn is_filtering(&self) -> bool {
        self.filtering
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}
