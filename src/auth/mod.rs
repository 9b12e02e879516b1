//! Account and ban service module
//!
//! The session engine never stores accounts or bans itself. It identifies
//! the account it serves through [`AccountInfo`] and reaches the ban store
//! through the [`AccountBans`] trait. [`InMemoryAccountBans`] backs the trait
//! for development servers and tests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Account security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AccountType {
    #[default]
    Player,
    Moderator,
    GameMaster,
    Administrator,
}

impl AccountType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => AccountType::Player,
            1 => AccountType::Moderator,
            2 => AccountType::GameMaster,
            _ => AccountType::Administrator,
        }
    }
}

/// Identity of the account a session serves, fixed at authentication
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub id: u32,
    pub security: AccountType,
    pub expansion: u8,
    pub locale: u32,
}

impl AccountInfo {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            security: AccountType::Player,
            expansion: 0,
            locale: 0,
        }
    }
}

/// What a ban targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanMode {
    Account,
    /// No character-level ban exists; applied as an account ban
    Character,
    Ip,
}

impl BanMode {
    /// The mode actually applied by the ban store
    pub fn effective(self) -> Self {
        match self {
            BanMode::Character => BanMode::Account,
            other => other,
        }
    }
}

/// A ban issued by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRequest {
    pub mode: BanMode,
    /// Account name or remote address, depending on `mode`
    pub target: String,
    /// `None` bans permanently
    pub duration: Option<Duration>,
    pub reason: String,
    pub author: String,
}

/// Ban store and account name lookup
pub trait AccountBans: Send + Sync {
    /// Resolve an account's login name
    fn account_name(&self, account_id: u32) -> Option<String>;

    /// Record a ban; returns whether the store accepted it
    fn ban(&self, request: BanRequest) -> bool;
}

/// A ban recorded by [`InMemoryAccountBans`]
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub request: BanRequest,
    pub issued_at: DateTime<Utc>,
}

/// In-memory account names and ban list
#[derive(Debug, Default)]
pub struct InMemoryAccountBans {
    names: DashMap<u32, String>,
    bans: RwLock<Vec<BanRecord>>,
}

impl InMemoryAccountBans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_account(&self, account_id: u32, name: &str) {
        self.names.insert(account_id, name.to_uppercase());
    }

    pub fn bans(&self) -> Vec<BanRecord> {
        self.bans.read().clone()
    }

    /// Whether a name or address is under an active ban
    pub fn is_banned(&self, target: &str) -> bool {
        let now = Utc::now();
        self.bans.read().iter().any(|record| {
            record.request.target == target
                && match record.request.duration {
                    None => true,
                    Some(duration) => chrono::Duration::from_std(duration)
                        .map(|d| record.issued_at + d > now)
                        .unwrap_or(true),
                }
        })
    }
}

impl AccountBans for InMemoryAccountBans {
    fn account_name(&self, account_id: u32) -> Option<String> {
        self.names.get(&account_id).map(|name| name.clone())
    }

    fn ban(&self, request: BanRequest) -> bool {
        if request.target.is_empty() {
            warn!(mode = ?request.mode, "Refusing ban without a target");
            return false;
        }
        info!(
            mode = ?request.mode,
            target = %request.target,
            duration = ?request.duration,
            reason = %request.reason,
            author = %request.author,
            "Ban recorded"
        );
        self.bans.write().push(BanRecord {
            request,
            issued_at: Utc::now(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str, duration: Option<Duration>) -> BanRequest {
        BanRequest {
            mode: BanMode::Account,
            target: target.to_string(),
            duration,
            reason: "test".to_string(),
            author: "tests".to_string(),
        }
    }

    #[test]
    fn test_character_ban_degrades_to_account() {
        assert_eq!(BanMode::Character.effective(), BanMode::Account);
        assert_eq!(BanMode::Ip.effective(), BanMode::Ip);
    }

    #[test]
    fn test_account_names() {
        let bans = InMemoryAccountBans::new();
        bans.register_account(7, "player");
        assert_eq!(bans.account_name(7), Some("PLAYER".to_string()));
        assert_eq!(bans.account_name(8), None);
    }

    #[test]
    fn test_ban_recording() {
        let bans = InMemoryAccountBans::new();
        assert!(bans.ban(request("PLAYER", None)));
        assert!(!bans.ban(request("", None)));

        assert_eq!(bans.bans().len(), 1);
        assert!(bans.is_banned("PLAYER"));
        assert!(!bans.is_banned("OTHER"));
    }

    #[test]
    fn test_expired_ban() {
        let bans = InMemoryAccountBans::new();
        bans.ban(request("10.0.0.1", Some(Duration::from_secs(0))));
        assert!(!bans.is_banned("10.0.0.1"));
    }

    #[test]
    fn test_account_type_from_u8() {
        assert_eq!(AccountType::from_u8(0), AccountType::Player);
        assert_eq!(AccountType::from_u8(2), AccountType::GameMaster);
        assert_eq!(AccountType::from_u8(9), AccountType::Administrator);
    }
}
