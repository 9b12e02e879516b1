//! Packet flood protection
//!
//! Two independent mechanisms guard a session against packet floods:
//!
//! - [`FloodProtection`] is consulted by the session drain loop for every
//!   packet about to be dispatched. Each opcode has a per-second ceiling; once
//!   it is exceeded the configured [`FloodPolicy`] decides between logging,
//!   kicking and banning.
//! - [`PacketThrottler`] sits on the producer side and silently discards
//!   packets before they are queued, for opcodes with a configured discard
//!   ceiling. Discards are aggregated and logged at most once per interval.
//!
//! Counters are owned by a single session and never shared across threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{AccountBans, BanMode, BanRequest};
use crate::net::transport::Transport;
use crate::protocol::opcodes::{opcode_name_for_logging, OpcodeDescriptor};

/// Reason given to the ban store for automatic flood bans
pub const FLOOD_BAN_REASON: &str = "DOS (Packet Flooding/Spoofing)";

/// Author recorded on automatic flood bans
pub const FLOOD_BAN_AUTHOR: &str = "Server: AutoDOS";

/// Action taken once an opcode exceeds its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloodPolicy {
    /// Keep admitting, emit a diagnostic
    Log,
    /// Disconnect the client
    #[default]
    Kick,
    /// Ban, then disconnect
    Ban,
}

/// Runtime flood protection settings shared by every session
#[derive(Debug, Clone)]
pub struct FloodSettings {
    pub policy: FloodPolicy,
    pub ban_mode: BanMode,
    /// `None` bans permanently
    pub ban_duration: Option<Duration>,
}

impl Default for FloodSettings {
    fn default() -> Self {
        Self {
            policy: FloodPolicy::Kick,
            ban_mode: BanMode::Account,
            ban_duration: Some(Duration::from_secs(300)),
        }
    }
}

/// Per-opcode counter for the current one-second window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounter {
    pub last_receive_time: u64,
    pub amount: u32,
}

/// Decision for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    Admit,
    Reject,
}

impl FloodVerdict {
    #[inline]
    pub fn is_admit(self) -> bool {
        matches!(self, FloodVerdict::Admit)
    }
}

/// Session identity and collaborators the policy may act on
pub struct FloodContext<'a> {
    pub account_id: u32,
    pub transport: &'a dyn Transport,
    pub bans: &'a dyn AccountBans,
}

/// Per-session anti-flood state
#[derive(Debug)]
pub struct FloodProtection {
    settings: Arc<FloodSettings>,
    counters: HashMap<u16, PacketCounter>,
}

impl FloodProtection {
    pub fn new(settings: Arc<FloodSettings>) -> Self {
        Self {
            settings,
            counters: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &FloodSettings {
        &self.settings
    }

    /// Current window counter for an opcode
    pub fn counter(&self, opcode: u16) -> Option<PacketCounter> {
        self.counters.get(&opcode).copied()
    }

    /// Count one invocation of `descriptor` at second `now` and decide
    pub fn evaluate(
        &mut self,
        descriptor: &OpcodeDescriptor,
        now: u64,
        ctx: &FloodContext<'_>,
    ) -> FloodVerdict {
        let max = descriptor.flood_limit;
        if max == 0 {
            return FloodVerdict::Admit;
        }

        let counter = self.counters.entry(descriptor.opcode).or_default();
        if counter.last_receive_time != now {
            counter.last_receive_time = now;
            counter.amount = 0;
        }

        counter.amount += 1;
        if counter.amount <= max {
            return FloodVerdict::Admit;
        }
        let amount = counter.amount;

        self.apply_policy(descriptor, amount, ctx)
    }

    fn apply_policy(
        &self,
        descriptor: &OpcodeDescriptor,
        amount: u32,
        ctx: &FloodContext<'_>,
    ) -> FloodVerdict {
        let address = ctx.transport.remote_address();
        let opcode = opcode_name_for_logging(descriptor.opcode);

        match self.settings.policy {
            FloodPolicy::Log => {
                info!(
                    target: "antidos",
                    account_id = ctx.account_id,
                    address = %address,
                    opcode = %opcode,
                    amount,
                    limit = descriptor.flood_limit,
                    "Packet flood detected, admitting (log policy)"
                );
                FloodVerdict::Admit
            }
            FloodPolicy::Kick => {
                warn!(
                    target: "network",
                    account_id = ctx.account_id,
                    address = %address,
                    opcode = %opcode,
                    amount,
                    "AntiDOS: Player kicked"
                );
                ctx.transport.close();
                FloodVerdict::Reject
            }
            FloodPolicy::Ban => {
                let mode = self.settings.ban_mode.effective();
                let target = match mode {
                    BanMode::Ip => Some(address.to_string()),
                    _ => ctx.bans.account_name(ctx.account_id),
                };

                match target {
                    Some(target) => {
                        let accepted = ctx.bans.ban(BanRequest {
                            mode,
                            target,
                            duration: self.settings.ban_duration,
                            reason: FLOOD_BAN_REASON.to_string(),
                            author: FLOOD_BAN_AUTHOR.to_string(),
                        });
                        warn!(
                            target: "network",
                            account_id = ctx.account_id,
                            address = %address,
                            opcode = %opcode,
                            mode = ?mode,
                            duration_secs = self.settings.ban_duration.map(|d| d.as_secs()),
                            accepted,
                            "AntiDOS: Player automatically banned"
                        );
                    }
                    None => {
                        warn!(
                            target: "network",
                            account_id = ctx.account_id,
                            address = %address,
                            opcode = %opcode,
                            "AntiDOS: account name unknown, kicking without ban"
                        );
                    }
                }

                ctx.transport.close();
                FloodVerdict::Reject
            }
        }
    }
}

// ============ Producer-side throttling ============

/// Producer-side discard ceilings
#[derive(Debug, Clone)]
pub struct ThrottleSettings {
    /// Packets per second kept for each throttled opcode
    pub limits: HashMap<u16, u32>,
    /// Minimum seconds between two discard reports
    pub log_interval_secs: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            log_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ThrottleWindow {
    time: u64,
    count: u32,
}

/// Discards excess packets before they reach the session queue
#[derive(Debug)]
pub struct PacketThrottler {
    settings: Arc<ThrottleSettings>,
    windows: HashMap<u16, ThrottleWindow>,
    discarded: HashMap<u16, u32>,
    last_log: u64,
}

impl PacketThrottler {
    pub fn new(settings: Arc<ThrottleSettings>) -> Self {
        Self {
            settings,
            windows: HashMap::new(),
            discarded: HashMap::new(),
            last_log: 0,
        }
    }

    /// Whether the packet must be dropped without queueing
    pub fn must_discard(&mut self, opcode: u16, now: u64, account_id: u32, address: &str) -> bool {
        let Some(&max) = self.settings.limits.get(&opcode) else {
            return false;
        };

        let window = self.windows.entry(opcode).or_default();
        if window.time == now {
            window.count += 1;
            if window.count > max {
                *self.discarded.entry(opcode).or_default() += 1;
                if self.last_log + self.settings.log_interval_secs < now {
                    self.log_discarded(account_id, address);
                    self.last_log = now;
                }
                return true;
            }
        } else {
            window.time = now;
            window.count = 1;
        }

        false
    }

    /// Packets discarded since the last report
    pub fn pending_discards(&self) -> u32 {
        self.discarded.values().sum()
    }

    fn log_discarded(&mut self, account_id: u32, address: &str) {
        for (opcode, count) in self.discarded.drain() {
            info!(
                target: "network",
                account_id,
                address = %address,
                opcode = %opcode_name_for_logging(opcode),
                count,
                "Discarded throttled packets"
            );
        }
    }
}
