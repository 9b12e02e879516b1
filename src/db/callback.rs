//! Asynchronous query completion
//!
//! A session issues at most one asynchronous query per named slot. Every
//! drain tick polls the slots; a completed query is handed out exactly once
//! and its slot is freed. Slots are independent of each other.

use std::fmt;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::warn;

use crate::db::QueryResult;
use crate::error::DatabaseError;

/// Outcome carried from the store to the session
pub type QueryOutcome = Result<QueryResult, DatabaseError>;

/// Create a linked promise/future pair
pub fn query_channel() -> (QueryPromise, QueryFuture) {
    let (tx, rx) = oneshot::channel();
    (QueryPromise { tx }, QueryFuture { rx })
}

/// Store-side handle used to deliver a result
#[derive(Debug)]
pub struct QueryPromise {
    tx: oneshot::Sender<QueryOutcome>,
}

impl QueryPromise {
    /// Deliver the result; dropped silently if the session is gone
    pub fn fulfill(self, outcome: QueryOutcome) {
        let _ = self.tx.send(outcome);
    }
}

/// Session-side handle of an outstanding query
#[derive(Debug)]
pub struct QueryFuture {
    rx: oneshot::Receiver<QueryOutcome>,
}

/// Result of polling a [`QueryFuture`]
#[derive(Debug)]
pub enum QueryPoll {
    Pending,
    Ready(QueryOutcome),
    /// The store dropped the query without answering
    Cancelled,
}

impl QueryFuture {
    /// Check for a result without blocking
    pub fn poll_ready(&mut self) -> QueryPoll {
        match self.rx.try_recv() {
            Ok(outcome) => QueryPoll::Ready(outcome),
            Err(TryRecvError::Empty) => QueryPoll::Pending,
            Err(TryRecvError::Closed) => QueryPoll::Cancelled,
        }
    }
}

/// Number of named query slots
pub const CALLBACK_SLOT_COUNT: usize = 7;

/// Named slots for in-flight queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
    CharEnum,
    CharCreate,
    PlayerLogin,
    AddFriend,
    CharRename,
    AddIgnore,
    GuildRename,
}

impl CallbackSlot {
    pub const ALL: [CallbackSlot; CALLBACK_SLOT_COUNT] = [
        CallbackSlot::CharEnum,
        CallbackSlot::CharCreate,
        CallbackSlot::PlayerLogin,
        CallbackSlot::AddFriend,
        CallbackSlot::CharRename,
        CallbackSlot::AddIgnore,
        CallbackSlot::GuildRename,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CallbackSlot::CharEnum => "char_enum",
            CallbackSlot::CharCreate => "char_create",
            CallbackSlot::PlayerLogin => "player_login",
            CallbackSlot::AddFriend => "add_friend",
            CallbackSlot::CharRename => "char_rename",
            CallbackSlot::AddIgnore => "add_ignore",
            CallbackSlot::GuildRename => "guild_rename",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque value carried alongside a query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryParam {
    #[default]
    None,
    Name(String),
    Guid(u64),
}

/// A finished query, ready for its continuation
#[derive(Debug)]
pub struct QueryCompletion {
    pub slot: CallbackSlot,
    pub result: QueryOutcome,
    pub param: QueryParam,
}

/// Issuing into a slot that already holds a query
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("query slot {0} is already in use")]
pub struct SlotBusy(pub CallbackSlot);

#[derive(Debug)]
struct PendingQuery {
    future: QueryFuture,
    param: QueryParam,
}

/// Per-session query slots
#[derive(Debug)]
pub struct QueryCallbacks {
    slots: [Option<PendingQuery>; CALLBACK_SLOT_COUNT],
}

impl Default for QueryCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCallbacks {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Park a query in `slot`
    pub fn issue(&mut self, slot: CallbackSlot, future: QueryFuture, param: QueryParam) -> Result<(), SlotBusy> {
        let entry = &mut self.slots[slot.index()];
        if entry.is_some() {
            return Err(SlotBusy(slot));
        }
        *entry = Some(PendingQuery { future, param });
        Ok(())
    }

    pub fn is_pending(&self, slot: CallbackSlot) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// Collect every finished query, freeing its slot
    pub fn poll(&mut self) -> Vec<QueryCompletion> {
        let mut completed = Vec::new();

        for slot in CallbackSlot::ALL {
            let entry = &mut self.slots[slot.index()];
            let Some(pending) = entry.as_mut() else {
                continue;
            };

            match pending.future.poll_ready() {
                QueryPoll::Pending => {}
                QueryPoll::Ready(result) => {
                    if let Some(pending) = entry.take() {
                        completed.push(QueryCompletion {
                            slot,
                            result,
                            param: pending.param,
                        });
                    }
                }
                QueryPoll::Cancelled => {
                    warn!(slot = %slot, "Query dropped without a result, freeing slot");
                    *entry = None;
                }
            }
        }

        completed
    }

    /// Abandon every outstanding query
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}
