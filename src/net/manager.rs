//! Session registry module
//!
//! Owns every live [`WorldSession`] and drives their updates:
//! - one session per account; a new login replaces the old session
//! - a login queue once `max_sessions` is reached
//! - the world update (sequential, runs logout and teardown)
//! - the map update (parallel on the rayon pool)

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::net::filter::UpdateFilter;
use crate::net::session::WorldSession;

/// Shared handle to a session
pub type SessionHandle = Arc<Mutex<WorldSession>>;

/// Registry of world sessions keyed by account id
pub struct SessionManager {
    sessions: DashMap<u32, SessionHandle>,
    /// Accounts waiting for a free slot, oldest first
    queue: Mutex<VecDeque<u32>>,
    max_sessions: usize,
}

impl SessionManager {
    /// Create a manager; `max_sessions` of 0 disables the login queue
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            max_sessions,
        }
    }

    /// Register a freshly authenticated session
    ///
    /// An existing session for the same account is kicked and replaced.
    pub fn add_session(&self, mut session: WorldSession) -> SessionHandle {
        let account_id = session.account_id();

        if let Some((_, old)) = self.sessions.remove(&account_id) {
            info!(account_id, "Account logged in again, kicking previous session");
            old.lock().kick_player("Account logged in from another connection");
            self.queue.lock().retain(|&id| id != account_id);
        }

        let active = self.active_count();
        if self.max_sessions > 0 && active >= self.max_sessions {
            let position = {
                let mut queue = self.queue.lock();
                queue.push_back(account_id);
                queue.len()
            };
            session.set_in_queue(true);
            session.send_auth_wait_queue(position as u32);
            info!(account_id, position, "Session queued");
        } else {
            session.send_auth_wait_queue(0);
            session.send_addons_info();
            debug!(account_id, active = active + 1, "Session added");
        }

        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(account_id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, account_id: u32) -> Option<SessionHandle> {
        self.sessions.get(&account_id).map(|s| Arc::clone(s.value()))
    }

    /// Sessions registered, queued ones included
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Sessions holding a slot
    pub fn active_count(&self) -> usize {
        self.sessions.len().saturating_sub(self.queued_count())
    }

    /// Position of an account in the login queue (1-based)
    pub fn queue_position(&self, account_id: u32) -> Option<usize> {
        self.queue.lock().iter().position(|&id| id == account_id).map(|p| p + 1)
    }

    /// World update: drain every session, remove the dead, admit the queued
    pub fn update_sessions(&self) {
        let handles: Vec<(u32, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut removed = 0usize;
        for (account_id, handle) in handles {
            let alive = handle.lock().update(UpdateFilter::World);
            if !alive {
                // A newer session may have replaced this one meanwhile
                let is_current = self.sessions.remove_if(&account_id, |_, current| Arc::ptr_eq(current, &handle));
                if is_current.is_some() {
                    self.queue.lock().retain(|&id| id != account_id);
                    removed += 1;
                    debug!(account_id, "Session removed");
                }
            }
        }

        if removed > 0 {
            self.release_queued();
        }
    }

    /// Map update: drain map-safe packets of every in-world session in parallel
    ///
    /// Sessions whose character is on no map are left to the world update.
    pub fn update_map_sessions(&self) {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();

        handles.par_iter().for_each(|handle| {
            let mut session = handle.lock();
            if session.player().is_some_and(|p| p.is_in_world()) {
                session.update(UpdateFilter::Map);
            }
        });
    }

    /// Admit queued sessions while slots are free and tell the rest their position
    fn release_queued(&self) {
        let mut queue = self.queue.lock();

        while self.max_sessions == 0 || self.sessions.len().saturating_sub(queue.len()) < self.max_sessions {
            let Some(account_id) = queue.pop_front() else {
                break;
            };
            if let Some(handle) = self.get(account_id) {
                let mut session = handle.lock();
                session.set_in_queue(false);
                session.send_auth_wait_queue(0);
                session.send_addons_info();
                info!(account_id, "Session left the login queue");
            }
        }

        for (index, account_id) in queue.iter().enumerate() {
            if let Some(handle) = self.get(*account_id) {
                handle.lock().send_auth_wait_queue(index as u32 + 1);
            }
        }
    }

    /// Close every session's connection
    pub fn disconnect_all(&self, reason: &str) {
        for entry in self.sessions.iter() {
            entry.value().lock().kick_player(reason);
        }
    }

    /// Drop every session
    pub fn clear(&self) {
        self.queue.lock().clear();
        self.sessions.clear();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(0)
    }
}
