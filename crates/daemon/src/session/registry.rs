//! Concurrent store of live sessions.
//!
//! The registry is the only shared mutable state between sessions. An id is
//! present exactly while its session is `Connecting`, `Active` or `Closing`.
//! The registry also owns the idle reaper task so that stopping the registry
//! stops the sweeps.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::state::{Session, SessionId, SessionState};

/// Errors returned when registering a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// A session with this id is already registered.
    #[error("session already active: {0}")]
    AlreadyActive(SessionId),

    /// The registry is at capacity.
    #[error("session limit reached ({0})")]
    Full(usize),
}

/// Why the reaper selected a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// No input or resize for this long.
    Idle(Duration),
    /// The session is older than the configured ceiling.
    MaxAge(Duration),
}

/// Handle to a running reaper task.
pub struct ReaperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Wraps a spawned reaper task and the token that stops it.
    pub fn new(token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { token, task }
    }

    fn stop(self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Thread-safe session store keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session unless its id is taken or the registry is full.
    ///
    /// The capacity check is advisory under concurrent registration: two
    /// racing starts for different ids may both pass it.
    pub fn register(&self, session: Arc<Session>, max_sessions: usize) -> Result<(), RegisterError> {
        if self.sessions.len() >= max_sessions && !self.sessions.contains_key(session.id()) {
            return Err(RegisterError::Full(max_sessions));
        }

        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => Err(RegisterError::AlreadyActive(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Looks up a session.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns whether a session with this id is registered.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Removes `session` if it is still the one registered under `session_id`.
    pub fn remove(&self, session_id: &str, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true when no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copies out every registered session.
    ///
    /// Shard locks are released before returning, so callers may close
    /// sessions while walking the result.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sessions that exceeded the idle threshold or the age ceiling at `now`.
    pub fn expired(
        &self,
        now: Instant,
        idle_timeout: Duration,
        max_age: Option<Duration>,
    ) -> Vec<(Arc<Session>, ExpiryReason)> {
        self.snapshot()
            .into_iter()
            .filter(|session| session.state() != SessionState::Closing)
            .filter_map(|session| {
                let idle = session.idle_for(now);
                if idle > idle_timeout {
                    return Some((session, ExpiryReason::Idle(idle)));
                }
                let age = session.age(now);
                match max_age {
                    Some(limit) if age > limit => Some((session, ExpiryReason::MaxAge(age))),
                    _ => None,
                }
            })
            .collect()
    }

    /// Installs the reaper task, stopping any previous one.
    pub fn install_reaper(&self, handle: ReaperHandle) {
        if let Some(previous) = self.reaper.lock().replace(handle) {
            previous.stop();
        }
    }

    /// Stops the reaper task if one is running.
    pub fn stop_reaper(&self) -> bool {
        match self.reaper.lock().take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Returns true while a reaper task is installed.
    pub fn has_reaper(&self) -> bool {
        self.reaper.lock().is_some()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}
