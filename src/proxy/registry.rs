//! # Session Registry
//!
//! The only state shared across sessions. Holds one [`SessionHandle`] per live
//! browser connection and enforces the global concurrent-session limit.
//!
//! ## Thread Safety:
//! Uses a std `RwLock` around the map: registration and removal take the write
//! lock briefly, health reporting takes the read lock. Nothing async happens
//! while a lock is held.

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::session::SessionState;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// Shared, read-mostly view of one session.
///
/// The session's own tasks update the counters and the activity timestamp; the
/// registry and the health endpoint only read them.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    last_activity_ms: AtomicI64,
    pub stats: SessionStats,
}

/// Per-session traffic counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_to_backend: AtomicU64,
    pub frames_to_browser: AtomicU64,
    pub control_to_backend: AtomicU64,
    pub control_to_browser: AtomicU64,
    pub codec_errors: AtomicU64,
    pub dropped_messages: AtomicU64,
    pub reconnects: AtomicU64,
}

impl SessionStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl SessionHandle {
    pub fn new(session_id: String, state: watch::Receiver<SessionState>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            state,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn idle_for(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.last_activity())
    }
}

/// Registry of live sessions with a hard capacity.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Insert a session, or fail with `Capacity` when the limit is reached.
    pub fn try_register(&self, handle: Arc<SessionHandle>) -> ProxyResult<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_sessions {
            return Err(ProxyError::Capacity(format!(
                "maximum concurrent sessions ({}) reached",
                self.max_sessions
            )));
        }

        if sessions.contains_key(&handle.session_id) {
            return Err(ProxyError::Capacity(format!(
                "session id '{}' already registered",
                handle.session_id
            )));
        }

        sessions.insert(handle.session_id.clone(), handle);
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);

        let mut state_counts = HashMap::new();
        let mut frames_to_backend = 0;
        let mut frames_to_browser = 0;
        let mut dropped_messages = 0;

        for handle in sessions.values() {
            *state_counts.entry(handle.state().as_str().to_string()).or_insert(0) += 1;
            frames_to_backend += handle.stats.frames_to_backend.load(Ordering::Relaxed);
            frames_to_browser += handle.stats.frames_to_browser.load(Ordering::Relaxed);
            dropped_messages += handle.stats.dropped_messages.load(Ordering::Relaxed);
        }

        RegistrySummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_sessions,
            state_counts,
            frames_to_backend,
            frames_to_browser,
            dropped_messages,
        }
    }
}

#[derive(Debug)]
pub struct RegistrySummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<String, usize>,
    pub frames_to_backend: u64,
    pub frames_to_browser: u64,
    pub dropped_messages: u64,
}
