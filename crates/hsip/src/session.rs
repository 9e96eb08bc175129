// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session id allocation and lifetime tracking.
//!
//! Session ids correlate requests with responses. They are 16-bit,
//! monotonically increasing, never 0 (0 means "no session" on the
//! wire), and unique among live sessions: the allocator skips 0 and
//! any id still in use when the counter wraps.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Inactive,
    Expired,
    Error,
}

/// One live request/response correlation slot.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: u16,
    pub client_id: u16,
    pub last_activity: Instant,
    pub state: SessionState,
}

#[derive(Default)]
struct Inner {
    next: u16,
    active: HashMap<u16, Session>,
}

/// Thread-safe session table.
#[derive(Default)]
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id unique among the currently live sessions.
    pub fn create(&self, client_id: u16) -> u16 {
        let mut inner = self.inner.lock();
        loop {
            inner.next = inner.next.wrapping_add(1);
            if inner.next == 0 {
                inner.next = 1;
            }
            let candidate = inner.next;
            if !inner.active.contains_key(&candidate) {
                inner.active.insert(
                    candidate,
                    Session {
                        session_id: candidate,
                        client_id,
                        last_activity: Instant::now(),
                        state: SessionState::Active,
                    },
                );
                return candidate;
            }
        }
    }

    /// Whether `session_id` names a live session.
    pub fn validate(&self, session_id: u16) -> bool {
        self.inner.lock().active.contains_key(&session_id)
    }

    /// Refresh a session's activity timestamp.
    pub fn touch(&self, session_id: u16) {
        if let Some(session) = self.inner.lock().active.get_mut(&session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Drop a session once its request completed.
    pub fn release(&self, session_id: u16) {
        self.inner.lock().active.remove(&session_id);
    }

    /// Expire and drop sessions idle longer than `timeout`.
    pub fn reap(&self, timeout: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.active.len();
        inner.active.retain(|id, session| {
            let idle = session.last_activity.elapsed() <= timeout;
            if !idle {
                session.state = SessionState::Expired;
                log::debug!("[session] reaping idle session 0x{:04x}", id);
            }
            idle
        });
        before - inner.active.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }
}
