//! Egress server: the far end of the tunnel
//!
//! An HTTP server that upgrades authenticated WebSocket requests into
//! framed relay sessions. Admission happens before the upgrade: the
//! token gate returns 401, the capacity gate 503. Plain HTTP requests
//! get a health endpoint and a decoy landing page.
//!
//! ```text
//! Client ──wss──> EgressServer ──CONNECT frame──> Session
//!                     |                              |
//!                 /ping, /                      TCP upstream
//!                                        (fallback cascade on dial)
//! ```

mod server;
mod session;

pub use server::EgressServer;
pub use session::run_session;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Concurrent-session admission counter.
///
/// Acquisition is non-blocking; a full pool rejects the upgrade with
/// 503 before any session state exists. The permit releases its slot on
/// drop, so the counter always equals the number of live sessions.
#[derive(Debug)]
pub struct SessionPool {
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl SessionPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Try to claim a session slot
    #[must_use]
    pub fn try_acquire(&self) -> Option<SessionPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SessionPermit {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Live session count
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII slot in the [`SessionPool`]
#[derive(Debug)]
pub struct SessionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counters exposed by the egress server
#[derive(Debug, Default)]
pub struct EgressStats {
    /// Upgrades that became sessions
    pub sessions_accepted: AtomicU64,
    /// Upgrades rejected by the token gate
    pub rejected_auth: AtomicU64,
    /// Upgrades rejected by the capacity gate
    pub rejected_capacity: AtomicU64,
    /// Sessions that ended with a fault
    pub session_errors: AtomicU64,
    /// Bytes relayed towards upstreams
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed back to clients
    pub bytes_to_client: AtomicU64,
}

impl EgressStats {
    pub fn snapshot(&self) -> EgressStatsSnapshot {
        EgressStatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
            rejected_capacity: self.rejected_capacity.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EgressStats`]
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EgressStatsSnapshot {
    pub sessions_accepted: u64,
    pub rejected_auth: u64,
    pub rejected_capacity: u64,
    pub session_errors: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}
