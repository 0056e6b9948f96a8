/// Session statistics tracker.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::relay::RelayTotals;
use crate::wire::Command;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub source: String,
    pub target: String,
    pub command: Command,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GlobalStats
// ---------------------------------------------------------------------------

/// Shared registry of active sessions plus lifetime totals. Sessions
/// register once their request is accepted and deregister on termination.
#[derive(Debug, Default)]
pub struct GlobalStats {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, SessionInfo>>,
    total_sessions: AtomicU64,
    total_client_to_server: AtomicU64,
    total_server_to_client: AtomicU64,
}

impl GlobalStats {
    pub fn new() -> Arc<Self> {
        Arc::new(GlobalStats::default())
    }

    /// Allocate a fresh session id, unique for the process lifetime.
    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_started(&self, info: SessionInfo) {
        if let Ok(mut map) = self.active.lock() {
            map.insert(info.id, info);
        }
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Deregister a session and fold its relay totals into the lifetime
    /// counters; returns the registered [`SessionInfo`] if any.
    pub fn session_finished(&self, id: u64, totals: RelayTotals) -> Option<SessionInfo> {
        self.total_client_to_server
            .fetch_add(totals.client_to_server, Ordering::Relaxed);
        self.total_server_to_client
            .fetch_add(totals.server_to_client, Ordering::Relaxed);
        self.active.lock().ok()?.remove(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Snapshot of all currently active sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.active
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    pub fn total_client_to_server(&self) -> u64 {
        self.total_client_to_server.load(Ordering::Relaxed)
    }

    pub fn total_server_to_client(&self) -> u64 {
        self.total_server_to_client.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
