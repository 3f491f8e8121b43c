//! Periodic status snapshot pushed to every connected client.
//!
//! While nobody is connected the broadcaster stays quiet; as soon as the hub
//! has a client, each tick serializes a [`StatusSnapshot`] to JSON and sends
//! it as a text frame to all of them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, trace};

use crate::application::hub::Hub;

/// What clients receive on connect and on every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Server name and version.
    pub server: String,
    /// Number of open WebSocket connections.
    pub connections: usize,
    /// Seconds since the broadcaster was created.
    pub uptime_secs: u64,
    /// Monotonic counter, incremented per broadcast tick.
    pub sequence: u64,
}

/// Builds snapshots and broadcasts them through the [`Hub`].
#[derive(Debug)]
pub struct StatusBroadcaster {
    hub: Arc<Hub>,
    started: Instant,
    sequence: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            started: Instant::now(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Current snapshot, without advancing the sequence counter.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            server: format!("httpws/{}", env!("CARGO_PKG_VERSION")),
            connections: self.hub.len(),
            uptime_secs: self.started.elapsed().as_secs(),
            sequence: self.sequence.load(Ordering::Relaxed),
        }
    }

    /// Snapshot serialized as JSON bytes.
    pub fn snapshot_json(&self) -> Option<Vec<u8>> {
        match serde_json::to_vec(&self.snapshot()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("failed to serialize status snapshot: {e}");
                None
            }
        }
    }

    /// Broadcasts one snapshot.  Returns the number of clients reached; 0
    /// without sending anything when nobody is connected.
    pub fn tick(&self) -> usize {
        if self.hub.is_empty() {
            trace!("status tick skipped, waiting for clients");
            return 0;
        }
        self.sequence.fetch_add(1, Ordering::Relaxed);
        match self.snapshot_json() {
            Some(json) => self.hub.broadcast(&json, None),
            None => 0,
        }
    }
}

/// Calls [`StatusBroadcaster::tick`] every `period` until `running` is
/// cleared.
///
/// Sends are blocking socket writes, so each tick runs on the blocking pool.
pub async fn run_status_loop(broadcaster: Arc<StatusBroadcaster>, period: Duration, running: Arc<AtomicBool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick resolves immediately.
    ticker.tick().await;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let b = Arc::clone(&broadcaster);
        match tokio::task::spawn_blocking(move || b.tick()).await {
            Ok(reached) => trace!(reached, "status broadcast"),
            Err(e) => error!("status tick panicked: {e}"),
        }
    }
    debug!("status loop stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
