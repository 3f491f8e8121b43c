//! Registry of open WebSocket connections and the fan-out path.
//!
//! Any thread may broadcast.  The registry lock is only held long enough to
//! copy the current set of connections; the sends happen after it is
//! released.  A failing send runs the connection's close coordinator, whose
//! `on_closed` callback unregisters from this same hub, so holding the lock
//! across sends would deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use httpws_core::protocol::frame::Opcode;
use httpws_core::Connection;
use tracing::{debug, trace};
use uuid::Uuid;

/// Shared set of open connections, keyed by connection id.
#[derive(Debug, Default)]
pub struct Hub {
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn`.  Returns `false` if it was already registered.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let id = conn.id();
        let inserted = self.lock().insert(id, conn).is_none();
        debug!(conn = %id, clients = self.len(), "registered");
        inserted
    }

    /// Removes the connection with `id`.  Returns `false` if it was unknown.
    pub fn unregister(&self, id: Uuid) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(conn = %id, clients = self.len(), "unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the current set of connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    /// Sends `payload` as a text frame to every connection except `exclude`.
    ///
    /// Returns the number of connections the frame was written to.  Failed
    /// sends are skipped; the affected connection closes itself.
    pub fn broadcast(&self, payload: &[u8], exclude: Option<Uuid>) -> usize {
        self.broadcast_frame(Opcode::Text, payload, exclude)
    }

    /// Like [`broadcast`](Self::broadcast) with an explicit opcode.
    pub fn broadcast_frame(&self, opcode: Opcode, payload: &[u8], exclude: Option<Uuid>) -> usize {
        let mut delivered = 0;
        for conn in self.snapshot() {
            if Some(conn.id()) == exclude {
                continue;
            }
            match conn.send(opcode, payload) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(conn = %conn.id(), "broadcast skipped: {e}"),
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
