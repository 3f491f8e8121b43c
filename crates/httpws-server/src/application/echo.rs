//! The WebSocket application wired to the upgrade path.
//!
//! - On connect: join the hub, receive the current status snapshot, then the
//!   [`NEXT_TOKEN`] telling the client it may send.
//! - On message: the payload is echoed back to its sender (text if it is
//!   UTF-8, binary otherwise), then every client gets [`NEXT_TOKEN`].
//! - On close: leave the hub.

use std::sync::Arc;

use httpws_core::{Connection, HandlerError, WsHandler};
use tracing::{debug, info};

use crate::application::hub::Hub;
use crate::application::status::StatusBroadcaster;

/// Text frame telling clients they may send their next message.
pub const NEXT_TOKEN: &[u8] = b"next";

pub struct EchoApp {
    hub: Arc<Hub>,
    status: Arc<StatusBroadcaster>,
}

impl EchoApp {
    pub fn new(hub: Arc<Hub>, status: Arc<StatusBroadcaster>) -> Self {
        Self { hub, status }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

impl WsHandler for EchoApp {
    fn on_connected(&self, conn: &Arc<Connection>) {
        self.hub.register(Arc::clone(conn));
        info!(conn = %conn.id(), peer = conn.peer(), clients = self.hub.len(), "client joined");

        // A failed send has already closed the connection.
        if let Some(json) = self.status.snapshot_json() {
            let _ = conn.send_text(&json);
        }
        let _ = conn.send_text(NEXT_TOKEN);
    }

    fn on_message(&self, conn: &Arc<Connection>, payload: &[u8]) -> Result<(), HandlerError> {
        debug!(conn = %conn.id(), len = payload.len(), "websocket received");

        let echoed = match std::str::from_utf8(payload) {
            Ok(_) => conn.send_text(payload),
            Err(_) => conn.send_binary(payload),
        };
        echoed.map_err(|e| HandlerError::Rejected(format!("echo not delivered: {e}")))?;

        self.hub.broadcast(NEXT_TOKEN, None);
        Ok(())
    }

    fn on_closed(&self, conn: &Connection) {
        self.hub.unregister(conn.id());
        info!(conn = %conn.id(), peer = conn.peer(), clients = self.hub.len(), "client left");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
