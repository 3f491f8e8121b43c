//! Application callback surface.
//!
//! The protocol core never interprets payloads.  Whatever arrives in a data
//! frame is handed to a [`WsHandler`] verbatim, and the handler decides what it
//! means.  The core only ever reports lifecycle events to the handler; it never
//! passes raw stream errors through.

use std::sync::Arc;

use thiserror::Error;

use crate::connection::Connection;

/// Failure reported by [`WsHandler::on_message`].
///
/// The core logs these and carries on; a failing callback never closes the
/// connection on its own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler refused the message (bad format, unknown command, ...).
    #[error("message rejected: {0}")]
    Rejected(String),

    /// Any other application-level failure.
    #[error("handler failed: {0}")]
    Other(String),
}

/// Callbacks invoked by a [`Connection`].
///
/// All three run on the thread that triggered them: `on_connected` and
/// `on_message` on the receive worker, `on_closed` on whichever thread won the
/// close race.  A slow callback stalls further reads on that connection only.
pub trait WsHandler: Send + Sync {
    /// Fired once after the handshake, before the first frame is read.
    fn on_connected(&self, _conn: &Arc<Connection>) {}

    /// Fired once per continuation, text or binary frame.
    fn on_message(&self, conn: &Arc<Connection>, payload: &[u8]) -> Result<(), HandlerError>;

    /// Fired exactly once, from inside the close coordinator.
    ///
    /// The connection is already marked closed when this runs: sends return
    /// [`crate::ConnectionError::NotConnected`] and [`Connection::close`] is a
    /// no-op.
    fn on_closed(&self, _conn: &Connection) {}
}
