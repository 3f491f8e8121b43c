//! One upgraded WebSocket connection: receive loop, opcode dispatch, sends,
//! and the close coordinator.
//!
//! # Threads
//!
//! A connection is serviced by one dedicated receive worker that calls
//! [`Connection::run`].  Sends may come from any thread holding an
//! `Arc<Connection>` (a broadcast loop, another connection's handler, ...).
//!
//! Two locks live inside a connection:
//!
//! - the **write lock** around the writer half of the stream, so that two
//!   frames never interleave on the wire;
//! - the **close gate**, a mutex scoped to the close transition, so that the
//!   close sequence (state flip, close frame, `on_closed`) runs exactly once
//!   no matter whether it was triggered by a received close frame, a read
//!   error, a write error, or an explicit [`Connection::close`].
//!
//! Lock order is always gate → write lock.  The write lock is released before
//! a failed send enters the close coordinator.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::handler::WsHandler;
use crate::protocol::frame::{decode_frame_with_limit, encode_frame, Frame, Opcode, DEFAULT_MAX_PAYLOAD_LEN};

/// Errors returned to callers of the send operations.
///
/// Raw stream errors are never surfaced: they are logged and turned into a
/// close.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection is not open (handshake not done yet, or already closed).
    /// Nothing was written.
    #[error("connection is not open")]
    NotConnected,

    /// The stream failed while writing; the connection has been closed.
    #[error("connection closed after a write failure")]
    Closed,
}

/// Lifecycle of a connection with respect to message handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, handshake not completed yet.
    Pending = 0,
    /// Receiving and sending freely.
    Open = 1,
    /// The close coordinator is running.
    Closing = 2,
    /// Terminal; no further reads or writes are attempted.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// What triggered a close.  Used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Connection::close`] was called.
    Requested,
    /// The peer sent a close frame.
    PeerClose,
    /// Reading a frame failed while the connection was open.
    ReadError,
    /// Writing a frame failed.
    WriteError,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Requested => "close requested",
            CloseReason::PeerClose => "peer sent close",
            CloseReason::ReadError => "protocol read error",
            CloseReason::WriteError => "write error",
        };
        f.write_str(s)
    }
}

/// A WebSocket connection on top of an exclusively owned byte stream.
///
/// The read half is not stored: it is passed to [`Connection::run`] by the
/// receive worker, which is the only reader for the connection's lifetime.
pub struct Connection {
    id: Uuid,
    peer: String,
    writer: Mutex<Box<dyn Write + Send>>,
    gate: Mutex<()>,
    state: AtomicU8,
    close_requested: AtomicBool,
    max_payload_len: usize,
    handler: Arc<dyn WsHandler>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a pending connection that writes frames to `writer`.
    pub fn new<W>(writer: W, handler: Arc<dyn WsHandler>) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            peer: String::from("unknown"),
            writer: Mutex::new(Box::new(writer)),
            gate: Mutex::new(()),
            state: AtomicU8::new(ConnectionState::Pending as u8),
            close_requested: AtomicBool::new(false),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            handler,
        }
    }

    /// Sets the peer label used in log lines (usually the socket address).
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Sets the largest payload the receive loop accepts.
    pub fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `true` between a successful [`open`](Self::open) and the start of the
    /// close sequence.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// `true` once the close coordinator has run.  The surrounding HTTP loop
    /// reads this to stop serving further requests on the socket.
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Marks the handshake as complete and fires `on_connected`.
    ///
    /// Returns `false` (and does nothing) if the connection was already
    /// opened or closed.
    pub fn open(self: &Arc<Self>) -> bool {
        {
            let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            if self.state() != ConnectionState::Pending {
                return false;
            }
            self.state.store(ConnectionState::Open as u8, Ordering::Release);
        }
        info!(conn = %self.id, peer = %self.peer, "websocket connected");
        self.handler.on_connected(self);
        true
    }

    /// Runs the receive loop until the connection is closed.
    ///
    /// Reads one frame at a time from `reader` and dispatches it.  A read
    /// failure while open closes the connection; a read failure after a
    /// concurrent close is the expected teardown race and is only logged.
    pub fn run<R: Read>(self: &Arc<Self>, mut reader: R) {
        while self.is_connected() {
            match decode_frame_with_limit(&mut reader, self.max_payload_len) {
                Ok(frame) => self.dispatch(frame),
                Err(e) if self.is_connected() => {
                    warn!(conn = %self.id, peer = %self.peer, "RCV: closing connection: {e}");
                    self.close_with(CloseReason::ReadError);
                }
                Err(e) => {
                    debug!(conn = %self.id, peer = %self.peer, "RCV: read aborted after close: {e}");
                }
            }
        }
        debug!(conn = %self.id, peer = %self.peer, "receive loop finished");
    }

    /// Applies opcode semantics to one decoded frame.
    ///
    /// Frames arriving when the connection is not open are dropped.
    pub fn dispatch(self: &Arc<Self>, frame: Frame) {
        if !self.is_connected() {
            debug!(conn = %self.id, opcode = ?frame.opcode, "dropping frame on closed connection");
            return;
        }

        match frame.opcode {
            Opcode::Close => self.close_with(CloseReason::PeerClose),
            Opcode::Ping => {
                // A failed pong has already closed the connection.
                let _ = self.send(Opcode::Pong, &frame.payload);
            }
            Opcode::Pong => {
                trace!(conn = %self.id, "pong received");
            }
            Opcode::Continuation | Opcode::Text | Opcode::Binary => {
                if let Err(e) = self.handler.on_message(self, &frame.payload) {
                    warn!(conn = %self.id, peer = %self.peer, "message handler failed: {e}");
                }
            }
            Opcode::Other(bits) => {
                trace!(conn = %self.id, "ignoring frame with opcode 0x{bits:X}");
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Sends one text frame.
    ///
    /// The bytes are sent as given; they are expected to be UTF-8.
    pub fn send_text(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.send(Opcode::Text, payload)
    }

    /// Sends one binary frame.
    pub fn send_binary(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.send(Opcode::Binary, payload)
    }

    /// Sends one ping frame.
    pub fn send_ping(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.send(Opcode::Ping, payload)
    }

    /// Encodes and writes one unmasked frame as a single write.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotConnected`] if the connection is not open.
    /// - [`ConnectionError::Closed`] if the write failed; the close
    ///   coordinator has run by the time this returns.
    pub fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let frame = encode_frame(opcode, payload);

        let result = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            // The close frame may have gone out while we waited for the lock.
            if !self.is_connected() {
                return Err(ConnectionError::NotConnected);
            }
            write_frame(&mut **writer, &frame)
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(conn = %self.id, peer = %self.peer, "SND: closing connection: {e}");
                self.close_with(CloseReason::WriteError);
                Err(ConnectionError::Closed)
            }
        }
    }

    // ── Close coordination ───────────────────────────────────────────────────

    /// Closes the connection.  Idempotent; safe to call from any thread.
    pub fn close(&self) {
        self.close_with(CloseReason::Requested);
    }

    fn close_with(&self, reason: CloseReason) {
        if !self.is_connected() {
            info!(conn = %self.id, "close ignored, connection not open ({reason})");
            return;
        }

        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_connected() {
            info!(conn = %self.id, "close ignored, connection not open ({reason})");
            return;
        }

        self.state.store(ConnectionState::Closing as u8, Ordering::Release);
        self.close_requested.store(true, Ordering::Release);

        // The stream may already be unusable; the close frame is best effort.
        let close_frame = encode_frame(Opcode::Close, &[]);
        let sent = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            write_frame(&mut **writer, &close_frame)
        };
        if let Err(e) = sent {
            debug!(conn = %self.id, "close frame not sent: {e}");
        }

        info!(conn = %self.id, peer = %self.peer, "websocket closed ({reason})");
        self.handler.on_closed(self);
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

fn write_frame(writer: &mut (dyn Write + Send), frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
