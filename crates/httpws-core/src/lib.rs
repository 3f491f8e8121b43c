//! # httpws-core
//!
//! Server-side WebSocket protocol core (a subset of RFC 6455) layered on top
//! of a blocking byte stream that started life as an HTTP/1.1 connection.
//!
//! This crate knows nothing about sockets, HTTP routing, or async runtimes.
//! It works on anything that implements [`std::io::Read`] and
//! [`std::io::Write`], which is also how the tests drive it: an in-memory
//! byte source stands in for the socket.
//!
//! # Architecture overview
//!
//! - **`protocol::handshake`** – Validates the upgrade headers, derives the
//!   `Sec-WebSocket-Accept` token and writes the `101 Switching Protocols`
//!   response.
//!
//! - **`protocol::frame`** – The binary frame codec.  Frames are decoded one
//!   at a time from a blocking reader (always masked, client → server) and
//!   encoded as a single unmasked buffer (server → client).
//!
//! - **`connection`** – One [`Connection`] per upgraded socket.  It owns the
//!   write half of the stream, runs the receive loop, dispatches opcodes, and
//!   hosts the close coordinator that guarantees exactly one teardown.
//!
//! - **`handler`** – The callback surface ([`WsHandler`]) the application
//!   implements: `on_connected`, `on_message`, `on_closed`.
//!
//! # Limitations
//!
//! Only single-frame messages are produced.  Continuation frames received
//! from a peer are delivered to `on_message` as-is and never reassembled.
//! There is no extension or subprotocol negotiation and no client mode.

pub mod connection;
pub mod handler;
pub mod protocol;

pub use connection::{CloseReason, Connection, ConnectionError, ConnectionState};
pub use handler::{HandlerError, WsHandler};
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameError, Opcode};
pub use protocol::handshake::{accept_key, negotiate, HandshakeError, HandshakeRequest, Negotiation};
