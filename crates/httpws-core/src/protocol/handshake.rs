//! The HTTP/1.1 → WebSocket upgrade handshake (RFC 6455 §4.2).
//!
//! The handshake needs exactly two request headers, `Upgrade` and
//! `Sec-WebSocket-Key`.  The surrounding HTTP layer hands them over through a
//! [`HandshakeRequest`]; this module decides whether an upgrade was asked
//! for, derives the accept token, and writes the `101` response.  It never
//! touches the connection state itself.

use std::io::{self, Write};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only `Upgrade` value this server understands.
pub const UPGRADE_WEBSOCKET: &str = "websocket";

/// Errors that can occur during the upgrade handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// `Upgrade: websocket` was requested but `Sec-WebSocket-Key` is absent.
    #[error("upgrade request is missing Sec-WebSocket-Key")]
    MissingKey,

    /// `Sec-WebSocket-Key` is present but blank.
    #[error("upgrade request has an empty Sec-WebSocket-Key")]
    EmptyKey,

    /// Writing the `101` response to the stream failed.
    #[error("failed to write handshake response: {0}")]
    Io(#[from] io::Error),
}

/// The subset of inbound request headers the handshake looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeRequest<'a> {
    pub upgrade: Option<&'a str>,
    pub key: Option<&'a str>,
}

impl<'a> HandshakeRequest<'a> {
    /// Builds the request from any header accessor (name → value).
    ///
    /// The accessor is expected to do its own case-insensitive name matching,
    /// as HTTP header names are case-insensitive.
    pub fn from_headers<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        Self {
            upgrade: lookup("Upgrade"),
            key: lookup("Sec-WebSocket-Key"),
        }
    }
}

/// Outcome of inspecting a request for an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// No WebSocket upgrade was requested; fall through to plain HTTP handling.
    NotRequested,
    /// The upgrade is acceptable; `accept` is the `Sec-WebSocket-Accept` token.
    Upgrade { accept: String },
}

/// Derives the `Sec-WebSocket-Accept` token for `client_key`.
///
/// `base64(sha1(client_key ++ GUID))`.
///
/// # Examples
///
/// ```rust
/// use httpws_core::protocol::handshake::accept_key;
///
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    B64.encode(sha.finalize())
}

/// Decides whether `request` asks for a WebSocket upgrade.
///
/// The `Upgrade` value is compared to `websocket` ignoring ASCII case.
/// Surrounding whitespace in the key is trimmed before hashing.
///
/// # Errors
///
/// Returns [`HandshakeError::MissingKey`] or [`HandshakeError::EmptyKey`] when
/// the upgrade is requested but the key is unusable.  The caller should then
/// answer with a plain HTTP error and leave the connection unconnected.
pub fn negotiate(request: &HandshakeRequest<'_>) -> Result<Negotiation, HandshakeError> {
    let wants_upgrade = request
        .upgrade
        .map(|v| v.trim().eq_ignore_ascii_case(UPGRADE_WEBSOCKET))
        .unwrap_or(false);
    if !wants_upgrade {
        return Ok(Negotiation::NotRequested);
    }

    let key = request.key.ok_or(HandshakeError::MissingKey)?.trim();
    if key.is_empty() {
        return Err(HandshakeError::EmptyKey);
    }

    Ok(Negotiation::Upgrade {
        accept: accept_key(key),
    })
}

/// Writes the `101 Switching Protocols` response (status line, three headers,
/// blank line, no body) and flushes it.
///
/// # Errors
///
/// Returns [`HandshakeError::Io`] if the write or flush fails.
pub fn write_response<W: Write + ?Sized>(writer: &mut W, accept: &str) -> Result<(), HandshakeError> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );
    writer.write_all(response.as_bytes())?;
    writer.flush()?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
