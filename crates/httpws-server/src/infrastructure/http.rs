//! Minimal blocking HTTP/1.1: request parsing, responses, static files and
//! Basic authentication.
//!
//! Only what a browser needs to load a page and open a WebSocket is
//! supported: `GET`/`HEAD`, no request bodies, no chunked encoding.  The
//! request head is parsed with `httparse`.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Component, Path, PathBuf};

use httpws_core::HandshakeRequest;
use thiserror::Error;

use crate::domain::config::BasicAuth;

/// Longest accepted request head (request line plus headers), in bytes.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Most headers accepted in one request.
pub const MAX_HEADERS: usize = 100;

/// `Cache-Control` sent with every static file.
pub const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// Value of the `Server` response header.
pub const SERVER_NAME: &str = concat!("httpws/", env!("CARGO_PKG_VERSION"));

/// Errors while reading a request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The socket failed or closed in the middle of a request.
    #[error("I/O error reading request: {0}")]
    Io(#[from] io::Error),

    /// The request line or a header line could not be parsed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The head was longer than [`MAX_HEAD_LEN`] or there were more than
    /// [`MAX_HEADERS`] headers.
    #[error("request header section too large")]
    HeaderTooLarge,
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// One parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request target without its query string.
    pub fn path(&self) -> &str {
        self.target.split(['?', '#']).next().unwrap_or("/")
    }

    /// Whether the connection should stay open after the response.
    pub fn keep_alive(&self) -> bool {
        let conn = self.header("Connection").map(|v| v.to_ascii_lowercase());
        match self.version.as_str() {
            "HTTP/1.0" => conn.is_some_and(|v| v.contains("keep-alive")),
            _ => !conn.is_some_and(|v| v.contains("close")),
        }
    }

    /// The headers the WebSocket handshake needs.
    pub fn handshake(&self) -> HandshakeRequest<'_> {
        HandshakeRequest::from_headers(|name| self.header(name))
    }
}

/// Reads one request head from `reader` and parses it with `httparse`.
///
/// Only the head is consumed: bytes the client sent after the blank line
/// stay buffered in `reader` for whoever reads next (pipelined requests or
/// the first WebSocket frames).
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending anything.  Empty lines before the request line are skipped.
///
/// # Errors
///
/// See [`HttpError`].
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<Request>, HttpError> {
    let Some(head) = read_head(reader)? else {
        return Ok(None);
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HttpError::Malformed("incomplete request head".to_string()));
        }
        Err(httparse::Error::TooManyHeaders) => return Err(HttpError::HeaderTooLarge),
        Err(e) => return Err(HttpError::Malformed(e.to_string())),
    }

    let (Some(method), Some(target), Some(minor)) = (parsed.method, parsed.path, parsed.version) else {
        return Err(HttpError::Malformed("incomplete request line".to_string()));
    };

    let headers = parsed
        .headers
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| HttpError::Malformed(format!("header {} is not UTF-8", h.name)))?;
            Ok((h.name.to_string(), value.trim().to_string()))
        })
        .collect::<Result<Vec<_>, HttpError>>()?;

    Ok(Some(Request {
        method: method.to_string(),
        target: target.to_string(),
        version: format!("HTTP/1.{minor}"),
        headers,
    }))
}

/// Buffers bytes up to and including the blank line that ends the head,
/// consuming nothing past it.
fn read_head<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>, HttpError> {
    let mut head: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::Io(io::ErrorKind::UnexpectedEof.into()));
        }

        if head.is_empty() {
            let blank = available.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
            if blank > 0 {
                reader.consume(blank);
                continue;
            }
        }

        let searched_from = head.len().saturating_sub(3);
        let before = head.len();
        head.extend_from_slice(available);

        match find_head_end(&head, searched_from) {
            Some(end) => {
                reader.consume(end - before);
                head.truncate(end);
                if end > MAX_HEAD_LEN {
                    return Err(HttpError::HeaderTooLarge);
                }
                return Ok(Some(head));
            }
            None => {
                let taken = head.len() - before;
                reader.consume(taken);
                if head.len() > MAX_HEAD_LEN {
                    return Err(HttpError::HeaderTooLarge);
                }
            }
        }
    }
}

/// Index just past the first `\n\n` or `\n\r\n` at or after `from`.
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find_map(|i| {
        if buf[i] != b'\n' {
            return None;
        }
        match (buf.get(i + 1), buf.get(i + 2)) {
            (Some(b'\n'), _) => Some(i + 2),
            (Some(b'\r'), Some(b'\n')) => Some(i + 3),
            _ => None,
        }
    })
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// A complete response with an in-memory body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.with_header("Content-Type", content_type)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found").with_body("text/plain; charset=utf-8", "404 Not Found\n")
    }

    pub fn bad_request(detail: &str) -> Self {
        Self::new(400, "Bad Request")
            .with_body("text/plain; charset=utf-8", format!("400 Bad Request: {detail}\n"))
    }

    pub fn forbidden() -> Self {
        Self::new(403, "Forbidden").with_body("text/plain; charset=utf-8", "403 Forbidden\n")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed")
            .with_header("Allow", "GET, HEAD")
            .with_body("text/plain; charset=utf-8", "405 Method Not Allowed\n")
    }

    pub fn unauthorized(realm: &str) -> Self {
        Self::new(401, "Unauthorized")
            .with_header("WWW-Authenticate", format!("Basic realm=\"{realm}\""))
            .with_body("text/plain; charset=utf-8", "401 Unauthorized\n")
    }

    /// Writes the status line, headers (plus `Server`, `Content-Length` and
    /// `Connection`) and, unless `head_only`, the body.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W, head_only: bool, keep_alive: bool) -> io::Result<()> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        head.push_str(&format!("Server: {SERVER_NAME}\r\n"));
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head.push_str("\r\n");

        writer.write_all(head.as_bytes())?;
        if !head_only {
            writer.write_all(&self.body)?;
        }
        writer.flush()
    }
}

// ── Static files ──────────────────────────────────────────────────────────────

/// Serves `request_path` from under `root`.
///
/// Directories resolve to `default_file`.  Paths containing `..` segments or
/// that fail to percent-decode are answered with 404, as are missing files.
pub fn serve_static(root: &Path, default_file: &str, request_path: &str) -> Response {
    let Some(mut path) = resolve_path(root, request_path) else {
        return Response::not_found();
    };
    if path.is_dir() {
        path.push(default_file);
    }

    match fs::read(&path) {
        Ok(body) => Response::new(200, "OK")
            .with_header("Cache-Control", NO_CACHE)
            .with_body(content_type_for(&path), body),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Response::forbidden(),
        Err(_) => Response::not_found(),
    }
}

/// Maps a URL path onto the filesystem under `root`, refusing traversal.
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(request_path)?;
    let mut path = root.to_path_buf();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

/// Decodes `%XX` escapes.  Returns `None` on a bad escape or non-UTF-8 result.
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let value = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// `Content-Type` for a file, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

// ── Authentication ────────────────────────────────────────────────────────────

/// `true` if `request` carries the expected `Authorization: Basic ...` header.
pub fn check_basic_auth(request: &Request, auth: &BasicAuth) -> bool {
    request
        .header("Authorization")
        .is_some_and(|v| v == auth.header_value())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
