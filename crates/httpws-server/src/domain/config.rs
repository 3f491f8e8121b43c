//! Server configuration types and TOML loading.
//!
//! [`ServerConfig`] is the single source of truth for runtime settings.  It is
//! built once at startup, from defaults, then an optional TOML file, then CLI
//! flags, and shared read-only afterwards.
//!
//! Example file:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8000
//! web_root = "website"
//! ws_path = "/ws"
//!
//! [websocket]
//! max_payload_len = 1048576
//! status_interval_ms = 500
//!
//! [auth]
//! username = "robot"
//! password = "secret"
//!
//! [tls]
//! cert = "certs/server.crt"
//! key = "certs/server.key"
//! ```
//!
//! Every field is optional; absent fields keep their defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use httpws_core::protocol::frame::DEFAULT_MAX_PAYLOAD_LEN;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The bind host and port do not form a socket address.
    #[error("invalid bind address: '{0}'")]
    InvalidAddress(String),

    /// The WebSocket path does not start with '/'.
    #[error("invalid websocket path: '{0}' (must start with '/')")]
    InvalidPath(String),

    /// Credentials are not in `user:password` form.
    #[error("credentials must be given as user:password")]
    InvalidCredentials,
}

// ── Runtime configuration ─────────────────────────────────────────────────────

/// PEM files for serving over TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    /// Certificate chain, leaf first.
    pub cert: PathBuf,
    /// Private key (PKCS#8, PKCS#1 or SEC1).
    pub key: PathBuf,
}

/// Credentials for optional HTTP Basic authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
    /// Realm announced in `WWW-Authenticate`.
    pub realm: String,
}

impl BasicAuth {
    pub const DEFAULT_REALM: &'static str = "httpws";

    /// Parses `user:password`.  The password may itself contain ':'.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCredentials`] if there is no ':' or the
    /// user name is empty.
    pub fn from_credentials(credentials: &str) -> Result<Self, ConfigError> {
        match credentials.split_once(':') {
            Some((user, pass)) if !user.is_empty() => Ok(Self {
                username: user.to_string(),
                password: pass.to_string(),
                realm: Self::DEFAULT_REALM.to_string(),
            }),
            _ => Err(ConfigError::InvalidCredentials),
        }
    }

    /// The exact `Authorization` header value a client must send.
    pub fn header_value(&self) -> String {
        format!("Basic {}", B64.encode(format!("{}:{}", self.username, self.password)))
    }
}

/// All runtime configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub bind_addr: SocketAddr,
    /// Directory static files are served from.
    pub web_root: PathBuf,
    /// Request path that is upgraded to WebSocket.
    pub ws_path: String,
    /// File served for directory requests.
    pub default_file: String,
    /// How often the status snapshot is pushed to clients; `None` disables it.
    pub status_interval: Option<Duration>,
    /// Largest WebSocket payload accepted from a client.
    pub max_payload_len: usize,
    /// Socket read timeout; `None` blocks until the peer closes.
    pub read_timeout: Option<Duration>,
    /// Optional HTTP Basic authentication for every request.
    pub auth: Option<BasicAuth>,
    /// Serve `https`/`wss` with these files; `None` serves plain TCP.
    pub tls: Option<TlsPaths>,
}

impl Default for ServerConfig {
    /// | Field            | Default         |
    /// |------------------|-----------------|
    /// | bind_addr        | `0.0.0.0:8000`  |
    /// | web_root         | `website`       |
    /// | ws_path          | `/ws`           |
    /// | default_file     | `index.html`    |
    /// | status_interval  | 1 second        |
    /// | max_payload_len  | 16 MiB          |
    /// | read_timeout     | none            |
    /// | auth             | none            |
    /// | tls              | none            |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            web_root: PathBuf::from("website"),
            ws_path: "/ws".to_string(),
            default_file: "index.html".to_string(),
            status_interval: Some(Duration::from_secs(1)),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            read_timeout: None,
            auth: None,
            tls: None,
        }
    }
}

// ── File configuration ────────────────────────────────────────────────────────

/// On-disk configuration.  Every field falls back to the [`ServerConfig`]
/// default when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub auth: Option<AuthSection>,
    #[serde(default)]
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_file")]
    pub default_file: String,
    /// 0 disables the read timeout.
    #[serde(default)]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketSection {
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
    /// 0 disables the status broadcast.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    pub username: String,
    pub password: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_web_root() -> PathBuf {
    PathBuf::from("website")
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_file() -> String {
    "index.html".to_string()
}

fn default_max_payload_len() -> usize {
    DEFAULT_MAX_PAYLOAD_LEN
}

fn default_status_interval_ms() -> u64 {
    1000
}

fn default_realm() -> String {
    BasicAuth::DEFAULT_REALM.to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
            ws_path: default_ws_path(),
            default_file: default_file(),
            read_timeout_secs: 0,
        }
    }
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_payload_len: default_max_payload_len(),
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

impl FileConfig {
    /// Parses TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Validates the file values and converts them to a [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] or [`ConfigError::InvalidPath`].
    pub fn into_server_config(self) -> Result<ServerConfig, ConfigError> {
        let addr_text = format!("{}:{}", self.server.bind, self.server.port);
        let bind_addr: SocketAddr = addr_text
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr_text.clone()))?;

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.server.ws_path));
        }

        Ok(ServerConfig {
            bind_addr,
            web_root: self.server.web_root,
            ws_path: self.server.ws_path,
            default_file: self.server.default_file,
            status_interval: millis_or_none(self.websocket.status_interval_ms),
            max_payload_len: self.websocket.max_payload_len,
            read_timeout: match self.server.read_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            auth: self.auth.map(|a| BasicAuth {
                username: a.username,
                password: a.password,
                realm: a.realm,
            }),
            tls: self.tls,
        })
    }
}

/// Converts a millisecond count to a duration, treating 0 as "disabled".
pub fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Reads and parses a TOML config file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read, or
/// [`ConfigError::Parse`] if it is not valid TOML for [`FileConfig`].
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    FileConfig::from_toml_str(&text)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
