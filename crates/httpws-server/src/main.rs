//! httpws server: entry point.
//!
//! Serves a directory of static files over HTTP/1.1 and upgrades requests on
//! the WebSocket path in place.  Connected clients get a JSON status snapshot
//! on connect and on every status tick, their messages echoed back, and a
//! `next` token after every message.
//!
//! # Usage
//!
//! ```text
//! httpws-server [OPTIONS]
//!
//! Options:
//!   --config <FILE>               TOML configuration file
//!   --bind <ADDR>                 Address to bind [default: 0.0.0.0]
//!   --port <PORT>                 HTTP port [default: 8000]
//!   --web-root <DIR>              Static file directory [default: website]
//!   --ws-path <PATH>              WebSocket upgrade path [default: /ws]
//!   --status-interval-ms <MS>     Status broadcast period, 0 disables [default: 1000]
//!   --max-payload <BYTES>         Largest accepted WebSocket payload
//!   --credentials <USER:PASS>     Require HTTP Basic authentication
//!   --tls-cert <FILE>             PEM certificate chain; serve https/wss
//!   --tls-key <FILE>              PEM private key for --tls-cert
//! ```
//!
//! # Precedence
//!
//! Built-in defaults, then the config file, then CLI flags or their
//! environment variables.
//!
//! | Variable              | Flag                   |
//! |-----------------------|------------------------|
//! | `HTTPWS_CONFIG`       | `--config`             |
//! | `HTTPWS_BIND`         | `--bind`               |
//! | `HTTPWS_PORT`         | `--port`               |
//! | `HTTPWS_WEB_ROOT`     | `--web-root`           |
//! | `HTTPWS_CREDENTIALS`  | `--credentials`        |
//! | `HTTPWS_TLS_CERT`     | `--tls-cert`           |
//! | `HTTPWS_TLS_KEY`      | `--tls-key`            |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use httpws_server::application::{run_status_loop, EchoApp, Hub, StatusBroadcaster};
use httpws_server::domain::config::millis_or_none;
use httpws_server::domain::{load_config, BasicAuth, FileConfig, ServerConfig, TlsPaths};
use httpws_server::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Static file server with a WebSocket endpoint.
///
/// Every flag is optional; unset flags fall back to the config file and then
/// to built-in defaults.
#[derive(Debug, Parser)]
#[command(
    name = "httpws-server",
    about = "HTTP/1.1 static file server with a WebSocket endpoint",
    version
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "HTTPWS_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to bind.
    #[arg(long, env = "HTTPWS_BIND")]
    bind: Option<IpAddr>,

    /// TCP port to listen on.
    #[arg(long, env = "HTTPWS_PORT")]
    port: Option<u16>,

    /// Directory static files are served from.
    #[arg(long, env = "HTTPWS_WEB_ROOT")]
    web_root: Option<PathBuf>,

    /// Request path upgraded to WebSocket.
    #[arg(long)]
    ws_path: Option<String>,

    /// Status broadcast period in milliseconds; 0 disables it.
    #[arg(long)]
    status_interval_ms: Option<u64>,

    /// Largest WebSocket payload accepted from a client, in bytes.
    #[arg(long)]
    max_payload: Option<usize>,

    /// Require HTTP Basic authentication, given as `user:password`.
    #[arg(long, env = "HTTPWS_CREDENTIALS", hide_env_values = true)]
    credentials: Option<String>,

    /// PEM certificate chain; enables TLS together with `--tls-key`.
    #[arg(long, env = "HTTPWS_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    #[arg(long, env = "HTTPWS_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

impl Cli {
    /// Layers the config file (if any) and the CLI flags over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or a value is
    /// invalid.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
                .into_server_config()?,
            None => FileConfig::default().into_server_config()?,
        };

        if let Some(ip) = self.bind {
            config.bind_addr = SocketAddr::new(ip, config.bind_addr.port());
        }
        if let Some(port) = self.port {
            config.bind_addr.set_port(port);
        }
        if let Some(root) = self.web_root {
            config.web_root = root;
        }
        if let Some(path) = self.ws_path {
            anyhow::ensure!(path.starts_with('/'), "--ws-path must start with '/', got '{path}'");
            config.ws_path = path;
        }
        if let Some(ms) = self.status_interval_ms {
            config.status_interval = millis_or_none(ms);
        }
        if let Some(max) = self.max_payload {
            config.max_payload_len = max;
        }
        if let Some(credentials) = self.credentials {
            config.auth = Some(BasicAuth::from_credentials(&credentials)?);
        }
        match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => config.tls = Some(TlsPaths { cert, key }),
            (None, None) => {}
            _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
        }

        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_server_config()?;

    info!(
        "httpws server starting: bind={}, web_root={}, ws_path={}, auth={}, tls={}",
        config.bind_addr,
        config.web_root.display(),
        config.ws_path,
        if config.auth.is_some() { "basic" } else { "off" },
        if config.tls.is_some() { "on" } else { "off" }
    );

    let hub = Arc::new(Hub::new());
    let status = Arc::new(StatusBroadcaster::new(Arc::clone(&hub)));
    let app = Arc::new(EchoApp::new(Arc::clone(&hub), Arc::clone(&status)));

    let running = Arc::new(AtomicBool::new(true));

    if let Some(period) = config.status_interval {
        tokio::spawn(run_status_loop(status, period, Arc::clone(&running)));
    }

    let running_clone = Arc::clone(&running);
    let hub_clone = Arc::clone(&hub);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; closing {} websocket(s)", hub_clone.len());
                running_clone.store(false, Ordering::Relaxed);
                // Close frames are blocking socket writes.
                let _ = tokio::task::spawn_blocking(move || {
                    for conn in hub_clone.snapshot() {
                        conn.close();
                    }
                })
                .await;
            }
            Err(e) => {
                error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, app, running).await?;

    info!("httpws server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["httpws-server"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    fn empty_cli() -> Cli {
        Cli {
            config: None,
            bind: None,
            port: None,
            web_root: None,
            ws_path: None,
            status_interval_ms: None,
            max_payload: None,
            credentials: None,
            tls_cert: None,
            tls_key: None,
        }
    }

    #[test]
    fn test_no_flags_gives_defaults() {
        // Arrange
        let cli = empty_cli();

        // Act
        let config = cli.into_server_config().unwrap();

        // Assert
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.status_interval, Some(Duration::from_secs(1)));
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_cli_port_override() {
        let cli = cli(&["--port", "9001"]);
        assert_eq!(cli.port, Some(9001));
    }

    #[test]
    fn test_bind_and_port_combine() {
        let cli = Cli {
            bind: Some("127.0.0.1".parse().unwrap()),
            port: Some(9002),
            ..empty_cli()
        };
        let config = cli.into_server_config().unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9002");
    }

    #[test]
    fn test_status_interval_zero_disables() {
        let cli = Cli {
            status_interval_ms: Some(0),
            ..empty_cli()
        };
        assert_eq!(cli.into_server_config().unwrap().status_interval, None);
    }

    #[test]
    fn test_credentials_enable_auth() {
        let cli = Cli {
            credentials: Some("robot:secret".to_string()),
            ..empty_cli()
        };
        let auth = cli.into_server_config().unwrap().auth.unwrap();
        assert_eq!(auth.username, "robot");
        assert_eq!(auth.password, "secret");
    }

    #[test]
    fn test_bad_credentials_return_error() {
        let cli = Cli {
            credentials: Some("no-colon".to_string()),
            ..empty_cli()
        };
        assert!(cli.into_server_config().is_err());
    }

    #[test]
    fn test_bad_ws_path_returns_error() {
        let cli = Cli {
            ws_path: Some("ws".to_string()),
            ..empty_cli()
        };
        assert!(cli.into_server_config().is_err());
    }

    #[test]
    fn test_tls_flags_enable_tls() {
        // Arrange
        let cli = cli(&["--tls-cert", "server.crt", "--tls-key", "server.key"]);

        // Act
        let tls = cli.into_server_config().unwrap().tls.unwrap();

        // Assert
        assert_eq!(tls.cert, PathBuf::from("server.crt"));
        assert_eq!(tls.key, PathBuf::from("server.key"));
    }

    #[test]
    fn test_tls_cert_without_key_returns_error() {
        let cli = Cli {
            tls_cert: Some(PathBuf::from("server.crt")),
            ..empty_cli()
        };
        assert!(cli.into_server_config().is_err());
    }

    #[test]
    fn test_missing_config_file_returns_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/definitely/not/here.toml")),
            ..empty_cli()
        };
        assert!(cli.into_server_config().is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        // Arrange
        let path = std::env::temp_dir().join(format!("httpws-cli-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[server]\nport = 7000\nws_path = \"/events\"\n[websocket]\nstatus_interval_ms = 250\n",
        )
        .unwrap();
        let cli = Cli {
            config: Some(path.clone()),
            port: Some(7001),
            ..empty_cli()
        };

        // Act
        let config = cli.into_server_config().unwrap();

        // Assert: file values apply, the flag wins where both are set
        assert_eq!(config.bind_addr.port(), 7001);
        assert_eq!(config.ws_path, "/events");
        assert_eq!(config.status_interval, Some(Duration::from_millis(250)));
        std::fs::remove_file(path).ok();
    }
}
