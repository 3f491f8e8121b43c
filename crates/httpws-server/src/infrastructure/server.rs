//! HTTP listener: accept loop and per-connection workers.
//!
//! The accept loop runs on tokio.  Every accepted socket is converted to a
//! blocking `std::net::TcpStream`, registered for shutdown and handed to its
//! own OS thread.  WebSocket connections live for as long as the client
//! stays, so workers are not drawn from tokio's bounded blocking pool.
//!
//! The worker runs the TLS handshake when TLS is configured, then speaks
//! HTTP/1.1 (keep-alive) until the client asks for an upgrade on the
//! WebSocket path; from then on the same worker owns the connection's
//! receive loop until it closes.
//!
//! Shutdown: when `running` is cleared the accept loop stops and every
//! registered socket is shut down, so blocked reads return and the workers
//! exit.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use httpws_core::protocol::handshake::write_response;
use httpws_core::{negotiate, Connection, Negotiation, WsHandler};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::domain::config::ServerConfig;
use crate::infrastructure::http::{check_basic_auth, read_request, serve_static, HttpError, Request, Response};
use crate::infrastructure::stream::{split, StreamReader, StreamWriter};
use crate::infrastructure::tls;

/// How long one `accept()` waits before the shutdown flag is re-checked.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds the HTTP listener on `addr`.
///
/// # Errors
///
/// Returns an error if the address is in use or cannot be bound.
pub async fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))
}

/// Binds `config.bind_addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(
    config: ServerConfig,
    handler: Arc<dyn WsHandler>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = bind_listener(config.bind_addr).await?;
    serve(listener, config, handler, running).await
}

/// Runs the accept loop on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the TLS certificate or key cannot be loaded.  Accept
/// errors are logged and the loop continues.
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn WsHandler>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let tls = match &config.tls {
        Some(paths) => Some(tls::load_server_config(paths).with_context(|| {
            format!("failed to load TLS certificate {}", paths.cert.display())
        })?),
        None => None,
    };

    let scheme = if tls.is_some() { "https" } else { "http" };
    match listener.local_addr() {
        Ok(addr) => info!(
            "listening on {scheme}://{addr} (websocket path {}, web root {})",
            config.ws_path,
            config.web_root.display()
        ),
        Err(e) => warn!("listening (local address unavailable: {e})"),
    }

    let ctx = Arc::new(ServerContext {
        config,
        handler,
        tls,
        sockets: Arc::new(SocketRegistry::default()),
    });

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("accepted connection from {peer}");
                let stream = match stream.into_std() {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to take ownership of socket from {peer}: {e}");
                        continue;
                    }
                };
                spawn_worker(&ctx, stream, peer);
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {
                // No connection within ACCEPT_POLL; re-check the flag.
            }
        }
    }

    let open = ctx.sockets.shutdown_all();
    if open > 0 {
        info!("shut down {open} open connection(s)");
    }
    Ok(())
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct ServerContext {
    config: ServerConfig,
    handler: Arc<dyn WsHandler>,
    tls: Option<Arc<rustls::ServerConfig>>,
    sockets: Arc<SocketRegistry>,
}

/// Handles on every accepted socket still open, for shutdown.
#[derive(Default)]
struct SocketRegistry {
    next_id: AtomicU64,
    sockets: Mutex<HashMap<u64, TcpStream>>,
}

impl SocketRegistry {
    /// Keeps a clone of `stream` until the returned guard is dropped.
    fn track(self: &Arc<Self>, stream: &TcpStream) -> io::Result<SocketGuard> {
        let clone = stream.try_clone()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, clone);
        Ok(SocketGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn shutdown_all(&self) -> usize {
        let sockets: Vec<TcpStream> = self.lock().drain().map(|(_, s)| s).collect();
        for s in &sockets {
            let _ = s.shutdown(Shutdown::Both);
        }
        sockets.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SocketGuard {
    registry: Arc<SocketRegistry>,
    id: u64,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

// ── Per-connection worker ─────────────────────────────────────────────────────

/// Registers `stream` for shutdown and starts its worker thread.
///
/// The socket is tracked before the thread exists, so a shutdown that races
/// with a fresh accept still closes it.
fn spawn_worker(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let guard = match ctx.sockets.track(&stream) {
        Ok(guard) => guard,
        Err(e) => {
            error!("failed to register socket from {peer}: {e}");
            return;
        }
    };

    let worker_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("httpws-conn-{peer}"))
        .spawn(move || {
            let _guard = guard;
            handle_connection(stream, peer, &worker_ctx);
        });
    // On failure the closure is dropped, which closes the socket and releases
    // its registration.
    if let Err(e) = spawned {
        error!("failed to spawn worker for {peer}: {e}");
    }
}

/// Entry point of a worker thread.  Logs the outcome.
fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: &ServerContext) {
    if let Err(e) = serve_connection(stream, peer, ctx) {
        debug!("connection from {peer} ended with error: {e:#}");
    } else {
        debug!("connection from {peer} finished");
    }
}

fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: &ServerContext) -> anyhow::Result<()> {
    stream
        .set_nonblocking(false)
        .context("failed to switch socket to blocking mode")?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to disable Nagle for {peer}: {e}");
    }
    stream
        .set_read_timeout(ctx.config.read_timeout)
        .context("failed to set read timeout")?;

    let (reader, mut writer) = split(stream, ctx.tls.as_ref()).context("failed to set up stream")?;
    let mut reader = BufReader::new(reader);

    loop {
        let request = match read_request(&mut reader) {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(HttpError::Io(e)) => {
                debug!("read from {peer} failed: {e}");
                break;
            }
            Err(e) => {
                warn!("bad request from {peer}: {e}");
                Response::bad_request(&e.to_string()).write_to(&mut writer, false, false)?;
                break;
            }
        };

        debug!("{peer} {} {}", request.method, request.target);

        match route(&request, ctx) {
            Route::Respond(response) => {
                let keep_alive = request.keep_alive();
                response.write_to(&mut writer, request.method == "HEAD", keep_alive)?;
                if !keep_alive {
                    break;
                }
            }
            Route::Reject(response) => {
                response.write_to(&mut writer, false, false)?;
                break;
            }
            Route::Upgrade { accept } => {
                // The socket belongs to the WebSocket connection until it closes.
                upgrade(&mut writer, &mut reader, &accept, peer, ctx)?;
                break;
            }
        }
    }

    writer.shutdown().ok();
    Ok(())
}

/// How one request is answered.
#[derive(Debug)]
enum Route {
    /// Write the response; honour keep-alive.
    Respond(Response),
    /// Write the response and close the connection.
    Reject(Response),
    /// Complete the WebSocket handshake.
    Upgrade { accept: String },
}

fn route(request: &Request, ctx: &ServerContext) -> Route {
    let config = &ctx.config;

    if let Some(auth) = &config.auth {
        if !check_basic_auth(request, auth) {
            debug!("rejecting unauthenticated request for {}", request.target);
            return Route::Respond(Response::unauthorized(&auth.realm));
        }
    }

    if request.method != "GET" && request.method != "HEAD" {
        return Route::Reject(Response::method_not_allowed());
    }

    if request.path() == config.ws_path && request.method == "GET" {
        match negotiate(&request.handshake()) {
            Ok(Negotiation::Upgrade { accept }) => return Route::Upgrade { accept },
            Ok(Negotiation::NotRequested) => {}
            Err(e) => return Route::Reject(Response::bad_request(&e.to_string())),
        }
    }

    Route::Respond(serve_static(&config.web_root, &config.default_file, request.path()))
}

/// Sends the 101 response and runs the WebSocket connection on this worker
/// until it closes.
fn upgrade(
    writer: &mut StreamWriter,
    reader: &mut BufReader<StreamReader>,
    accept: &str,
    peer: SocketAddr,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    write_response(writer, accept).context("failed to send handshake response")?;

    let ws_writer = writer.try_clone().context("failed to clone stream for websocket")?;
    let conn = Arc::new(
        Connection::new(ws_writer, Arc::clone(&ctx.handler))
            .with_peer(peer.to_string())
            .with_max_payload_len(ctx.config.max_payload_len),
    );

    info!(conn = %conn.id(), "websocket opened for {peer}");
    if conn.open() {
        conn.run(reader);
    }
    info!(conn = %conn.id(), state = ?conn.state(), "websocket from {peer} finished");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::BasicAuth;
    use httpws_core::HandlerError;

    struct Nop;

    impl WsHandler for Nop {
        fn on_message(&self, _: &Arc<Connection>, _: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn ctx(config: ServerConfig) -> ServerContext {
        ServerContext {
            config,
            handler: Arc::new(Nop),
            tls: None,
            sockets: Arc::new(SocketRegistry::default()),
        }
    }

    fn request(method: &str, target: &str, headers: &[(&str, &str)]) -> Request {
        Request {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_route_upgrade_on_ws_path() {
        // Arrange
        let ctx = ctx(ServerConfig::default());
        let req = request(
            "GET",
            "/ws",
            &[("Upgrade", "websocket"), ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")],
        );

        // Act
        let route = route(&req, &ctx);

        // Assert
        match route {
            Route::Upgrade { accept } => assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[test]
    fn test_route_missing_key_is_rejected() {
        let ctx = ctx(ServerConfig::default());
        let req = request("GET", "/ws", &[("Upgrade", "websocket")]);

        match route(&req, &ctx) {
            Route::Reject(resp) => assert_eq!(resp.status, 400),
            other => panic!("expected 400, got {other:?}"),
        }
    }

    #[test]
    fn test_route_upgrade_elsewhere_falls_through_to_static() {
        let ctx = ctx(ServerConfig::default());
        let req = request(
            "GET",
            "/other",
            &[("Upgrade", "websocket"), ("Sec-WebSocket-Key", "abc")],
        );

        assert!(matches!(route(&req, &ctx), Route::Respond(_)));
    }

    #[test]
    fn test_route_post_is_method_not_allowed() {
        let ctx = ctx(ServerConfig::default());
        match route(&request("POST", "/", &[]), &ctx) {
            Route::Reject(resp) => assert_eq!(resp.status, 405),
            other => panic!("expected 405, got {other:?}"),
        }
    }

    #[test]
    fn test_route_requires_auth_when_configured() {
        // Arrange
        let auth = BasicAuth::from_credentials("robot:secret").unwrap();
        let header = auth.header_value();
        let ctx = ctx(ServerConfig {
            auth: Some(auth),
            ..ServerConfig::default()
        });

        // Act
        let anonymous = route(&request("GET", "/ws", &[("Upgrade", "websocket")]), &ctx);
        let authed = route(
            &request(
                "GET",
                "/ws",
                &[
                    ("Authorization", header.as_str()),
                    ("Upgrade", "websocket"),
                    ("Sec-WebSocket-Key", "abc"),
                ],
            ),
            &ctx,
        );

        // Assert
        match anonymous {
            Route::Respond(resp) => {
                assert_eq!(resp.status, 401);
                assert_eq!(resp.header("WWW-Authenticate"), Some("Basic realm=\"httpws\""));
            }
            other => panic!("expected 401, got {other:?}"),
        }
        assert!(matches!(authed, Route::Upgrade { .. }));
    }

    #[test]
    fn test_socket_registry_tracks_and_releases() {
        // Arrange
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let registry = Arc::new(SocketRegistry::default());

        // Act / Assert
        {
            let _guard = registry.track(&client).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
        let _guard = registry.track(&client).unwrap();
        assert_eq!(registry.shutdown_all(), 1);
    }

    #[test]
    fn test_spawn_worker_registers_before_returning() {
        // Arrange: an idle client whose worker blocks reading the request
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        let ctx = Arc::new(ctx(ServerConfig::default()));

        // Act
        spawn_worker(&ctx, accepted, peer);

        // Assert: tracked immediately, and shutting down reaches the client
        assert_eq!(ctx.sockets.len(), 1);
        assert_eq!(ctx.sockets.shutdown_all(), 1);
        let mut buf = [0u8; 16];
        assert_eq!(io::Read::read(&mut client, &mut buf).unwrap(), 0);
    }
}
