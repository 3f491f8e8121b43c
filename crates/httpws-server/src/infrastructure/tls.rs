//! Optional TLS for the listener (rustls, blocking).
//!
//! A WebSocket connection reads on its worker thread while other threads
//! send, so one TLS session has to serve a blocked reader and concurrent
//! writers.  The session state lives behind a mutex together with the write
//! half of the socket; the reader owns its own clone of the socket and only
//! takes the mutex after raw bytes arrived, never while blocked in `read`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustls::{ServerConfig as RustlsConfig, ServerConnection};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::domain::config::TlsPaths;

/// Raw ciphertext read per socket read.  Kept well below rustls' plaintext
/// buffer limit; plaintext is drained before more ciphertext is fed.
const RAW_READ_LEN: usize = 4096;

/// Errors while building the TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read or parsed.
    #[error("failed to load PEM from {path}: {message}")]
    Pem { path: PathBuf, message: String },

    /// The certificate file contained no certificate.
    #[error("no certificate found in {0}")]
    NoCertificates(PathBuf),

    /// rustls rejected the certificate, the key or the protocol setup.
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

fn pem_error(path: &Path, e: rustls_pki_types::pem::Error) -> TlsError {
    TlsError::Pem {
        path: path.to_path_buf(),
        message: format!("{e:?}"),
    }
}

/// Loads the certificate chain and private key and builds the server config.
///
/// # Errors
///
/// See [`TlsError`].
pub fn load_server_config(paths: &TlsPaths) -> Result<Arc<RustlsConfig>, TlsError> {
    let certs = CertificateDer::pem_file_iter(&paths.cert)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| pem_error(&paths.cert, e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(paths.cert.clone()));
    }
    let key = PrivateKeyDer::from_pem_file(&paths.key).map_err(|e| pem_error(&paths.key, e))?;

    let mut config = RustlsConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

// ── Session ───────────────────────────────────────────────────────────────────

struct TlsSession {
    conn: ServerConnection,
    /// Write half; every ciphertext write goes through here.
    tcp: TcpStream,
}

impl TlsSession {
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.tcp)?;
        }
        Ok(())
    }
}

fn lock(session: &Mutex<TlsSession>) -> MutexGuard<'_, TlsSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs the server handshake on `tcp` and splits the session.
///
/// # Errors
///
/// Returns the socket error, or `InvalidData` when the handshake fails.
pub fn accept(config: Arc<RustlsConfig>, tcp: TcpStream) -> io::Result<(TlsReader, TlsWriter)> {
    let mut conn = ServerConnection::new(config).map_err(io::Error::other)?;

    let mut io = &tcp;
    while conn.is_handshaking() {
        let (read, written) = conn.complete_io(&mut io)?;
        if read == 0 && written == 0 && conn.is_handshaking() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }

    let reader_tcp = tcp.try_clone()?;
    let session = Arc::new(Mutex::new(TlsSession { conn, tcp }));
    lock(&session).flush_tls()?;

    Ok((
        TlsReader {
            session: Arc::clone(&session),
            tcp: reader_tcp,
            raw: vec![0; RAW_READ_LEN],
        },
        TlsWriter { session },
    ))
}

/// Plaintext read half of a TLS session.
pub struct TlsReader {
    session: Arc<Mutex<TlsSession>>,
    tcp: TcpStream,
    raw: Vec<u8>,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match lock(&self.session).conn.reader().read(buf) {
                // 0 here means the peer sent close_notify.
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            let n = self.tcp.read(&mut self.raw)?;
            if n == 0 {
                return Ok(0);
            }

            let mut session = lock(&self.session);
            let mut ciphertext = &self.raw[..n];
            while !ciphertext.is_empty() {
                session.conn.read_tls(&mut ciphertext)?;
                if let Err(e) = session.conn.process_new_packets() {
                    // Send the alert rustls queued before giving up.
                    let _ = session.flush_tls();
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
            session.flush_tls()?;
        }
    }
}

/// Plaintext write half of a TLS session.  Clones share the session.
#[derive(Clone)]
pub struct TlsWriter {
    session: Arc<Mutex<TlsSession>>,
}

impl TlsWriter {
    /// Sends `close_notify` and shuts the socket down.
    pub fn shutdown(&self) -> io::Result<()> {
        let mut session = lock(&self.session);
        session.conn.send_close_notify();
        let _ = session.flush_tls();
        session.tcp.shutdown(Shutdown::Both)
    }
}

impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut session = lock(&self.session);
        let n = session.conn.writer().write(buf)?;
        session.flush_tls()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut session = lock(&self.session);
        session.conn.writer().flush()?;
        session.flush_tls()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
