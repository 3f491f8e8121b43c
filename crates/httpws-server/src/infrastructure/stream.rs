//! Plain or TLS halves of an accepted socket.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use crate::infrastructure::tls::{self, TlsReader, TlsWriter};

/// Read half handed to the HTTP parser and then the WebSocket receive loop.
pub enum StreamReader {
    Plain(TcpStream),
    Tls(TlsReader),
}

/// Write half; clones go to the WebSocket connection.
pub enum StreamWriter {
    Plain(TcpStream),
    Tls(TlsWriter),
}

/// Splits `tcp`, running the TLS handshake first when `tls` is set.
///
/// # Errors
///
/// Returns the socket or handshake error.
pub fn split(
    tcp: TcpStream,
    tls: Option<&Arc<rustls::ServerConfig>>,
) -> io::Result<(StreamReader, StreamWriter)> {
    match tls {
        Some(config) => {
            let (reader, writer) = tls::accept(Arc::clone(config), tcp)?;
            Ok((StreamReader::Tls(reader), StreamWriter::Tls(writer)))
        }
        None => {
            let writer = tcp.try_clone()?;
            Ok((StreamReader::Plain(tcp), StreamWriter::Plain(writer)))
        }
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamReader::Plain(s) => s.read(buf),
            StreamReader::Tls(s) => s.read(buf),
        }
    }
}

impl StreamWriter {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            StreamWriter::Plain(s) => Ok(StreamWriter::Plain(s.try_clone()?)),
            StreamWriter::Tls(s) => Ok(StreamWriter::Tls(s.clone())),
        }
    }

    /// Closes both directions; TLS sends `close_notify` first.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            StreamWriter::Plain(s) => s.shutdown(Shutdown::Both),
            StreamWriter::Tls(s) => s.shutdown(),
        }
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamWriter::Plain(s) => s.write(buf),
            StreamWriter::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamWriter::Plain(s) => s.flush(),
            StreamWriter::Tls(s) => s.flush(),
        }
    }
}
