//! Integration tests for the protocol core.
//!
//! These drive a complete connection (handshake, receive loop, sends from
//! other threads, close) through the public API, with in-memory byte streams
//! standing in for the socket.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use httpws_core::protocol::frame::{apply_mask, encode_frame, Opcode, LEN_16, LEN_64};
use httpws_core::protocol::handshake::{negotiate, write_response, HandshakeRequest, Negotiation};
use httpws_core::{Connection, ConnectionState, HandlerError, WsHandler};

// ── Test plumbing ─────────────────────────────────────────────────────────────

/// Blocking reader fed chunk by chunk from another thread.  Dropping the
/// sender is seen as end-of-stream.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelReader {
    fn pair() -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            Self {
                rx,
                pending: Vec::new(),
            },
        )
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Write in two halves to give other writers a chance to interleave
        // if the connection did not serialize frames.
        let mid = buf.len() / 2;
        self.0.lock().unwrap().extend_from_slice(&buf[..mid]);
        thread::yield_now();
        self.0.lock().unwrap().extend_from_slice(&buf[mid..]);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    connected: AtomicUsize,
    closed: AtomicUsize,
    messages: Mutex<Vec<Vec<u8>>>,
}

impl WsHandler for Recorder {
    fn on_connected(&self, _conn: &Arc<Connection>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }
    fn on_message(&self, _conn: &Arc<Connection>, payload: &[u8]) -> Result<(), HandlerError> {
        self.messages.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
    fn on_closed(&self, _conn: &Connection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let key = [0xDE, 0xAD, 0xBE, 0xEF];
    let server = encode_frame(opcode, payload);
    let header_len = server.len() - payload.len();
    let mut out = server[..header_len].to_vec();
    out[1] |= 0x80;
    out.extend_from_slice(&key);
    let mut masked = payload.to_vec();
    apply_mask(&mut masked, key);
    out.extend_from_slice(&masked);
    out
}

/// Splits a stream of unmasked server frames into (opcode, payload) pairs.
fn parse_server_frames(mut bytes: &[u8]) -> Vec<(Opcode, Vec<u8>)> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        assert_eq!(bytes[0] & 0x80, 0x80, "FIN must always be set");
        assert_eq!(bytes[1] & 0x80, 0, "server frames are never masked");
        let opcode = Opcode::from_bits(bytes[0]);
        let (len, header) = match bytes[1] {
            LEN_16 => (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4),
            LEN_64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[2..10]);
                (u64::from_be_bytes(raw) as usize, 10)
            }
            n => (n as usize, 2),
        };
        frames.push((opcode, bytes[header..header + len].to_vec()));
        bytes = &bytes[header + len..];
    }
    frames
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_handshake_then_open_then_echo_then_close() {
    // Arrange: handshake
    let out = SharedBuf::default();
    let request = HandshakeRequest {
        upgrade: Some("websocket"),
        key: Some("dGhlIHNhbXBsZSBub25jZQ=="),
    };
    let accept = match negotiate(&request).unwrap() {
        Negotiation::Upgrade { accept } => accept,
        Negotiation::NotRequested => panic!("upgrade expected"),
    };
    write_response(&mut out.clone(), &accept).unwrap();
    let head_len = out.bytes().len();
    assert!(String::from_utf8(out.bytes())
        .unwrap()
        .contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    let handler = Arc::new(Recorder::default());
    let conn = Arc::new(Connection::new(out.clone(), handler.clone()).with_peer("in-memory"));
    conn.open();

    // Act
    let mut wire = client_frame(Opcode::Text, b"hello");
    wire.extend(client_frame(Opcode::Ping, b"are you there"));
    wire.extend(client_frame(Opcode::Close, &[0x03, 0xE8]));
    conn.run(wire.as_slice());

    // Assert
    assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.messages.lock().unwrap(), vec![b"hello".to_vec()]);
    let frames = parse_server_frames(&out.bytes()[head_len..]);
    assert_eq!(
        frames,
        vec![
            (Opcode::Pong, b"are you there".to_vec()),
            (Opcode::Close, Vec::new()),
        ]
    );
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn test_non_upgrade_request_leaves_connection_pending() {
    // Arrange
    let out = SharedBuf::default();
    let handler = Arc::new(Recorder::default());
    let conn = Arc::new(Connection::new(out.clone(), handler.clone()));
    let request = HandshakeRequest {
        upgrade: None,
        key: None,
    };

    // Act
    let outcome = negotiate(&request).unwrap();

    // Assert: nothing written, nothing opened
    assert_eq!(outcome, Negotiation::NotRequested);
    assert!(out.bytes().is_empty());
    assert!(!conn.is_connected());
    assert_eq!(handler.connected.load(Ordering::SeqCst), 0);
}

#[test]
fn test_local_close_while_receive_loop_blocks() {
    // Arrange: a receive worker blocked on an idle stream
    let out = SharedBuf::default();
    let handler = Arc::new(Recorder::default());
    let conn = Arc::new(Connection::new(out.clone(), handler.clone()));
    conn.open();
    let (tx, reader) = ChannelReader::pair();
    let worker = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.run(reader))
    };
    tx.send(client_frame(Opcode::Text, b"before close")).unwrap();
    thread::sleep(Duration::from_millis(50));

    // Act: another thread closes, then the peer answers with its own close
    conn.close();
    tx.send(client_frame(Opcode::Close, b"")).unwrap();
    worker.join().unwrap();

    // Assert: one teardown, one close frame
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.messages.lock().unwrap(), vec![b"before close".to_vec()]);
    assert_eq!(parse_server_frames(&out.bytes()), vec![(Opcode::Close, Vec::new())]);
}

#[test]
fn test_peer_disconnect_mid_frame_closes_once() {
    let out = SharedBuf::default();
    let handler = Arc::new(Recorder::default());
    let conn = Arc::new(Connection::new(out.clone(), handler.clone()));
    conn.open();
    let (tx, reader) = ChannelReader::pair();
    let worker = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.run(reader))
    };

    let frame = client_frame(Opcode::Binary, &[7u8; 300]);
    tx.send(frame[..100].to_vec()).unwrap();
    drop(tx);
    worker.join().unwrap();

    assert!(handler.messages.lock().unwrap().is_empty());
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    assert!(conn.close_requested());
}

#[test]
fn test_concurrent_senders_never_interleave_frames() {
    // Arrange
    let out = SharedBuf::default();
    let conn = Arc::new(Connection::new(out.clone(), Arc::new(Recorder::default())));
    conn.open();

    // Act: several threads push frames of different sizes at once
    let senders: Vec<_> = (0..8u8)
        .map(|t| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for i in 0..25usize {
                    let payload = vec![t; 1 + (i * 53) % 300];
                    conn.send_binary(&payload).unwrap();
                }
            })
        })
        .collect();
    for s in senders {
        s.join().unwrap();
    }

    // Assert: the byte stream parses into 200 intact frames
    let frames = parse_server_frames(&out.bytes());
    assert_eq!(frames.len(), 8 * 25);
    for (opcode, payload) in frames {
        assert_eq!(opcode, Opcode::Binary);
        let first = payload[0];
        assert!(payload.iter().all(|b| *b == first), "frame bytes were interleaved");
    }
}

#[test]
fn test_broadcast_sender_racing_peer_close() {
    // Arrange
    let out = SharedBuf::default();
    let handler = Arc::new(Recorder::default());
    let conn = Arc::new(Connection::new(out.clone(), handler.clone()));
    conn.open();
    let sender = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            let mut sent = 0;
            while conn.send_text(b"tick").is_ok() {
                sent += 1;
            }
            sent
        })
    };

    // Act
    thread::sleep(Duration::from_millis(5));
    conn.run(client_frame(Opcode::Close, b"").as_slice());
    let _ = sender.join().unwrap();

    // Assert: the close frame is the last thing on the wire
    let frames = parse_server_frames(&out.bytes());
    assert_eq!(frames.last(), Some(&(Opcode::Close, Vec::new())));
    assert_eq!(
        frames.iter().filter(|(op, _)| *op == Opcode::Close).count(),
        1
    );
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}
