//! Binary codec for WebSocket frames (RFC 6455 §5.2, single-frame subset).
//!
//! Wire format:
//! ```text
//! [FIN|RSV|opcode:1][MASK|len7:1][ext_len:0|2|8][mask_key:0|4][payload:N]
//! ```
//! All multi-byte integers are big-endian.
//!
//! Frames received by the server are always masked and are read one at a time
//! from a blocking [`Read`].  Frames sent by the server are never masked, always
//! carry FIN, and are produced as one contiguous buffer so that the caller can
//! hand them to the stream in a single write.

use std::io::{self, Read};

use thiserror::Error;

/// FIN flag in the first header byte.  Always set on encode.
pub const FIN_BIT: u8 = 0x80;

/// MASK flag in the second header byte.  Never set on encode, not checked on decode.
pub const MASK_BIT: u8 = 0x80;

/// Base-length sentinel announcing a 16-bit extended length.
pub const LEN_16: u8 = 126;

/// Base-length sentinel announcing a 64-bit extended length.
pub const LEN_64: u8 = 127;

/// Largest payload length that fits in the 7-bit base length field.
pub const MAX_SHORT_LEN: usize = 125;

/// Largest possible unmasked header: 2 fixed bytes + 8 extended length bytes.
pub const MAX_HEADER_LEN: usize = 10;

/// Default upper bound on a single received payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Errors that can occur while decoding a frame from a stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream failed or ended before the frame was complete.
    #[error("stream error while reading frame: {0}")]
    Io(#[from] io::Error),

    /// The 64-bit length field has its most significant bit set, or does not
    /// fit in this platform's address space.
    #[error("malformed extended length field: {0}")]
    LengthOverflow(u64),

    /// The declared payload length exceeds the configured decode limit.
    #[error("payload of {declared} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { declared: u64, limit: usize },
}

impl FrameError {
    /// Returns `true` when the error is an end-of-stream in the middle of a frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// The 4-bit frame opcode.
///
/// Values outside the six known opcodes are carried as [`Opcode::Other`] and
/// are never rejected; the dispatch step simply ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Other(u8),
}

impl Opcode {
    /// Builds an opcode from the low 4 bits of `byte`; the high bits are ignored.
    pub fn from_bits(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }

    /// Returns the 4-bit wire value.
    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Other(v) => v & 0x0F,
        }
    }

    /// `true` for close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// `true` for continuation, text and binary; these reach `on_message`.
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Continuation | Opcode::Text | Opcode::Binary)
    }
}

/// One decoded frame.  The payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }
}

// ── Encoding (server → client) ────────────────────────────────────────────────

/// Appends the unmasked header for a frame of `len` payload bytes to `buf`.
pub fn encode_header(opcode: Opcode, len: usize, buf: &mut Vec<u8>) {
    buf.push(FIN_BIT | opcode.bits());
    if len <= MAX_SHORT_LEN {
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(LEN_16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(LEN_64);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Encodes one unmasked, final frame carrying `payload`.
///
/// # Examples
///
/// ```rust
/// use httpws_core::protocol::frame::{encode_frame, Opcode};
///
/// let bytes = encode_frame(Opcode::Text, b"hi");
/// assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_HEADER_LEN + payload.len());
    encode_header(opcode, payload.len(), &mut buf);
    buf.extend_from_slice(payload);
    buf
}

// ── Decoding (client → server) ────────────────────────────────────────────────

/// XORs `payload` in place with `key`, cycling the key every 4 bytes.
///
/// Masking is its own inverse: applying the same key twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Reads exactly one masked frame from `reader` using
/// [`DEFAULT_MAX_PAYLOAD_LEN`] as the payload limit.
///
/// # Errors
///
/// See [`decode_frame_with_limit`].
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    decode_frame_with_limit(reader, DEFAULT_MAX_PAYLOAD_LEN)
}

/// Reads exactly one masked frame from `reader`.
///
/// Every read is blocking and must return the full requested byte count.
/// Nothing is retried: a short read surfaces as [`FrameError::Io`] with
/// [`io::ErrorKind::UnexpectedEof`] and the frame is abandoned.
///
/// # Errors
///
/// - [`FrameError::Io`] if the stream fails or ends mid-frame.
/// - [`FrameError::LengthOverflow`] for an invalid 64-bit length.
/// - [`FrameError::PayloadTooLarge`] if the length exceeds `max_payload_len`.
///
/// # Examples
///
/// ```rust
/// use httpws_core::protocol::frame::{decode_frame, Opcode};
///
/// // "Hello" masked with 37 fa 21 3d (RFC 6455 §5.7).
/// let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
/// let frame = decode_frame(&mut &wire[..]).unwrap();
/// assert_eq!(frame.opcode, Opcode::Text);
/// assert_eq!(frame.payload, b"Hello");
/// ```
pub fn decode_frame_with_limit<R: Read>(
    reader: &mut R,
    max_payload_len: usize,
) -> Result<Frame, FrameError> {
    let [first] = read_array::<_, 1>(reader)?;
    let opcode = Opcode::from_bits(first);

    let [second] = read_array::<_, 1>(reader)?;
    let len = match second & 0x7F {
        LEN_16 => u16::from_be_bytes(read_array(reader)?) as u64,
        LEN_64 => {
            let len = u64::from_be_bytes(read_array(reader)?);
            if len >> 63 != 0 {
                return Err(FrameError::LengthOverflow(len));
            }
            len
        }
        short => short as u64,
    };

    let len_usize = usize::try_from(len).map_err(|_| FrameError::LengthOverflow(len))?;
    if len_usize > max_payload_len {
        return Err(FrameError::PayloadTooLarge {
            declared: len,
            limit: max_payload_len,
        });
    }

    let mask_key: [u8; 4] = read_array(reader)?;

    let mut payload = vec![0u8; len_usize];
    reader.read_exact(&mut payload)?;
    apply_mask(&mut payload, mask_key);

    Ok(Frame { opcode, payload })
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
