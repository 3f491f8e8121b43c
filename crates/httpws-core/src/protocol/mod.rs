//! Protocol module containing the upgrade handshake and the binary frame codec.

pub mod frame;
pub mod handshake;

pub use frame::{apply_mask, decode_frame, decode_frame_with_limit, encode_frame, Frame, FrameError, Opcode};
pub use handshake::{accept_key, negotiate, write_response, HandshakeError, HandshakeRequest, Negotiation};
