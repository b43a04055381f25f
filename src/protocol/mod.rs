//! Framed relay protocol (§4.1) — a length-prefixed, multi-message-type
//! channel layered on a byte stream, with in-flight request correlation
//! and an opening handshake.
//!
//! The wire encoding resolves an open question from the original source:
//! each message is a `tokio_util::codec::LengthDelimitedCodec` frame whose
//! body is a one-byte message-type tag (0..5) followed by UTF-8 JSON for
//! that type's schema.

pub mod channel;
pub mod codec;
pub mod router;

pub use channel::Channel;
pub use codec::{HandshakePayload, Message, MessageType, Role};

/// Fixed ASCII protocol name carried in the handshake and used as the mux's
/// per-protocol-id duplicate-open guard.
pub const PROTOCOL_NAME: &str = "hypertuna-relay/2.0";

/// Protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: &str = "2.0";
