//! Typed error kinds for the core subsystems (§7).
//!
//! Library code returns these; the binary and background-task boundaries
//! wrap them in `anyhow` the way `clawd::ipc::dispatch_text` wraps typed
//! handler errors before mapping them to a wire-level response.

use thiserror::Error;

/// Errors from the framed relay protocol (§4.1).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("duplicate channel open for protocol {0:?}")]
    DuplicateOpen(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("request timed out")]
    RequestTimeout,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("underlying stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from dialing a backend peer (§4.2 / §4.3).
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid peer public key: {0}")]
    InvalidPublicKey(String),
    #[error("dial timed out")]
    DialTimeout,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors returned to gateway dispatch callers (§4.5 / §4.6).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no healthy peers available for relay {0}")]
    NoHealthyPeers(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("peer responded with malformed body: {0}")]
    MalformedResponse(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}
