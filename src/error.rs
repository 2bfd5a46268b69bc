//! Typed error taxonomy (spec §7: Framing / Security / Jitter / Protocol / Lifecycle).
//!
//! Per-packet errors here are never propagated to kill a session; callers
//! log and discard. Only [`ProtocolError`] and [`LifecycleError`] variants
//! are meant to terminate a session or a pending request.

use thiserror::Error;

/// Decode/frame-level failures. Always non-fatal to the session: the
/// offending datagram is discarded.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FramingError {
    #[error("frame shorter than required header")]
    MalformedFrame,
    #[error("unknown packet type byte {0:#04x}")]
    UnknownType(u8),
    #[error("encoded payload of {len} bytes exceeds MAX_ENCODED_BYTES ({max})")]
    OversizedPayload { len: usize, max: usize },
}

/// AEAD / handshake failures.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SecurityError {
    #[error("remote public key has invalid length")]
    InvalidRemoteKey,
    #[error("AEAD authentication failed")]
    AuthenticationFailure,
    #[error("nonce prefix does not match session's receive prefix")]
    InvalidNonce,
    #[error("counter already seen within replay window")]
    ReplayDetected,
    #[error("counter is older than the replay window can track")]
    ReplayOutsideWindow,
    #[error("operation attempted before handshake completed")]
    HandshakeIncomplete,
}

/// Outcome of [`crate::jitter::AdaptiveJitterBuffer::add`]. `Duplicate` and
/// `Late` are silent-drop-but-counted per spec §7; never propagated above
/// the buffer as an `Err` that aborts anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterEvent {
    Accepted,
    Duplicate,
    Late,
    BufferOverflow,
}

/// Session/handshake-level failures that terminate the session with a
/// typed reason code sent to the peer.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    #[error("client version {0:?} incompatible with server version {1:?}")]
    VersionMismatch((u16, u16), (u16, u16)),
    #[error("server already has max_clients connected peers")]
    ServerFull,
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Request/response and session lifecycle failures.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LifecycleError {
    #[error("operation timed out")]
    Timeout,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("object already closed")]
    ObjectClosed,
    #[error("request id already has an open waiter registered")]
    DuplicateRequestId,
}
