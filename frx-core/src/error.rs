//! Domain-specific error types for the frx relay.
//!
//! All fallible operations return `Result<T, FrxError>`.
//! Per-frame failures ([`DecodeError`], [`ProcessingError`]) are typed
//! separately so callers can absorb them without tearing down a session.

use std::time::Duration;
use thiserror::Error;

use crate::state::SessionId;

/// The canonical error type for the frx relay.
#[derive(Debug, Error)]
pub enum FrxError {
    // ── Per-message errors ───────────────────────────────────────
    /// An inbound frame could not be decoded. Drops one message only.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The transformation capability failed for one job.
    #[error("processing error: {0}")]
    Processing(#[from] ProcessingError),

    // ── Session errors ───────────────────────────────────────────
    /// The handshake or configuration message was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation was attempted on a session that has already closed.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// A session state transition was not valid from the current state.
    #[error("invalid session transition: {0}")]
    InvalidTransition(&'static str),

    // ── Transport errors ─────────────────────────────────────────
    /// The WebSocket layer reported an error or the peer went away.
    #[error("transport error: {0}")]
    Transport(String),

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization errors ─────────────────────────────────────
    /// A JSON message could not be encoded or parsed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── DecodeError ───────────────────────────────────────────────────

/// Failure to turn wire bytes into a [`Frame`](crate::frame::Frame).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The message was not valid JSON or lacked required fields.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `data` field was not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    /// The payload decoded to zero bytes or lost its trailer.
    #[error("truncated payload ({0} bytes)")]
    Truncated(usize),

    /// The payload is not a JPEG image.
    #[error("unsupported image encoding")]
    UnsupportedEncoding,

    /// The message exceeds the inbound size limit.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

// ── ProcessingError ───────────────────────────────────────────────

/// Failure reported by the transformation capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The capability rejected the frame or its model failed.
    #[error("transform failed: {0}")]
    Failed(String),

    /// The source identity could not be prepared (e.g. no face found).
    #[error("identity rejected: {0}")]
    IdentityRejected(String),

    /// The blocking executor running the capability panicked or was
    /// shut down mid-call.
    #[error("executor aborted: {0}")]
    Aborted(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for FrxError {
    fn from(s: String) -> Self {
        FrxError::Other(s)
    }
}

impl From<&str> for FrxError {
    fn from(s: &str) -> Self {
        FrxError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FrxError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FrxError::ChannelClosed
    }
}

impl From<serde_json::Error> for FrxError {
    fn from(e: serde_json::Error) -> Self {
        FrxError::Encoding(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FrxError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FrxError::Transport(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ProcessingError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProcessingError::Aborted(e.to_string())
    }
}

impl FrxError {
    /// Whether this error must end the session it occurred on.
    ///
    /// Only handshake violations and transport loss are terminal; every
    /// per-frame failure is absorbed locally.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FrxError::Protocol(_)
                | FrxError::SessionClosed(_)
                | FrxError::Transport(_)
                | FrxError::Connection(_)
                | FrxError::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = FrxError::SessionClosed(SessionId::new(7));
        assert!(e.to_string().contains("s-7"));

        let e: FrxError = DecodeError::TooLarge {
            size: 1000,
            max: 500,
        }
        .into();
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: FrxError = "something broke".into();
        assert!(matches!(e, FrxError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: FrxError = io_err.into();
        assert!(matches!(e, FrxError::Connection(_)));
        assert!(e.is_terminal());
    }

    #[test]
    fn per_frame_errors_are_not_terminal() {
        let e: FrxError = DecodeError::UnsupportedEncoding.into();
        assert!(!e.is_terminal());
        let e: FrxError = ProcessingError::Failed("gpu".into()).into();
        assert!(!e.is_terminal());
        assert!(FrxError::Protocol("bad version".into()).is_terminal());
    }
}
