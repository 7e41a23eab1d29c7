//! Domain-specific error types for the protocol client.
//!
//! All fallible operations return `Result<T, GuacError>`.
//! No panics on remote input — every error is typed and recoverable.

use std::time::Duration;

use thiserror::Error;

use crate::status::Status;

/// The canonical error type for the protocol client.
#[derive(Debug, Error)]
pub enum GuacError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The instruction stream violated the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An element body was not valid UTF-8.
    #[error("invalid utf-8 in element body")]
    InvalidElementText,

    /// An instruction was missing a required element.
    #[error("missing element {index} of {opcode:?} instruction")]
    MissingElement { opcode: String, index: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: i64 },

    // ── Transport Errors ─────────────────────────────────────────
    /// The transport layer reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The tunnel closed with an error status.
    #[error("tunnel closed: {0}")]
    TunnelClosed(Status),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The underlying socket reported an I/O error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    // ── Stream Errors ────────────────────────────────────────────
    /// A stream was rejected by the peer.
    #[error("stream rejected: {0}")]
    StreamRejected(Status),

    /// A media mimetype could not be handled.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    // ── Application Errors ───────────────────────────────────────
    /// A JSON body could not be parsed.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for GuacError {
    fn from(s: String) -> Self {
        GuacError::Other(s)
    }
}

impl From<&str> for GuacError {
    fn from(s: &str) -> Self {
        GuacError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GuacError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GuacError::ChannelClosed
    }
}
