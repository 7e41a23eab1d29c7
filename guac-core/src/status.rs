//! Protocol status codes and error classification.
//!
//! Statuses travel on the wire as plain decimal integers; the closed set of
//! known codes is modeled as an enum with `TryFrom` — no panics on unknown
//! values. A [`Status`] keeps the raw wire value so that classification
//! (`is_error`) works even for codes outside the known set.

use std::fmt;

use crate::error::GuacError;

// ── StatusCode ───────────────────────────────────────────────────

/// All status codes defined by the protocol.
///
/// Organized by category:
/// - `0x0000..0x00FF` — success
/// - `0x0100..0x01FF` — not supported
/// - `0x0200..0x02FF` — server / upstream errors
/// - `0x0300..0x03FF` — client errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The operation succeeded.
    Success = 0x0000,

    /// The requested operation is unsupported.
    Unsupported = 0x0100,

    /// An internal error occurred on the server.
    ServerError = 0x0200,
    /// The server is busy and cannot service the request.
    ServerBusy = 0x0201,
    /// The upstream server (the remote desktop) timed out.
    UpstreamTimeout = 0x0202,
    /// The upstream server returned an error.
    UpstreamError = 0x0203,
    /// The requested resource does not exist.
    ResourceNotFound = 0x0204,
    /// The requested resource is already in use.
    ResourceConflict = 0x0205,

    /// The client made a bad request.
    ClientBadRequest = 0x0300,
    /// Permission was denied for lack of valid credentials.
    ClientUnauthorized = 0x0301,
    /// Permission was denied, and credentials will not help.
    ClientForbidden = 0x0303,
    /// The client took too long to respond.
    ClientTimeout = 0x0308,
    /// The client sent more data than the protocol allows.
    ClientOverrun = 0x030D,
    /// The client sent data of an unsupported or unexpected type.
    ClientBadType = 0x030F,
    /// The client is already using too many resources.
    ClientTooMany = 0x031D,
}

impl TryFrom<i32> for StatusCode {
    type Error = GuacError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(StatusCode::Success),
            0x0100 => Ok(StatusCode::Unsupported),
            0x0200 => Ok(StatusCode::ServerError),
            0x0201 => Ok(StatusCode::ServerBusy),
            0x0202 => Ok(StatusCode::UpstreamTimeout),
            0x0203 => Ok(StatusCode::UpstreamError),
            0x0204 => Ok(StatusCode::ResourceNotFound),
            0x0205 => Ok(StatusCode::ResourceConflict),
            0x0300 => Ok(StatusCode::ClientBadRequest),
            0x0301 => Ok(StatusCode::ClientUnauthorized),
            0x0303 => Ok(StatusCode::ClientForbidden),
            0x0308 => Ok(StatusCode::ClientTimeout),
            0x030D => Ok(StatusCode::ClientOverrun),
            0x030F => Ok(StatusCode::ClientBadType),
            0x031D => Ok(StatusCode::ClientTooMany),
            _ => Err(GuacError::UnknownVariant {
                type_name: "StatusCode",
                value: value as i64,
            }),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl StatusCode {
    /// Returns `true` if this code denotes an error.
    pub fn is_error(self) -> bool {
        is_error(self as i32)
    }
}

/// Returns `true` if the raw code denotes an error: any negative value or
/// any value above the success range (`> 0x00FF`).
pub fn is_error(code: i32) -> bool {
    code < 0 || code > 0x00FF
}

// ── Status ───────────────────────────────────────────────────────

/// A status notification: a raw code plus an optional human-readable
/// message.
///
/// The code is kept as received from the wire; use [`Status::code`] to map
/// it onto the known [`StatusCode`] set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    raw: i32,
    message: Option<String>,
}

impl Status {
    /// Create a status from a known code, without a message.
    pub fn from_code(code: StatusCode) -> Self {
        Self {
            raw: code as i32,
            message: None,
        }
    }

    /// Create a status from a known code and a message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            raw: code as i32,
            message: Some(message.into()),
        }
    }

    /// Create a status from a raw wire value.
    pub fn from_raw(raw: i32, message: Option<String>) -> Self {
        Self { raw, message }
    }

    /// The raw wire value.
    pub fn raw(&self) -> i32 {
        self.raw
    }

    /// The known code this status maps onto, if any.
    pub fn code(&self) -> Option<StatusCode> {
        StatusCode::try_from(self.raw).ok()
    }

    /// The optional human-readable message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status denotes an error.
    pub fn is_error(&self) -> bool {
        is_error(self.raw)
    }

    // ── Transport translations ───────────────────────────────────

    /// Translate a websocket close frame into a status.
    ///
    /// If the close reason itself is a decimal protocol code, that code
    /// wins. Otherwise a fixed mapping from websocket close codes applies,
    /// defaulting to [`StatusCode::ServerError`].
    pub fn from_websocket_close(close_code: u16, reason: &str) -> Self {
        if let Ok(code) = reason.trim().parse::<i32>() {
            return Self::from_raw(code, None);
        }

        let code = match close_code {
            1000 => StatusCode::Success,
            1008 => StatusCode::ClientForbidden,
            1009 => StatusCode::ClientOverrun,
            1011 => StatusCode::ServerError,
            _ => StatusCode::ServerError,
        };

        let message = if reason.is_empty() {
            None
        } else {
            Some(reason.to_string())
        };
        Self {
            raw: code as i32,
            message,
        }
    }

    /// Translate an HTTP response into a status.
    ///
    /// The `Guacamole-Status-Code` header (decimal) takes precedence; the
    /// `Guacamole-Error-Message` header supplies the message. Without the
    /// header, well-known HTTP statuses map onto protocol codes.
    pub fn from_http_response(
        http_status: u16,
        code_header: Option<&str>,
        message_header: Option<&str>,
    ) -> Self {
        let message = message_header
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string());

        if let Some(code) = code_header.and_then(|h| h.trim().parse::<i32>().ok()) {
            return Self::from_raw(code, message);
        }

        let code = match http_status {
            403 => StatusCode::ClientForbidden,
            404 => StatusCode::ResourceNotFound,
            429 => StatusCode::ClientTooMany,
            503 => StatusCode::ServerBusy,
            _ => StatusCode::ServerError,
        };
        Self {
            raw: code as i32,
            message,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code(), self.message()) {
            (Some(code), Some(msg)) => write!(f, "{code} ({:#06x}): {msg}", self.raw),
            (Some(code), None) => write!(f, "{code} ({:#06x})", self.raw),
            (None, Some(msg)) => write!(f, "status {:#06x}: {msg}", self.raw),
            (None, None) => write!(f, "status {:#06x}", self.raw),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
