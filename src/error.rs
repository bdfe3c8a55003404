use std::io;

use thiserror::Error;

use crate::net::http::Headers;

pub type Result<T> = std::result::Result<T, Error>;

/// Close code reported when the transport went away without a closing handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, bad reserved bits, invalid close code or a fragmentation violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("payload too large: {size} bytes exceeds the limit of {max}")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    #[error("invalid handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// The connection terminated. `code` is the terminal close code.
    #[error("connection closed: code {code}{}", reason_suffix(.reason))]
    Closed { code: u16, reason: Option<String> },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) if !reason.is_empty() => format!(" ({reason})"),
        _ => String::new(),
    }
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Close code a read loop terminated by this error reports.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => 1002,
            Error::Transport(_) => ABNORMAL_CLOSURE,
            Error::InvalidUtf8 => 1007,
            Error::PayloadTooLarge { .. } => 1009,
            Error::Closed { code, .. } => *code,
            Error::Handshake(_) | Error::Config(_) | Error::Internal(_) => 1011,
        }
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_: ring::error::Unspecified) -> Self {
        Error::Internal("system random source failed".to_string())
    }
}

/// Failures of the opening handshake. The connection never reaches OPEN.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    /// `Connection` / `Upgrade` headers do not ask for a WebSocket upgrade.
    #[error("invalid upgrade: {0}")]
    InvalidUpgrade(String),

    #[error("invalid origin: {}", .0.as_deref().unwrap_or("no origin header"))]
    InvalidOrigin(Option<String>),

    /// Handshake aborted with a caller chosen HTTP response.
    #[error("handshake aborted with status {status}")]
    Abort { status: u16, headers: Headers, body: Vec<u8> },

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid {name} header: {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("invalid Sec-WebSocket-Key: {0:?}")]
    InvalidKey(String),

    #[error("unsupported Sec-WebSocket-Version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid Sec-WebSocket-Accept: expected {expected:?}, got {actual:?}")]
    InvalidAccept { expected: String, actual: String },

    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),

    #[error("unsupported subprotocol: {0}")]
    UnsupportedSubprotocol(String),

    #[error("malformed HTTP message: {0}")]
    Http(String),
}

impl HandshakeError {
    /// HTTP status a server answers this failure with.
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::InvalidOrigin(_) => 403,
            HandshakeError::InvalidUpgrade(_) => 426,
            HandshakeError::Abort { status, .. } => *status,
            _ => 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_classification() {
        assert_eq!(Error::protocol("bad").close_code(), 1002);
        assert_eq!(Error::Transport(io::ErrorKind::UnexpectedEof.into()).close_code(), 1006);
        assert_eq!(Error::InvalidUtf8.close_code(), 1007);
        assert_eq!(Error::PayloadTooLarge { size: 20, max: 10 }.close_code(), 1009);
        assert_eq!(Error::Internal("boom".into()).close_code(), 1011);
    }

    #[test]
    fn test_handshake_status_mapping() {
        assert_eq!(HandshakeError::InvalidOrigin(None).status(), 403);
        assert_eq!(HandshakeError::InvalidUpgrade("h2c".into()).status(), 426);
        assert_eq!(HandshakeError::MissingHeader("Sec-WebSocket-Key").status(), 400);
        assert_eq!(HandshakeError::InvalidVersion("12".into()).status(), 400);
    }

    #[test]
    fn test_closed_display_includes_reason() {
        let err = Error::Closed { code: 1001, reason: Some("going away".into()) };
        assert_eq!(err.to_string(), "connection closed: code 1001 (going away)");
        let err = Error::Closed { code: 1000, reason: None };
        assert_eq!(err.to_string(), "connection closed: code 1000");
    }
}
