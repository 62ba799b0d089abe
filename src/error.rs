//! Error types for phantom-proxy
//!
//! Errors are categorized by subsystem. Stream-scoped errors never bubble
//! beyond the tasks of that stream; session-scoped errors close the session
//! and trigger pool repair on the client; fatal errors exist only at startup.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for phantom-proxy
#[derive(Debug, Error)]
pub enum PhantomError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session layer errors (KCP, mux, stream lifecycle)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Stream preamble errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server dispatch errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PhantomError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Protocol(_) => true,
            Self::Server(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation errors, collected and reported together
    #[error("Configuration validation failed: {}", .0.join("; "))]
    ValidationError(Vec<String>),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error from a single message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(vec![msg.into()])
    }
}

/// Packet transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to open the raw packet socket
    #[error("Failed to open packet socket: {0}")]
    Open(String),

    /// Failed to set a socket option (SO_RCVBUF, IP_HDRINCL, ...)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind the packet socket
    #[error("Failed to bind packet socket to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// The transport was closed
    #[error("Packet transport closed")]
    Closed,

    /// Outbound frame would exceed the carrier MTU
    #[error("Frame of {len} bytes exceeds transport MTU {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },

    /// I/O error on the packet socket
    #[error("Packet socket I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Open(_) | Self::SocketOption { .. } | Self::Bind { .. } | Self::Closed => false,
            Self::FrameTooLarge { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Failed to establish the KCP endpoint or mux
    #[error("Failed to establish session with {addr}: {reason}")]
    DialFailed { addr: SocketAddr, reason: String },

    /// The session is closed; triggers pool repair on the client
    #[error("Session closed")]
    Closed,

    /// No live session is available for a new stream
    #[error("No live tunnel available")]
    NoTunnel,

    /// A stream-scoped failure; closes only that stream
    #[error("Stream {sid} failed: {reason}")]
    StreamFailed { sid: u32, reason: String },

    /// Mux-level failure opening or accepting a stream
    #[error("Mux error: {0}")]
    Mux(String),

    /// Root context was cancelled; propagates silently
    #[error("Cancelled")]
    Cancelled,

    /// I/O error inside the session
    #[error("Session I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DialFailed { .. }
            | Self::Closed
            | Self::NoTunnel
            | Self::StreamFailed { .. }
            | Self::Mux(_) => true,
            Self::Cancelled => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a stream failure error
    pub fn stream(sid: u32, reason: impl Into<String>) -> Self {
        Self::StreamFailed {
            sid,
            reason: reason.into(),
        }
    }

    /// Create a dial failure error
    pub fn dial(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::DialFailed {
            addr,
            reason: reason.into(),
        }
    }
}

/// Stream preamble errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The preamble could not be decoded; closes the stream
    #[error("Malformed preamble: {0}")]
    Malformed(String),

    /// The preamble length prefix exceeds the allowed maximum
    #[error("Preamble of {len} bytes exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    /// A preamble field required by the message type is missing
    #[error("Preamble type {kind} missing required field: {field}")]
    MissingField { kind: u8, field: &'static str },

    /// An address string could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddr(String),

    /// I/O error while reading or writing the preamble
    #[error("Preamble I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProtocolError {
    /// Create a malformed-preamble error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Server dispatch errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to dial the target named in the preamble
    #[error("Failed to dial {target} for stream {sid}: {reason}")]
    DialFailed {
        target: String,
        sid: u32,
        reason: String,
    },

    /// Unexpected preamble type on a server-accepted stream
    #[error("Unexpected preamble type {kind} on stream {sid}")]
    UnexpectedType { kind: u8, sid: u32 },

    /// I/O error during dispatch
    #[error("Server I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ServerError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DialFailed { .. } | Self::UnexpectedType { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a dial failure error
    pub fn dial(target: impl Into<String>, sid: u32, reason: impl Into<String>) -> Self {
        Self::DialFailed {
            target: target.into(),
            sid,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `PhantomError`
pub type Result<T> = std::result::Result<T, PhantomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::validation("bad key");
        assert!(!config_err.is_recoverable());

        let open_err = TransportError::Open("permission denied".into());
        assert!(!open_err.is_recoverable());

        let closed = SessionError::Closed;
        assert!(closed.is_recoverable());

        let cancelled = SessionError::Cancelled;
        assert!(!cancelled.is_recoverable());

        let dial = ServerError::dial("10.0.0.1:80", 7, "connection refused");
        assert!(dial.is_recoverable());
    }

    #[test]
    fn test_validation_errors_reported_together() {
        let err = ConfigError::ValidationError(vec![
            "missing encryption.key".into(),
            "transport.conn must be >= 1".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("encryption.key"));
        assert!(msg.contains("transport.conn"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: PhantomError = io_err.into();
        assert!(err.is_recoverable());

        let config_err = ConfigError::validation("invalid");
        let err: PhantomError = config_err.into();
        assert!(!err.is_recoverable());
    }
}
