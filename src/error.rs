//! Error types for gatecore
//!
//! This module defines the error hierarchy for the connection core.
//! All errors are categorized by subsystem and include recovery hints.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for gatecore
#[derive(Debug, Error)]
pub enum GateError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Service port and acceptor errors
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Connection handling errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GateError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Service(e) => e.is_recoverable(),
            Self::Connection(e) => e.is_recoverable(),
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

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Service port and acceptor errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Failed to bind the acceptor to an address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to accept a connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Failed to set a socket option
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// A single-socket service cannot share its port
    #[error("Port {port} already hosts a single-socket service")]
    SingleSocketConflict { port: u16 },

    /// Port number rejected at registration
    #[error("Invalid service port: {0}")]
    InvalidPort(u16),

    /// I/O error
    #[error("Service I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ServiceError {
    /// Check if this error is recoverable
    ///
    /// Bind errors count as recoverable because the port re-opens itself
    /// after a fixed delay.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => true,
            Self::AcceptError(_) => true,
            Self::SocketOption { .. } => false,
            Self::SingleSocketConflict { .. } => false,
            Self::InvalidPort(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
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

/// Connection handling errors
///
/// Each variant corresponds to one way a connection's read or write path
/// can end; the connection maps the variant to a log level and a close
/// mode (forced or draining).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection observed its own close signal
    #[error("Connection closed")]
    Closed,

    /// A read or write deadline expired
    #[error("Connection timed out")]
    Timeout,

    /// Packet-per-second budget exceeded
    #[error("Packet rate limit exceeded by {ip}")]
    RateLimited { ip: String },

    /// Frame length header was zero or above the input ceiling
    #[error("Invalid frame length: {size}")]
    BadFrame { size: u16 },

    /// Proxy identification did not match the server name
    #[error("Server name identification mismatch")]
    IdentificationMismatch,

    /// No registered service matched the requested protocol id
    #[error("No protocol registered for id {id}")]
    NoProtocol { id: u8 },

    /// Transport-level I/O error
    #[error("Connection I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Check if this error is recoverable
    ///
    /// Connection errors terminate the connection they occurred on; none
    /// of them is retried in place.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Whether this is an expected transport-level ending (peer reset,
    /// clean EOF, local shutdown) rather than a fault worth an error log.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Closed | Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Type alias for Result with GateError
pub type Result<T> = std::result::Result<T, GateError>;
