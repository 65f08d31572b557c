//! Error types for socks5-bridge
//!
//! This module defines the error hierarchy for the proxy. All errors are
//! categorized by subsystem and include recovery hints.

use std::io;

use thiserror::Error;

/// Top-level error type for socks5-bridge
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bridge frame encoding/decoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Session-level errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Session registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Bridge transport errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Codec(_) => false,
            Self::Session(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Bridge(e) => e.is_recoverable(),
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

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

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

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Bridge frame codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encode was called without a payload
    #[error("Frame payload is missing")]
    MissingPayload,

    /// Decode input was empty
    #[error("Frame bytes are empty")]
    EmptyInput,

    /// Decode input ended before the named field was complete
    #[error("Frame truncated while reading {0}")]
    Truncated(&'static str),

    /// A string field was not valid UTF-8
    #[error("Frame field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

impl CodecError {
    /// Codec errors indicate a malformed frame and are never recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Any operation after close
    #[error("session [{short_id}] is closed")]
    Closed { short_id: String },

    /// Conditional write before the destination is reachable
    #[error("session [{short_id}] is not connected")]
    NotConnected { short_id: String },

    /// Target host was empty after trimming
    #[error("session [{short_id}] target host is empty")]
    EmptyHost { short_id: String },

    /// Target port outside 1..=65535
    #[error("session [{short_id}] invalid target port: {port}")]
    InvalidPort { short_id: String, port: u16 },

    /// Socket I/O failure
    #[error("session I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed { .. } => false,
            Self::NotConnected { .. } => true,
            Self::EmptyHost { .. } | Self::InvalidPort { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a closed error
    pub fn closed(short_id: impl Into<String>) -> Self {
        Self::Closed {
            short_id: short_id.into(),
        }
    }

    /// Create a not-connected error
    pub fn not_connected(short_id: impl Into<String>) -> Self {
        Self::NotConnected {
            short_id: short_id.into(),
        }
    }
}

/// Session registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No session registered under the connection ID
    #[error("session not found: {conn_id}")]
    NotFound { conn_id: String },

    /// Write helper called on a session that is not in proxy mode
    #[error("session [{conn_id}] is not a proxied session")]
    NotProxied { conn_id: String },

    /// Delegated session operation failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RegistryError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::NotProxied { .. } => false,
            Self::Session(e) => e.is_recoverable(),
        }
    }

    /// Create a not-found error
    pub fn not_found(conn_id: impl Into<String>) -> Self {
        Self::NotFound {
            conn_id: conn_id.into(),
        }
    }

    /// Create a not-proxied error
    pub fn not_proxied(conn_id: impl Into<String>) -> Self {
        Self::NotProxied {
            conn_id: conn_id.into(),
        }
    }
}

/// Bridge transport errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The transport has been closed
    #[error("bridge transport is closed")]
    Closed,

    /// The bounded send queue was full; the frame was dropped
    #[error("bridge send queue is full")]
    ChannelFull,

    /// Frame encoding failed before the offer
    #[error("bridge encode error: {0}")]
    Encode(#[from] CodecError),

    /// WebSocket dial failure
    #[error("bridge dial to {url} failed: {reason}")]
    DialFailed { url: String, reason: String },

    /// WebSocket read/write failure
    #[error("bridge I/O error: {0}")]
    IoError(String),
}

impl BridgeError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed => false,
            // Dropped frames and I/O failures resolve via retry/reconnect
            Self::ChannelFull => true,
            Self::Encode(_) => false,
            Self::DialFailed { .. } => true,
            Self::IoError(_) => true,
        }
    }

    /// Create a dial failure error
    pub fn dial_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DialFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
