//! Error types for the watcher client.
//!
//! All fallible operations in this crate return [`WatcherError`]. The variants
//! follow the failure taxonomy of the device link:
//!
//! ## Error Categories
//!
//! - **Connection Errors**: refused/unreachable endpoints, failed handshakes,
//!   mode-slot conflicts and channels that closed underneath a session
//! - **Protocol Errors**: unsupported type tags, type mismatches between the
//!   declared variable and the wire, truncated bodies
//! - **Persistence Errors**: failures while appending saved buffers to disk
//! - **Transfer Errors**: remote log files that are missing or time out
//!
//! Protocol and persistence errors are handled locally by the ingestion path
//! (the offending buffer is dropped and logged). Connection errors are
//! returned to the caller; there is no automatic reconnect.
//!
//! ```rust
//! use belawatch::{ConnectionErrorKind, WatcherError};
//!
//! let error = WatcherError::connection(
//!     ConnectionErrorKind::Refused,
//!     "ws://192.168.7.2:5555/gui_control",
//!     "connection refused",
//! );
//! assert!(error.is_retryable());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::VarType;

/// Result type alias for watcher operations.
pub type Result<T, E = WatcherError> = std::result::Result<T, E>;

/// Why a connection attempt (or an established connection) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The device actively refused the connection.
    Refused,
    /// No route to the device.
    Unreachable,
    /// The device did not complete the connection handshake.
    Handshake,
    /// The requested mode slot conflicts with an active connection.
    ModeConflict,
    /// The channel closed while it was in use.
    Closed,
    /// Anything else.
    Other,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionErrorKind::Refused => "connection refused",
            ConnectionErrorKind::Unreachable => "network unreachable",
            ConnectionErrorKind::Handshake => "handshake failed",
            ConnectionErrorKind::ModeConflict => "mode slot conflict",
            ConnectionErrorKind::Closed => "channel closed",
            ConnectionErrorKind::Other => "connection error",
        };
        f.write_str(text)
    }
}

impl ConnectionErrorKind {
    /// Classify a socket-level failure.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
            std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::HostUnreachable => {
                ConnectionErrorKind::Unreachable
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ConnectionErrorKind::Closed,
            _ => ConnectionErrorKind::Other,
        }
    }
}

/// Main error type for watcher operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WatcherError {
    #[error("{kind} while connecting to {endpoint}: {reason}")]
    Connection {
        kind: ConnectionErrorKind,
        endpoint: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Type mismatch on channel {channel}: declared {declared:?}, received {received:?}")]
    TypeMismatch { channel: usize, declared: VarType, received: VarType },

    #[error("Unsupported type tag {tag:?}")]
    UnsupportedType { tag: char },

    #[error("Failed to persist data to {path}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer of {remote_path} failed: {reason}")]
    Transfer { remote_path: String, reason: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Variable '{name}' is not in the watcher")]
    UnknownVariable { name: String },

    #[error("Invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("JSON error in {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration error: {details}")]
    Config { details: String },
}

impl WatcherError {
    /// Returns whether this error is potentially recoverable by calling again.
    pub fn is_retryable(&self) -> bool {
        match self {
            WatcherError::Connection { kind, .. } => {
                !matches!(kind, ConnectionErrorKind::ModeConflict)
            }
            WatcherError::Timeout { .. } => true,
            WatcherError::Transfer { .. } => true,
            WatcherError::Persistence { .. } => true,
            WatcherError::Protocol { .. } => false,
            WatcherError::TypeMismatch { .. } => false,
            WatcherError::UnsupportedType { .. } => false,
            WatcherError::UnknownVariable { .. } => false,
            WatcherError::InvalidArgument { .. } => false,
            WatcherError::Serialization { .. } => false,
            WatcherError::Config { .. } => false,
        }
    }

    /// Returns whether this error describes a malformed or desynchronised frame.
    ///
    /// Protocol faults are isolated to the offending buffer.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            WatcherError::Protocol { .. }
                | WatcherError::TypeMismatch { .. }
                | WatcherError::UnsupportedType { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            WatcherError::Connection { kind: ConnectionErrorKind::ModeConflict, .. } => vec![
                "Disconnect the controller before starting a monitor (or vice versa)",
                "Only one connection per mode slot is supported",
            ],
            WatcherError::Connection { .. } => vec![
                "Make sure the device is on the same network as this computer",
                "Check that the IP address and port are correct",
                "Check that a project is running on the device",
            ],
            WatcherError::Protocol { .. }
            | WatcherError::TypeMismatch { .. }
            | WatcherError::UnsupportedType { .. } => vec![
                "Reconnect to refresh the variable list",
                "Check that the running project matches the watcher variables",
            ],
            WatcherError::Persistence { .. } => vec![
                "Check the saving directory exists and is writable",
                "Ensure sufficient disk space",
            ],
            WatcherError::Transfer { .. } => vec![
                "Check that the remote file exists",
                "Retry the copy once logging has finished",
            ],
            WatcherError::Timeout { .. } => vec![
                "Increase the configured timeout",
                "Verify the device is still responding",
            ],
            WatcherError::UnknownVariable { .. } => vec![
                "List the watcher variables with list()",
                "Check the variable name spelling",
            ],
            WatcherError::InvalidArgument { .. } => vec!["Check the arguments passed to the call"],
            WatcherError::Serialization { .. } => vec![
                "Check the device firmware version",
                "Verify the data file was written by this library",
            ],
            WatcherError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Fall back to LinkConfig::default()",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection(
        kind: ConnectionErrorKind,
        endpoint: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        WatcherError::Connection {
            kind,
            endpoint: endpoint.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_with_source(
        kind: ConnectionErrorKind,
        endpoint: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        WatcherError::Connection {
            kind,
            endpoint: endpoint.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for a connection whose channel has gone away.
    pub fn channel_closed(endpoint: impl Into<String>) -> Self {
        Self::connection(ConnectionErrorKind::Closed, endpoint, "channel is not open")
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        WatcherError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for persistence errors.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WatcherError::Persistence { path: path.into(), source }
    }

    /// Helper constructor for transfer errors.
    pub fn transfer_failed(remote_path: impl Into<String>, reason: impl Into<String>) -> Self {
        WatcherError::Transfer { remote_path: remote_path.into(), reason: reason.into() }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        WatcherError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for invalid arguments.
    pub fn invalid_argument(details: impl Into<String>) -> Self {
        WatcherError::InvalidArgument { details: details.into() }
    }
}

impl From<std::io::Error> for WatcherError {
    fn from(err: std::io::Error) -> Self {
        WatcherError::Persistence { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_json::Error> for WatcherError {
    fn from(err: serde_json::Error) -> Self {
        WatcherError::Serialization { context: "JSON".to_string(), source: err }
    }
}
