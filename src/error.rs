//! Custom error types for mavrouter-loop.
//!
//! Setup paths (configuration, opening endpoints, creating the poller or a
//! timer) report failures through [`RouterError`]. Per-message I/O on an
//! endpoint stays on `std::io::Result` so the mainloop can tell a transient
//! `WouldBlock` from a peer hangup by its `ErrorKind`.

use std::io;
use thiserror::Error;

/// Main error type for mavrouter-loop operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors (connection failures, socket errors)
    #[error("Network error on endpoint '{endpoint}': {source}")]
    Network {
        /// Name or address of the endpoint that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Serial port errors (device not found, permission denied, hardware issues)
    #[error("Serial port error on '{device}': {source}")]
    Serial {
        /// Path to the serial device
        device: String,
        /// Underlying serial error
        #[source]
        source: mio_serial::Error,
    },

    /// Readiness multiplexer errors (creation, registration)
    #[error("Poll error: {0}")]
    Poll(#[source] io::Error),

    /// MAVLink or ULog protocol errors (invalid frames, bad log header)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// File system errors (log file creation, log directory)
    #[error("Filesystem error at '{path}': {source}")]
    Filesystem {
        /// Path that caused the error
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Endpoint initialization errors
    #[error("Failed to initialize {endpoint_type} endpoint: {reason}")]
    EndpointInit {
        /// Type of endpoint (TCP, UDP, Serial, Log)
        endpoint_type: String,
        /// Reason for failure
        reason: String,
    },

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use RouterError
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new serial error
    pub fn serial(device: impl Into<String>, source: mio_serial::Error) -> Self {
        Self::Serial {
            device: device.into(),
            source,
        }
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new filesystem error
    pub fn filesystem(path: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create a new endpoint initialization error
    pub fn endpoint_init(endpoint_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EndpointInit {
            endpoint_type: endpoint_type.into(),
            reason: reason.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Returns `true` if the error means the peer is gone for good.
///
/// The mainloop uses this to decide whether a TCP endpoint is marked for
/// removal or whether the failure is a transient one on a live link.
pub fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
