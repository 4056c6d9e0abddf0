// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Error types for the transport layer.
//!
//! Every fallible operation at the [`crate::TransportFactory`] /
//! [`crate::TransportInstance`] boundary returns [`TransportError`]; nothing
//! panics across that boundary. Backpressure is deliberately *not* an error
//! variant -- it is reported as [`crate::SendOutcome::Backpressure`] and only
//! escalates to [`TransportError::LinkLost`] after the configured output
//! pause period.

use std::fmt;
use std::io;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors returned by the transport factory, instances, and data links.
#[derive(Debug)]
pub enum TransportError {
    /// Configuration rejected by validation or by the plugin
    InvalidConfig(String),

    /// `configure()` called on an already-configured instance
    AlreadyConfigured,

    /// Operation requires a configured instance
    NotConfigured,

    /// Transport-type name already bound to a generator
    DuplicateType(String),

    /// Transport-type name was never registered
    UnknownType(String),

    /// Transport id already has an instance
    DuplicateId(String),

    /// No instance/entry for the given id
    NotFound(String),

    /// Connection establishment failed
    ConnectFailed(String),

    /// Connection establishment exceeded the blocking-time bound
    Timeout,

    /// Malformed wire payload (ack envelope, connection-info blob)
    Format(String),

    /// The data link is lost and will never be reused
    LinkLost,

    /// Instance or factory is shut down
    Shutdown,

    /// Underlying I/O error
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid transport configuration: {}", msg),
            Self::AlreadyConfigured => write!(f, "transport instance already configured"),
            Self::NotConfigured => write!(f, "transport instance not configured"),
            Self::DuplicateType(name) => {
                write!(f, "transport type already registered: {}", name)
            }
            Self::UnknownType(name) => write!(f, "unknown transport type: {}", name),
            Self::DuplicateId(id) => write!(f, "transport id already in use: {}", id),
            Self::NotFound(id) => write!(f, "not found: {}", id),
            Self::ConnectFailed(msg) => write!(f, "connection establishment failed: {}", msg),
            Self::Timeout => write!(f, "connection establishment timed out"),
            Self::Format(msg) => write!(f, "malformed payload: {}", msg),
            Self::LinkLost => write!(f, "data link lost"),
            Self::Shutdown => write!(f, "transport shut down"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}
