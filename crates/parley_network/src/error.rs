//! Network error types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The error categories reported to subscribers.
///
/// These never cross the subscriber boundary as `Err` values; they ride
/// along with the event that describes the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The advertiser could not bind its listener or announce its record.
    ServiceFailed,
    /// A discovered record could not be resolved to an address in time.
    ResolveError,
    /// A send targeted a device without a live connection.
    DeviceNotFound,
    /// A frame could not be decoded. Inbound malformed frames are currently
    /// logged and dropped rather than reported.
    JsonParseError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServiceFailed => "SERVICE_FAILED",
            Self::ResolveError => "RESOLVE_ERROR",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::JsonParseError => "JSON_PARSE_ERROR",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the parley_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Publishing the local service failed (bind or announce).
    #[error("Service failed: {0}")]
    ServiceFailed(String),

    /// Discovery subsystem error (browse socket, malformed record).
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A discovered record could not be resolved to an address.
    #[error("Resolve error for '{name}': {reason}")]
    Resolve { name: String, reason: String },

    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A peer sent more bytes than allowed without a frame delimiter.
    #[error("Frame exceeds {limit} bytes without a delimiter")]
    FrameTooLarge { limit: usize },

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// No local identity has been set yet.
    #[error("No local identity set")]
    NoIdentity,

    /// The connection's write queue is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// The subscriber-facing category for this error.
    ///
    /// Local socket and identity failures belong to our own service; only
    /// failures to reach a peer map to `DeviceNotFound`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ServiceFailed(_) | Self::Discovery(_) | Self::Io(_) | Self::NoIdentity => {
                ErrorKind::ServiceFailed
            }
            Self::Resolve { .. } | Self::Timeout(_) => ErrorKind::ResolveError,
            Self::Serialization(_) | Self::FrameTooLarge { .. } => ErrorKind::JsonParseError,
            Self::ConnectionClosed | Self::Transport(_) => ErrorKind::DeviceNotFound,
        }
    }
}
