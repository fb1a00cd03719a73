//! Error types for livesync operations.
//!
//! Errors are `Clone` so a single connection-level failure can be handed to
//! every operation that was pending on the dead connection.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Alias for `Result<T, livesync::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the livesync engine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The port forward to the device could not be set up.
    #[error("tunnel setup failed: {0}")]
    Tunnel(String),

    /// The connect retry loop ran out of time.
    #[error("timed out connecting to {addr} after {elapsed:?}{}", describe_io(.last))]
    ConnectTimeout {
        /// Address that was being dialled.
        addr: String,
        /// Time spent in the retry loop.
        elapsed: Duration,
        /// Last transient failure observed before giving up.
        last: Option<Arc<io::Error>>,
    },

    /// The live socket failed while reading or writing.
    #[error("socket error: {0}")]
    Socket(#[source] Arc<io::Error>),

    /// The remote agent closed the connection.
    #[error("connection closed by the remote agent")]
    ConnectionClosed,

    /// A message was dropped part-way through being written, leaving the
    /// stream out of step with the agent.
    #[error("a message was abandoned part-way through writing")]
    Cancelled,

    /// A length field would need more digits than the wire format allows.
    #[error("{field} length needs {digits} digits, the protocol allows at most 255")]
    ProtocolLimit {
        /// Which field overflowed.
        field: &'static str,
        /// Number of decimal digits required.
        digits: usize,
    },

    /// A do-sync request was not acknowledged before its deadline.
    #[error("sync operation {id} was not acknowledged within {timeout:?}")]
    OperationTimeout {
        /// Hex operation identifier.
        id: String,
        /// Deadline the operation was given.
        timeout: Duration,
    },

    /// A write was attempted without a live connection.
    #[error("no active connection{}", describe_last(.last))]
    NotConnected {
        /// The error that ended the previous connection, if any.
        last: Option<Box<Error>>,
    },

    /// Inbound bytes could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The remote agent sent an error report.
    #[error("remote agent reported: {0}")]
    Remote(String),

    /// A caller-supplied operation identifier is not 32 hex characters.
    #[error("invalid operation id {0:?}: expected 32 hex characters")]
    InvalidOperationId(String),

    /// An operation with this identifier is already awaiting its report.
    #[error("operation {0} is already pending")]
    DuplicateOperation(String),

    /// A path could not be expressed relative to the base directory.
    #[error("{} is not a file under {}", .path.display(), .base.display())]
    PathOutsideBase {
        /// The offending path.
        path: PathBuf,
        /// The base directory it was resolved against.
        base: PathBuf,
    },

    /// A path component is not valid UTF-8 and cannot go on the wire.
    #[error("{} is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),

    /// Local filesystem failure.
    #[error("{}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn socket(source: io::Error) -> Self {
        Self::Socket(Arc::new(source))
    }

    /// Whether this error invalidated the connection it happened on.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Socket(_)
                | Self::ConnectionClosed
                | Self::Cancelled
                | Self::OperationTimeout { .. }
        )
    }

    /// Whether the connection was never up (or is gone) when this was raised.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

fn describe_io(last: &Option<Arc<io::Error>>) -> String {
    match last {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

fn describe_last(last: &Option<Box<Error>>) -> String {
    match last {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}
