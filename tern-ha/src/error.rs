//! Replication endpoint errors.

use thiserror::Error;

use crate::codec::CodecError;

/// Errors from replication endpoints.
#[derive(Debug, Error)]
pub enum HaError {
    /// Failed to bind the replication listener.
    #[error("failed to bind replication listener {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: std::net::SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Invalid endpoint configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Wire codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Epoch file error.
    #[error("epoch file error: {0}")]
    EpochFile(#[from] tern_epoch::EpochFileError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The commit log rejected an operation.
    #[error("commit log rejected {operation} at offset {offset}")]
    StoreRejected {
        /// The rejected operation.
        operation: &'static str,
        /// The offset it was attempted at.
        offset: i64,
    },

    /// The master pushed an offset that does not match the slave's log end.
    #[error("offset mismatch: slave at {slave_offset}, master pushed {master_offset}")]
    OffsetMismatch {
        /// The slave's max physical offset.
        slave_offset: i64,
        /// The offset the master pushed.
        master_offset: i64,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Housekeeping: nothing read from the peer for too long.
    #[error("connection expired: no data from peer for {idle_ms} ms")]
    Expired {
        /// Milliseconds since the last read.
        idle_ms: i64,
    },

    /// The handshake reply did not arrive in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The service is shut down.
    #[error("service is shutdown")]
    Shutdown,
}

/// Result type for replication endpoint operations.
pub type HaResult<T> = Result<T, HaError>;
