//! Define an error type for the tunnel-eva crate.

use thiserror::Error;

/// An error terminating an EVA transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaError {
    /// The peer did not make progress within the allowed number of
    /// retransmission attempts.
    #[error("transfer timed out")]
    Timeout,
    /// A transfer in this direction is already active with this peer.
    #[error("already busy with a transfer for this peer")]
    Busy,
    /// The announced (or received) data size exceeds what we accept.
    #[error("transfer size {size} exceeds limit {limit}")]
    Size {
        /// The size that was announced or accumulated.
        size: u64,
        /// The configured limit that was exceeded.
        limit: u64,
    },
    /// The transfer was cancelled locally.
    #[error("transfer cancelled: {0}")]
    Cancelled(String),
    /// The peer aborted the transfer with an ERROR frame.
    #[error("peer aborted transfer: {0}")]
    Remote(String),
    /// The protocol is shutting down.
    #[error("protocol shut down")]
    Shutdown,
}
