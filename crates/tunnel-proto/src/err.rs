//! Define an error type for the tunnel-proto crate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error type for the tunnel-proto crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while decoding an object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] tunnel_bytes::Error),
    /// An error occurred in the cell-handling layer.
    #[error("cell error: {0}")]
    CellErr(#[from] tunnel_cell::Error),
    /// An EVA transfer failed.
    #[error("transfer error: {0}")]
    TransferErr(#[from] tunnel_eva::EvaError),
    /// An operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// A peer refused a request, or sent a cell we will not accept.
    #[error("peer refused: {0}")]
    PeerRefused(&'static str),
    /// A circuit-extension handshake failed.
    #[error("handshake failed: {0}")]
    CryptoFailure(&'static str),
    /// A budget or cap was reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A peer violated the protocol.
    #[error("protocol violation: {0}")]
    CircProto(String),
    /// An error from the io system.
    #[error("io error: {0}")]
    IoErr(#[source] Arc<std::io::Error>),
    /// No circuit was available (or could be built) for the request.
    #[error("no suitable circuit available")]
    NoCircuit,
    /// The community is shutting down.
    #[error("community shut down")]
    Shutdown,
    /// A programming error somewhere in this crate or its caller.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoErr(Arc::new(e))
    }
}
