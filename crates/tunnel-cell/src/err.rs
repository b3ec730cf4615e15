//! Define an error type for the tunnel-cell crate.

use thiserror::Error;

/// An error type for the tunnel-cell crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the tunnel_bytes crate while decoding an
    /// object.
    #[error("error while parsing {parsed}")]
    BytesErr {
        /// The error that occurred.
        #[source]
        err: tunnel_bytes::Error,
        /// The thing that was being parsed.
        parsed: &'static str,
    },
    /// We encountered an error while encoding an outgoing message.
    ///
    /// This is likely to be a bug in somebody's code: either the code in
    /// this crate, or in the calling code that provided an unencodable
    /// message.
    #[error("error while encoding message")]
    EncodeErr(#[from] tunnel_bytes::EncodeError),
    /// Protocol violation at the framing level.
    #[error("frame protocol violation: {0}")]
    FrameProto(&'static str),
    /// Protocol violation at the cell level.
    #[error("cell protocol violation: {0}")]
    CellProto(&'static str),
}

impl Error {
    /// Wrap a byte-parsing error, recording what we were parsing.
    pub(crate) fn from_bytes(err: tunnel_bytes::Error, parsed: &'static str) -> Self {
        Error::BytesErr { err, parsed }
    }
}
