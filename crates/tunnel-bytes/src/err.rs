//! Internal: error handling for tunnel-bytes.

use thiserror::Error;

/// Error type for decoding objects from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to read something, but the input did not have enough bytes.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// Called Reader::should_be_exhausted(), but found bytes anyway.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// The message contained something that violated the protocol.
    #[error("bad object: {0}")]
    BadMessage(&'static str),
}

/// Error type for encoding objects to bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EncodeError {
    /// A length value (of a variable-length field) was too large to
    /// be represented in its length prefix.
    #[error("object length too large to encode")]
    BadLengthValue,
    /// The object was not in a state that can be encoded.
    #[error("cannot encode object: {0}")]
    Message(&'static str),
}
