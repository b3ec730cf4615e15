//! Encoding and decoding for the frames of the EVA windowed transfer
//! protocol.
//!
//! EVA frames travel directly in endpoint frames; they are not tied to
//! a circuit. Every frame carries a 64-bit `nonce` distinguishing
//! transfers between the same peer pair: a frame whose nonce does not
//! match the active transfer is dropped by the state machine.

use tunnel_bytes::{EncodeResult, Readable, Reader, Result as BytesResult, Writer};

use crate::{Error, Result};

/// Frame-type byte for a WriteRequest.
pub const FRAME_EVA_WRITE_REQUEST: u8 = 0x10;
/// Frame-type byte for an Acknowledgement.
pub const FRAME_EVA_ACKNOWLEDGEMENT: u8 = 0x11;
/// Frame-type byte for a Data frame.
pub const FRAME_EVA_DATA: u8 = 0x12;
/// Frame-type byte for an Error frame.
pub const FRAME_EVA_ERROR: u8 = 0x13;
/// Frame-type byte for a Done frame.
pub const FRAME_EVA_DONE: u8 = 0x14;

/// A WriteRequest announces a new transfer: its total size, its nonce,
/// and an opaque tag describing what is being transferred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    /// Total number of bytes that will be transferred.
    pub data_size: u64,
    /// Uniqueness nonce for this transfer.
    pub nonce: u64,
    /// Opaque tag identifying the logical transfer.
    pub info: Vec<u8>,
}

impl Readable for WriteRequest {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(WriteRequest {
            data_size: r.take_u64()?,
            nonce: r.take_u64()?,
            info: r.take_rest().into(),
        })
    }
}

/// An Acknowledgement reports the next block the receiver expects, and
/// how many blocks it is willing to accept past that point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Index of the next block the receiver expects.
    pub number: u32,
    /// Number of blocks the receiver will accept starting at `number`.
    pub window_size: u32,
    /// Uniqueness nonce for this transfer.
    pub nonce: u64,
}

impl Readable for Acknowledgement {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Acknowledgement {
            number: r.take_u32()?,
            window_size: r.take_u32()?,
            nonce: r.take_u64()?,
        })
    }
}

/// A Data frame carries one block of the transfer.
///
/// A zero-length payload marks the end of the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    /// Index of this block within the transfer.
    pub block_index: u32,
    /// Uniqueness nonce for this transfer.
    pub nonce: u64,
    /// The bytes of this block (empty for the EOF marker).
    pub payload: Vec<u8>,
}

impl Readable for Data {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Data {
            block_index: r.take_u32()?,
            nonce: r.take_u64()?,
            payload: r.take_rest().into(),
        })
    }
}

/// An Error frame aborts a transfer with a human-readable explanation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Uniqueness nonce for this transfer.
    pub nonce: u64,
    /// Human-readable message explaining the abort.
    pub message: Vec<u8>,
}

impl Readable for ErrorFrame {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(ErrorFrame {
            nonce: r.take_u64()?,
            message: r.take_rest().into(),
        })
    }
}

/// A Done frame confirms that the sender considers the transfer
/// complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Done {
    /// Uniqueness nonce for this transfer.
    pub nonce: u64,
}

impl Readable for Done {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Done {
            nonce: r.take_u64()?,
        })
    }
}

/// Enumeration of every EVA frame type.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaFrame {
    /// Announce a new transfer.
    WriteRequest(WriteRequest),
    /// Report receiver progress and window.
    Acknowledgement(Acknowledgement),
    /// One block of the transfer.
    Data(Data),
    /// Abort the transfer.
    Error(ErrorFrame),
    /// Confirm transfer completion.
    Done(Done),
}

impl EvaFrame {
    /// Return the frame-type byte for this frame.
    pub fn frame_type(&self) -> u8 {
        match self {
            EvaFrame::WriteRequest(_) => FRAME_EVA_WRITE_REQUEST,
            EvaFrame::Acknowledgement(_) => FRAME_EVA_ACKNOWLEDGEMENT,
            EvaFrame::Data(_) => FRAME_EVA_DATA,
            EvaFrame::Error(_) => FRAME_EVA_ERROR,
            EvaFrame::Done(_) => FRAME_EVA_DONE,
        }
    }

    /// Return the nonce carried by this frame.
    pub fn nonce(&self) -> u64 {
        match self {
            EvaFrame::WriteRequest(f) => f.nonce,
            EvaFrame::Acknowledgement(f) => f.nonce,
            EvaFrame::Data(f) => f.nonce,
            EvaFrame::Error(f) => f.nonce,
            EvaFrame::Done(f) => f.nonce,
        }
    }

    /// Decode an EVA frame of type `frame_type` from the remaining
    /// bytes of `r`.
    pub fn decode_from_reader(frame_type: u8, r: &mut Reader<'_>) -> Result<Self> {
        let frame = match frame_type {
            FRAME_EVA_WRITE_REQUEST => EvaFrame::WriteRequest(
                r.extract()
                    .map_err(|e| Error::from_bytes(e, "EVA write-request"))?,
            ),
            FRAME_EVA_ACKNOWLEDGEMENT => EvaFrame::Acknowledgement(
                r.extract()
                    .map_err(|e| Error::from_bytes(e, "EVA acknowledgement"))?,
            ),
            FRAME_EVA_DATA => {
                EvaFrame::Data(r.extract().map_err(|e| Error::from_bytes(e, "EVA data"))?)
            }
            FRAME_EVA_ERROR => {
                EvaFrame::Error(r.extract().map_err(|e| Error::from_bytes(e, "EVA error"))?)
            }
            FRAME_EVA_DONE => {
                EvaFrame::Done(r.extract().map_err(|e| Error::from_bytes(e, "EVA done"))?)
            }
            _ => return Err(Error::FrameProto("not an EVA frame type")),
        };
        Ok(frame)
    }

    /// Consume this frame and encode its body onto `w`.
    pub fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        match self {
            EvaFrame::WriteRequest(f) => {
                w.write_u64(f.data_size);
                w.write_u64(f.nonce);
                w.write_all(&f.info);
            }
            EvaFrame::Acknowledgement(f) => {
                w.write_u32(f.number);
                w.write_u32(f.window_size);
                w.write_u64(f.nonce);
            }
            EvaFrame::Data(f) => {
                w.write_u32(f.block_index);
                w.write_u64(f.nonce);
                w.write_all(&f.payload);
            }
            EvaFrame::Error(f) => {
                w.write_u64(f.nonce);
                w.write_all(&f.message);
            }
            EvaFrame::Done(f) => {
                w.write_u64(f.nonce);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tunnel_bytes::Reader;

    /// Round-trip an EVA frame through its encoded form.
    fn roundtrip(frame: EvaFrame) -> EvaFrame {
        let frame_type = frame.frame_type();
        let mut w: Vec<u8> = Vec::new();
        frame.encode_onto(&mut w).unwrap();
        let mut r = Reader::from_slice(&w);
        EvaFrame::decode_from_reader(frame_type, &mut r).unwrap()
    }

    #[test]
    fn write_request() {
        let frame = EvaFrame::WriteRequest(WriteRequest {
            data_size: 100,
            nonce: 0xdead_beef,
            info: b"metadata".to_vec(),
        });
        assert_eq!(roundtrip(frame.clone()), frame);
        assert_eq!(frame.nonce(), 0xdead_beef);
    }

    #[test]
    fn acknowledgement() {
        let frame = EvaFrame::Acknowledgement(Acknowledgement {
            number: 4,
            window_size: 7,
            nonce: 1,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn data_empty_payload() {
        // The zero-length EOF marker must survive a round-trip.
        let frame = EvaFrame::Data(Data {
            block_index: 3,
            nonce: 5,
            payload: Vec::new(),
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn unknown_frame_type() {
        let mut r = Reader::from_slice(&[0; 8]);
        assert!(EvaFrame::decode_from_reader(0x77, &mut r).is_err());
    }
}
