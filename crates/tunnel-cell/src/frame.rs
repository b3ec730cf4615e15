//! The outermost framing of every datagram on the overlay.
//!
//! A frame is `u8 frame_type ‖ [u8;32] sender_public_key ‖ body`. The
//! frame type selects between tunnel cells, EVA transfer frames, and
//! the peer-sampling introduction walk. The sender key is carried as
//! an opaque identifier; nothing at this layer verifies it.

use tunnel_bytes::{Reader, Writer};

use crate::eva::{self, EvaFrame};
use crate::types::{PeerFlags, PeerId};
use crate::{Error, Result};

/// Frame-type byte for a tunnel cell.
pub const FRAME_CELL: u8 = 0x01;
/// Frame-type byte for an introduction request.
pub const FRAME_INTRO_REQUEST: u8 = 0x02;
/// Frame-type byte for an introduction response.
pub const FRAME_INTRO_RESPONSE: u8 = 0x03;

/// The body of an endpoint frame.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum FrameMsg {
    /// A tunnel cell, kept as raw bytes.
    ///
    /// Cells stay undecoded at this layer: a relay forwards cell
    /// bodies it cannot decrypt, so only the routing layer knows how
    /// far a given cell can be parsed.
    Cell(Vec<u8>),
    /// An EVA transfer frame.
    Eva(EvaFrame),
    /// A peer-sampling walk request, advertising our capabilities.
    IntroRequest {
        /// The flags the sender advertises.
        flags: PeerFlags,
    },
    /// Answer to an IntroRequest, advertising our capabilities back.
    IntroResponse {
        /// The flags the sender advertises.
        flags: PeerFlags,
    },
}

/// A decoded endpoint frame: the sender's key and the message.
#[derive(Clone, Debug)]
pub struct Frame {
    /// The public key the sender claims.
    sender: PeerId,
    /// The message carried by this frame.
    msg: FrameMsg,
}

impl Frame {
    /// Construct a new frame.
    pub fn new(sender: PeerId, msg: FrameMsg) -> Self {
        Frame { sender, msg }
    }

    /// Return the public key the sender claims.
    pub fn sender(&self) -> PeerId {
        self.sender
    }

    /// Return a reference to the message of this frame.
    pub fn msg(&self) -> &FrameMsg {
        &self.msg
    }

    /// Consume this frame and return its components.
    pub fn into_sender_and_msg(self) -> (PeerId, FrameMsg) {
        (self.sender, self.msg)
    }

    /// Encode this frame for transmission.
    pub fn encode(self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        match self.msg {
            FrameMsg::Cell(body) => {
                w.write_u8(FRAME_CELL);
                w.write(&self.sender)?;
                w.write_all(&body);
            }
            FrameMsg::Eva(frame) => {
                w.write_u8(frame.frame_type());
                w.write(&self.sender)?;
                frame.encode_onto(&mut w)?;
            }
            FrameMsg::IntroRequest { flags } => {
                w.write_u8(FRAME_INTRO_REQUEST);
                w.write(&self.sender)?;
                w.write(&flags)?;
            }
            FrameMsg::IntroResponse { flags } => {
                w.write_u8(FRAME_INTRO_RESPONSE);
                w.write(&self.sender)?;
                w.write(&flags)?;
            }
        }
        Ok(w)
    }

    /// Decode a frame from a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(bytes);
        let frame_type = r
            .take_u8()
            .map_err(|e| Error::from_bytes(e, "frame type"))?;
        let sender: PeerId = r
            .extract()
            .map_err(|e| Error::from_bytes(e, "frame sender key"))?;
        let msg = match frame_type {
            FRAME_CELL => FrameMsg::Cell(r.take_rest().into()),
            FRAME_INTRO_REQUEST => FrameMsg::IntroRequest {
                flags: r
                    .extract()
                    .map_err(|e| Error::from_bytes(e, "intro request"))?,
            },
            FRAME_INTRO_RESPONSE => FrameMsg::IntroResponse {
                flags: r
                    .extract()
                    .map_err(|e| Error::from_bytes(e, "intro response"))?,
            },
            t if (eva::FRAME_EVA_WRITE_REQUEST..=eva::FRAME_EVA_DONE).contains(&t) => {
                FrameMsg::Eva(EvaFrame::decode_from_reader(t, &mut r)?)
            }
            _ => return Err(Error::FrameProto("unknown frame type")),
        };
        Ok(Frame { sender, msg })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::eva::Done;

    #[test]
    fn cell_frame_roundtrip() {
        let sender = PeerId::new([9; 32]);
        let frame = Frame::new(sender, FrameMsg::Cell(vec![1, 2, 3, 4, 5]));
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], FRAME_CELL);
        assert_eq!(bytes.len(), 1 + 32 + 5);

        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.sender(), sender);
        match frame.msg() {
            FrameMsg::Cell(body) => assert_eq!(body, &vec![1, 2, 3, 4, 5]),
            _ => panic!("wrong frame type"),
        }
    }

    #[test]
    fn intro_frames_roundtrip() {
        let sender = PeerId::new([1; 32]);
        let flags = PeerFlags::RELAY.union(PeerFlags::EXIT_BT);
        let bytes = Frame::new(sender, FrameMsg::IntroRequest { flags })
            .encode()
            .unwrap();
        match Frame::decode(&bytes).unwrap().msg() {
            FrameMsg::IntroRequest { flags: f } => assert_eq!(*f, flags),
            _ => panic!("wrong frame type"),
        }
    }

    #[test]
    fn eva_frame_roundtrip() {
        let sender = PeerId::new([2; 32]);
        let bytes = Frame::new(sender, FrameMsg::Eva(EvaFrame::Done(Done { nonce: 3 })))
            .encode()
            .unwrap();
        match Frame::decode(&bytes).unwrap().msg() {
            FrameMsg::Eva(EvaFrame::Done(d)) => assert_eq!(d.nonce, 3),
            _ => panic!("wrong frame type"),
        }
    }

    #[test]
    fn truncated_frame() {
        assert!(Frame::decode(&[FRAME_CELL, 1, 2]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }
}
