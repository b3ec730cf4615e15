//! Framing for tunnel cells: a circuit ID, a command, and a body.
//!
//! Every message tied to a circuit travels as a cell. The body of a
//! cell is usually onion-encrypted hop by hop; this module only deals
//! with the cleartext framing (`u32 circuit_id ‖ u8 command ‖ body`)
//! and leaves the cryptography to the routing layer.

use std::fmt;
use std::num::NonZeroU32;

use tunnel_bytes::{EncodeResult, Reader, Writer};

use crate::msg::AnyTunnelMsg;
use crate::{Error, Result};

/// The identifier of a circuit on the overlay.
///
/// Circuit identifiers are chosen at random by the circuit initiator,
/// and are locally unique per peer pair. Zero is not a valid circuit
/// ID on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircId(NonZeroU32);

impl CircId {
    /// Construct a CircId from a raw value, if that value is nonzero.
    pub fn new(val: u32) -> Option<Self> {
        NonZeroU32::new(val).map(CircId)
    }

    /// Return the raw value of this circuit ID.
    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for CircId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for CircId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CircId({})", self.0)
    }
}

/// A command byte, describing the message type of a tunnel cell.
///
/// Unrecognized commands decode successfully (their body is kept as
/// raw bytes) so that a relay can forward cells it does not
/// understand.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TunnelCmd(u8);

impl TunnelCmd {
    /// Start a circuit at the receiving peer.
    pub const CREATE: TunnelCmd = TunnelCmd(1);
    /// Answer to a CREATE cell.
    pub const CREATED: TunnelCmd = TunnelCmd(2);
    /// Ask the terminal hop to extend the circuit by one peer.
    pub const EXTEND: TunnelCmd = TunnelCmd(3);
    /// Answer to an EXTEND cell.
    pub const EXTENDED: TunnelCmd = TunnelCmd(4);
    /// Tunneled datagram, to or from the exit.
    pub const DATA: TunnelCmd = TunnelCmd(5);
    /// Tear down a circuit.
    pub const DESTROY: TunnelCmd = TunnelCmd(6);
    /// Ask a peer to act as an introduction point for a hidden swarm.
    pub const ESTABLISH_INTRO: TunnelCmd = TunnelCmd(7);
    /// Answer to an ESTABLISH_INTRO cell.
    pub const INTRO_ESTABLISHED: TunnelCmd = TunnelCmd(8);
    /// Ask a peer to act as a rendezvous point.
    pub const ESTABLISH_RENDEZVOUS: TunnelCmd = TunnelCmd(9);
    /// Answer to an ESTABLISH_RENDEZVOUS cell.
    pub const RENDEZVOUS_ESTABLISHED: TunnelCmd = TunnelCmd(10);
    /// Look up the introduction points for a hidden swarm.
    pub const PEERS_REQUEST: TunnelCmd = TunnelCmd(11);
    /// Answer to a PEERS_REQUEST cell.
    pub const PEERS_RESPONSE: TunnelCmd = TunnelCmd(12);
    /// Start an end-to-end key exchange with a hidden seeder.
    pub const CREATE_E2E: TunnelCmd = TunnelCmd(13);
    /// Answer to a CREATE_E2E cell.
    pub const CREATED_E2E: TunnelCmd = TunnelCmd(14);
    /// Link two circuits together at a rendezvous point.
    pub const LINK_E2E: TunnelCmd = TunnelCmd(15);
    /// Answer to a LINK_E2E cell.
    pub const LINKED_E2E: TunnelCmd = TunnelCmd(16);
    /// Ask an exit to perform an HTTP request on our behalf.
    pub const HTTP_REQUEST: TunnelCmd = TunnelCmd(17);
    /// One fragment of the answer to an HTTP_REQUEST cell.
    pub const HTTP_RESPONSE: TunnelCmd = TunnelCmd(18);
    /// An onion-wrapped envelope: the body is another cell body
    /// (command byte plus message), encrypted once per hop.
    ///
    /// Everything except the link-local CREATE, CREATED, and DESTROY
    /// commands travels inside RELAY envelopes.
    pub const RELAY: TunnelCmd = TunnelCmd(19);

    /// Construct a TunnelCmd from its wire value.
    pub fn from_u8(v: u8) -> Self {
        TunnelCmd(v)
    }

    /// Return the wire value of this command.
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for TunnelCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            TunnelCmd::CREATE => "CREATE",
            TunnelCmd::CREATED => "CREATED",
            TunnelCmd::EXTEND => "EXTEND",
            TunnelCmd::EXTENDED => "EXTENDED",
            TunnelCmd::DATA => "DATA",
            TunnelCmd::DESTROY => "DESTROY",
            TunnelCmd::ESTABLISH_INTRO => "ESTABLISH_INTRO",
            TunnelCmd::INTRO_ESTABLISHED => "INTRO_ESTABLISHED",
            TunnelCmd::ESTABLISH_RENDEZVOUS => "ESTABLISH_RENDEZVOUS",
            TunnelCmd::RENDEZVOUS_ESTABLISHED => "RENDEZVOUS_ESTABLISHED",
            TunnelCmd::PEERS_REQUEST => "PEERS_REQUEST",
            TunnelCmd::PEERS_RESPONSE => "PEERS_RESPONSE",
            TunnelCmd::CREATE_E2E => "CREATE_E2E",
            TunnelCmd::CREATED_E2E => "CREATED_E2E",
            TunnelCmd::LINK_E2E => "LINK_E2E",
            TunnelCmd::LINKED_E2E => "LINKED_E2E",
            TunnelCmd::HTTP_REQUEST => "HTTP_REQUEST",
            TunnelCmd::HTTP_RESPONSE => "HTTP_RESPONSE",
            TunnelCmd::RELAY => "RELAY",
            _ => return write!(f, "<unrecognized {}>", self.0),
        };
        write!(f, "{}", name)
    }
}

impl fmt::Debug for TunnelCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelCmd({})", self)
    }
}

/// A decoded tunnel cell: a circuit ID together with its message.
#[derive(Clone, Debug)]
pub struct TunnelCell {
    /// The circuit this cell belongs to.
    circid: CircId,
    /// The message carried by this cell.
    msg: AnyTunnelMsg,
}

impl TunnelCell {
    /// Construct a new cell for a given circuit.
    pub fn new(circid: CircId, msg: AnyTunnelMsg) -> Self {
        TunnelCell { circid, msg }
    }

    /// Return the circuit ID of this cell.
    pub fn circid(&self) -> CircId {
        self.circid
    }

    /// Return a reference to the message of this cell.
    pub fn msg(&self) -> &AnyTunnelMsg {
        &self.msg
    }

    /// Consume this cell and return its components.
    pub fn into_circid_and_msg(self) -> (CircId, AnyTunnelMsg) {
        (self.circid, self.msg)
    }

    /// Encode this cell for transmission.
    pub fn encode(self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        w.write_u32(self.circid.get());
        w.write_u8(self.msg.cmd().get());
        self.msg.encode_onto(&mut w)?;
        Ok(w)
    }

    /// Decode a cell from received bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(bytes);
        let circid = r
            .take_u32()
            .map_err(|e| Error::from_bytes(e, "cell circuit id"))?;
        let circid = CircId::new(circid).ok_or(Error::CellProto("zero circuit id"))?;
        let cmd = TunnelCmd::from_u8(r.take_u8().map_err(|e| Error::from_bytes(e, "cell command"))?);
        let msg = AnyTunnelMsg::decode_from_reader(cmd, &mut r)?;
        Ok(TunnelCell { circid, msg })
    }
}

/// Helper used by relays: re-frame an (already encrypted) cell body
/// under a different circuit ID without decoding it.
pub fn reframe(circid: CircId, cmd: TunnelCmd, body: &[u8]) -> Vec<u8> {
    let mut w = Vec::with_capacity(5 + body.len());
    w.write_u32(circid.get());
    w.write_u8(cmd.get());
    w.write_all(body);
    w
}

/// Split an encoded cell into its circuit ID, command, and raw body.
///
/// Used by relays and exits, which must handle cells whose bodies they
/// cannot (yet) decrypt.
pub fn split_raw(bytes: &[u8]) -> Result<(CircId, TunnelCmd, &[u8])> {
    let mut r = Reader::from_slice(bytes);
    let circid = r
        .take_u32()
        .map_err(|e| Error::from_bytes(e, "cell circuit id"))?;
    let circid = CircId::new(circid).ok_or(Error::CellProto("zero circuit id"))?;
    let cmd = TunnelCmd::from_u8(r.take_u8().map_err(|e| Error::from_bytes(e, "cell command"))?);
    Ok((circid, cmd, r.take_rest()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::msg::Destroy;

    #[test]
    fn circid_nonzero() {
        assert!(CircId::new(0).is_none());
        let id = CircId::new(5).unwrap();
        assert_eq!(id.get(), 5);
        assert_eq!(format!("{}", id), "5");
    }

    #[test]
    fn cell_roundtrip() {
        let circid = CircId::new(0x0102_0304).unwrap();
        let cell = TunnelCell::new(circid, Destroy::new(3).into());
        let bytes = cell.encode().unwrap();
        assert_eq!(bytes, hex_literal::hex!("01020304 06 0003"));

        let cell = TunnelCell::decode(&bytes).unwrap();
        assert_eq!(cell.circid(), circid);
        assert_eq!(cell.msg().cmd(), TunnelCmd::DESTROY);
    }

    #[test]
    fn zero_circid_rejected() {
        let bytes = hex_literal::hex!("00000000 06 0003");
        assert!(TunnelCell::decode(&bytes).is_err());
    }

    #[test]
    fn reframe_raw() {
        let bytes = hex_literal::hex!("01020304 05 dead beef");
        let (circid, cmd, body) = split_raw(&bytes).unwrap();
        assert_eq!(circid.get(), 0x0102_0304);
        assert_eq!(cmd, TunnelCmd::DATA);
        assert_eq!(body, hex_literal::hex!("dead beef"));

        let new_id = CircId::new(9).unwrap();
        let reframed = reframe(new_id, cmd, body);
        assert_eq!(reframed, hex_literal::hex!("00000009 05 dead beef"));
    }
}
