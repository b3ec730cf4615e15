//! Value types shared by the wire messages of the tunnel overlay.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tunnel_bytes::{EncodeResult, Error as BytesError, Readable, Reader, Result, Writeable, Writer};

/// Indicates an [`AddressPort`] holding an IPv4 address.
const T_IPV4: u8 = 0x04;
/// Indicates an [`AddressPort`] holding an IPv6 address.
const T_IPV6: u8 = 0x06;

/// The public identity key of a peer, as carried on the wire.
///
/// This is an opaque 32-byte value: the overlay treats it as an
/// identifier and never interprets it cryptographically at the framing
/// layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Construct a PeerId from raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    /// Return the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key fingerprints are long; the first eight bytes are enough to
        // tell peers apart in a log line.
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…")
    }
}

impl Readable for PeerId {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(PeerId(r.extract()?))
    }
}

impl Writeable for PeerId {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) -> EncodeResult<()> {
        w.write_all(&self.0[..]);
        Ok(())
    }
}

/// A 20-byte BitTorrent infohash.
///
/// Depending on context this is either a real infohash or a *lookup*
/// infohash (the hashed form used in rendezvous traffic).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Construct an InfoHash from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        InfoHash(bytes)
    }

    /// Return the raw bytes of this infohash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Readable for InfoHash {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(InfoHash(r.extract()?))
    }
}

impl Writeable for InfoHash {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) -> EncodeResult<()> {
        w.write_all(&self.0[..]);
        Ok(())
    }
}

/// The set of capabilities a peer advertises to the overlay.
///
/// Encoded as a 16-bit mask. Unknown bits are preserved on decode so
/// that newer peers can advertise flags we don't know about yet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct PeerFlags(u16);

impl PeerFlags {
    /// The peer is willing to relay circuits for others.
    pub const RELAY: PeerFlags = PeerFlags(0x0001);
    /// The peer is willing to exit BitTorrent traffic.
    pub const EXIT_BT: PeerFlags = PeerFlags(0x0002);
    /// The peer is willing to exit overlay (IPv8) traffic.
    pub const EXIT_IPV8: PeerFlags = PeerFlags(0x0004);
    /// The peer is willing to exit HTTP requests.
    pub const EXIT_HTTP: PeerFlags = PeerFlags(0x8000);

    /// Construct an empty flag set.
    pub fn empty() -> Self {
        PeerFlags(0)
    }

    /// Construct a flag set from its wire representation.
    pub fn from_bits(bits: u16) -> Self {
        PeerFlags(bits)
    }

    /// Return the wire representation of this flag set.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Return true if every flag in `other` is set in this set.
    pub fn contains(&self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Add every flag in `other` to this set.
    pub fn insert(&mut self, other: PeerFlags) {
        self.0 |= other.0;
    }

    /// Return the union of this set and `other`.
    pub fn union(self, other: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 | other.0)
    }
}

impl Readable for PeerFlags {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(PeerFlags(r.take_u16()?))
    }
}

impl Writeable for PeerFlags {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) -> EncodeResult<()> {
        w.write_u16(self.0);
        Ok(())
    }
}

/// An IP address and port, as carried in cells.
///
/// Encoded as a one-byte address-type tag, the address bytes, and a
/// 16-bit port.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AddressPort {
    /// The IP address.
    addr: IpAddr,
    /// The port.
    port: u16,
}

impl AddressPort {
    /// Construct a new AddressPort.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        AddressPort { addr, port }
    }

    /// Return the IP address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Return the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return true if this is the all-zero "unspecified" address used to
    /// mean "the circuit origin" in data cells.
    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified() && self.port == 0
    }

    /// The all-zero address, used in data cells to mean "the circuit
    /// origin" rather than an exit destination.
    pub fn unspecified() -> Self {
        AddressPort {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl From<SocketAddr> for AddressPort {
    fn from(sa: SocketAddr) -> Self {
        AddressPort {
            addr: sa.ip(),
            port: sa.port(),
        }
    }
}

impl From<AddressPort> for SocketAddr {
    fn from(ap: AddressPort) -> Self {
        SocketAddr::new(ap.addr, ap.port)
    }
}

impl fmt::Display for AddressPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}

impl Readable for AddressPort {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let tag = r.take_u8()?;
        let addr = match tag {
            T_IPV4 => {
                let octets: [u8; 4] = r.extract()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            T_IPV6 => {
                let octets: [u8; 16] = r.extract()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(BytesError::BadMessage("unknown address type")),
        };
        let port = r.take_u16()?;
        Ok(AddressPort { addr, port })
    }
}

impl Writeable for AddressPort {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) -> EncodeResult<()> {
        match self.addr {
            IpAddr::V4(v4) => {
                w.write_u8(T_IPV4);
                w.write_all(&v4.octets());
            }
            IpAddr::V6(v6) => {
                w.write_u8(T_IPV6);
                w.write_all(&v6.octets());
            }
        }
        w.write_u16(self.port);
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

    /// Helper: encode a Writeable into a fresh vector.
    fn enc<W: Writeable>(w: &W) -> Vec<u8> {
        let mut v = Vec::new();
        v.write(w).unwrap();
        v
    }

    #[test]
    fn address_port_v4() {
        let ap = AddressPort::new("1.2.3.4".parse().unwrap(), 8080);
        let bytes = enc(&ap);
        assert_eq!(bytes, hex_literal::hex!("04 01020304 1f90"));
        let mut r = Reader::from_slice(&bytes);
        assert_eq!(r.extract::<AddressPort>().unwrap(), ap);
    }

    #[test]
    fn address_port_v6() {
        let ap = AddressPort::new("::1".parse().unwrap(), 443);
        let bytes = enc(&ap);
        assert_eq!(bytes.len(), 1 + 16 + 2);
        let mut r = Reader::from_slice(&bytes);
        assert_eq!(r.extract::<AddressPort>().unwrap(), ap);
    }

    #[test]
    fn address_port_bad_tag() {
        let bytes = hex_literal::hex!("07 01020304 1f90");
        let mut r = Reader::from_slice(&bytes);
        assert!(r.extract::<AddressPort>().is_err());
    }

    #[test]
    fn peer_flags() {
        let mut flags = PeerFlags::RELAY;
        flags.insert(PeerFlags::EXIT_BT);
        assert!(flags.contains(PeerFlags::EXIT_BT));
        assert!(!flags.contains(PeerFlags::EXIT_HTTP));
        assert_eq!(flags.bits(), 0x0003);

        let all = flags.union(PeerFlags::EXIT_HTTP);
        assert!(all.contains(PeerFlags::EXIT_HTTP));
        // Unknown bits survive a decode round-trip.
        let mystery = PeerFlags::from_bits(0x0300);
        assert_eq!(enc(&mystery), vec![0x03, 0x00]);
    }

    #[test]
    fn unspecified_address() {
        assert!(AddressPort::unspecified().is_unspecified());
        let real = AddressPort::new("1.2.3.4".parse().unwrap(), 0);
        assert!(!real.is_unspecified());
    }
}
