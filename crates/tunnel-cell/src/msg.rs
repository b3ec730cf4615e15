//! Different kinds of messages that can be encoded in tunnel cells.

use tunnel_bytes::{
    EncodeError, EncodeResult, Readable, Reader, Result as BytesResult, Writeable, Writer,
};

use crate::cell::TunnelCmd;
use crate::types::{AddressPort, InfoHash, PeerId};
use crate::{Error, Result};

/// Trait for the 'bodies' of tunnel messages.
pub trait Body: Readable {
    /// Decode a tunnel cell body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self> {
        r.extract()
    }
    /// Consume this message and encode its body onto `w`.
    ///
    /// Does not encode anything _but_ the cell body.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>;
}

/// A Create message asks the receiving peer to become the first hop
/// of a new circuit.
///
/// It carries the initiator's ephemeral key half; peers respond with a
/// Created message on success, or ignore the request when the circuit
/// is refused.
#[derive(Clone, Debug)]
pub struct Create {
    /// The initiator's ephemeral public key.
    handshake: [u8; 32],
}

impl Create {
    /// Construct a new Create message from a handshake half.
    pub fn new(handshake: [u8; 32]) -> Self {
        Create { handshake }
    }
    /// Return the handshake half carried in this message.
    pub fn handshake(&self) -> &[u8; 32] {
        &self.handshake
    }
}

impl Readable for Create {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Create {
            handshake: r.extract()?,
        })
    }
}

impl Body for Create {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A Created message answers a Create message, completing the key
/// exchange for the new hop.
#[derive(Clone, Debug)]
pub struct Created {
    /// The responder's ephemeral public key.
    handshake: [u8; 32],
}

impl Created {
    /// Construct a new Created message.
    pub fn new(handshake: [u8; 32]) -> Self {
        Created { handshake }
    }
    /// Return the handshake half carried in this message.
    pub fn handshake(&self) -> &[u8; 32] {
        &self.handshake
    }
}

impl Readable for Created {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Created {
            handshake: r.extract()?,
        })
    }
}

impl Body for Created {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// An Extend message asks the current terminal hop of a circuit to
/// extend it by one peer.
#[derive(Clone, Debug)]
pub struct Extend {
    /// The address of the peer to extend to.
    node_addr: AddressPort,
    /// The identity key of the peer to extend to.
    node_key: PeerId,
    /// The initiator's ephemeral key half for the new hop.
    handshake: [u8; 32],
}

impl Extend {
    /// Construct a new Extend message.
    pub fn new(node_addr: AddressPort, node_key: PeerId, handshake: [u8; 32]) -> Self {
        Extend {
            node_addr,
            node_key,
            handshake,
        }
    }
    /// Return the address of the peer to extend to.
    pub fn node_addr(&self) -> AddressPort {
        self.node_addr
    }
    /// Return the identity key of the peer to extend to.
    pub fn node_key(&self) -> PeerId {
        self.node_key
    }
    /// Return the handshake half for the new hop.
    pub fn handshake(&self) -> &[u8; 32] {
        &self.handshake
    }
}

impl Readable for Extend {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Extend {
            node_addr: r.extract()?,
            node_key: r.extract()?,
            handshake: r.extract()?,
        })
    }
}

impl Body for Extend {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.node_addr)?;
        w.write(&self.node_key)?;
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// An Extended message relays the new hop's Created handshake back to
/// the circuit initiator.
#[derive(Clone, Debug)]
pub struct Extended {
    /// The new hop's ephemeral public key.
    handshake: [u8; 32],
}

impl Extended {
    /// Construct a new Extended message.
    pub fn new(handshake: [u8; 32]) -> Self {
        Extended { handshake }
    }
    /// Return the handshake half carried in this message.
    pub fn handshake(&self) -> &[u8; 32] {
        &self.handshake
    }
}

impl Readable for Extended {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Extended {
            handshake: r.extract()?,
        })
    }
}

impl Body for Extended {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A Data message carries one tunneled datagram.
///
/// Away from the initiator, `target` is the destination the exit
/// should forward the payload to. Toward the initiator, `target` is
/// the origin the payload came from. The all-zero address means "the
/// circuit endpoint itself" (used for end-to-end circuits, where no
/// exit forwarding happens).
#[derive(Clone, Debug)]
pub struct Data {
    /// Destination (or origin) of the payload.
    target: AddressPort,
    /// The tunneled datagram.
    payload: Vec<u8>,
}

impl Data {
    /// Construct a new Data message.
    pub fn new(target: AddressPort, payload: Vec<u8>) -> Self {
        Data { target, payload }
    }
    /// Return the destination (or origin) of the payload.
    pub fn target(&self) -> AddressPort {
        self.target
    }
    /// Return the tunneled datagram.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    /// Consume this message, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl Readable for Data {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Data {
            target: r.extract()?,
            payload: r.take_rest().into(),
        })
    }
}

impl Body for Data {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.target)?;
        w.write_all(&self.payload);
        Ok(())
    }
}

/// A Destroy message tears down a circuit.
///
/// On receiving a Destroy message, a peer drops its state for the
/// circuit and propagates the message along the circuit.
#[derive(Clone, Debug)]
pub struct Destroy {
    /// The reason for the teardown.
    reason: u16,
}

impl Destroy {
    /// Construct a new Destroy message.
    pub fn new(reason: u16) -> Self {
        Destroy { reason }
    }
    /// Return the teardown reason.
    pub fn reason(&self) -> u16 {
        self.reason
    }
}

impl Readable for Destroy {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Destroy {
            reason: r.take_u16()?,
        })
    }
}

impl Body for Destroy {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u16(self.reason);
        Ok(())
    }
}

/// An EstablishIntro message asks the terminal hop of a circuit to act
/// as an introduction point for a hidden swarm.
#[derive(Clone, Debug)]
pub struct EstablishIntro {
    /// Correlates the IntroEstablished answer with this request.
    identifier: u32,
    /// The lookup infohash of the swarm.
    info_hash: InfoHash,
}

impl EstablishIntro {
    /// Construct a new EstablishIntro message.
    pub fn new(identifier: u32, info_hash: InfoHash) -> Self {
        EstablishIntro {
            identifier,
            info_hash,
        }
    }
    /// Return the request identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the lookup infohash of the swarm.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
}

impl Readable for EstablishIntro {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(EstablishIntro {
            identifier: r.take_u32()?,
            info_hash: r.extract()?,
        })
    }
}

impl Body for EstablishIntro {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write(&self.info_hash)?;
        Ok(())
    }
}

/// An IntroEstablished message confirms an EstablishIntro request.
#[derive(Clone, Debug)]
pub struct IntroEstablished {
    /// The identifier of the request being answered.
    identifier: u32,
}

impl IntroEstablished {
    /// Construct a new IntroEstablished message.
    pub fn new(identifier: u32) -> Self {
        IntroEstablished { identifier }
    }
    /// Return the identifier of the request being answered.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
}

impl Readable for IntroEstablished {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(IntroEstablished {
            identifier: r.take_u32()?,
        })
    }
}

impl Body for IntroEstablished {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        Ok(())
    }
}

/// An EstablishRendezvous message asks the terminal hop of a circuit
/// to act as a rendezvous point, identified by a one-time cookie.
#[derive(Clone, Debug)]
pub struct EstablishRendezvous {
    /// Correlates the RendezvousEstablished answer with this request.
    identifier: u32,
    /// The one-time rendezvous cookie.
    cookie: [u8; 20],
}

impl EstablishRendezvous {
    /// Construct a new EstablishRendezvous message.
    pub fn new(identifier: u32, cookie: [u8; 20]) -> Self {
        EstablishRendezvous { identifier, cookie }
    }
    /// Return the request identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the rendezvous cookie.
    pub fn cookie(&self) -> &[u8; 20] {
        &self.cookie
    }
}

impl Readable for EstablishRendezvous {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(EstablishRendezvous {
            identifier: r.take_u32()?,
            cookie: r.extract()?,
        })
    }
}

impl Body for EstablishRendezvous {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write_all(&self.cookie);
        Ok(())
    }
}

/// A RendezvousEstablished message confirms an EstablishRendezvous
/// request, reporting the address at which the rendezvous point is
/// reachable by the other side.
#[derive(Clone, Debug)]
pub struct RendezvousEstablished {
    /// The identifier of the request being answered.
    identifier: u32,
    /// The externally-visible address of the rendezvous point.
    rendezvous_point: AddressPort,
}

impl RendezvousEstablished {
    /// Construct a new RendezvousEstablished message.
    pub fn new(identifier: u32, rendezvous_point: AddressPort) -> Self {
        RendezvousEstablished {
            identifier,
            rendezvous_point,
        }
    }
    /// Return the identifier of the request being answered.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the externally-visible address of the rendezvous point.
    pub fn rendezvous_point(&self) -> AddressPort {
        self.rendezvous_point
    }
}

impl Readable for RendezvousEstablished {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(RendezvousEstablished {
            identifier: r.take_u32()?,
            rendezvous_point: r.extract()?,
        })
    }
}

impl Body for RendezvousEstablished {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write(&self.rendezvous_point)?;
        Ok(())
    }
}

/// A PeersRequest message asks an introduction point for the seeders
/// it knows for a hidden swarm.
#[derive(Clone, Debug)]
pub struct PeersRequest {
    /// Correlates the PeersResponse answer with this request.
    identifier: u32,
    /// The lookup infohash of the swarm.
    info_hash: InfoHash,
}

impl PeersRequest {
    /// Construct a new PeersRequest message.
    pub fn new(identifier: u32, info_hash: InfoHash) -> Self {
        PeersRequest {
            identifier,
            info_hash,
        }
    }
    /// Return the request identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the lookup infohash of the swarm.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
}

impl Readable for PeersRequest {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(PeersRequest {
            identifier: r.take_u32()?,
            info_hash: r.extract()?,
        })
    }
}

impl Body for PeersRequest {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write(&self.info_hash)?;
        Ok(())
    }
}

/// One introduction-point entry in a PeersResponse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntroPoint {
    /// The address of the introduction point.
    pub address: AddressPort,
    /// The identity key of the seeder reachable through it.
    pub seeder_key: PeerId,
}

impl Readable for IntroPoint {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(IntroPoint {
            address: r.extract()?,
            seeder_key: r.extract()?,
        })
    }
}

impl Writeable for IntroPoint {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) -> EncodeResult<()> {
        w.write(&self.address)?;
        w.write(&self.seeder_key)?;
        Ok(())
    }
}

/// A PeersResponse message lists the introduction points known for a
/// hidden swarm.
#[derive(Clone, Debug)]
pub struct PeersResponse {
    /// The identifier of the request being answered.
    identifier: u32,
    /// The lookup infohash of the swarm.
    info_hash: InfoHash,
    /// The known introduction points (at most 255).
    peers: Vec<IntroPoint>,
}

impl PeersResponse {
    /// Construct a new PeersResponse message.
    pub fn new(identifier: u32, info_hash: InfoHash, peers: Vec<IntroPoint>) -> Self {
        PeersResponse {
            identifier,
            info_hash,
            peers,
        }
    }
    /// Return the identifier of the request being answered.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the lookup infohash of the swarm.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
    /// Return the introduction points listed in this message.
    pub fn peers(&self) -> &[IntroPoint] {
        &self.peers
    }
}

impl Readable for PeersResponse {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let identifier = r.take_u32()?;
        let info_hash = r.extract()?;
        let n = r.take_u8()? as usize;
        let peers = r.extract_n(n)?;
        Ok(PeersResponse {
            identifier,
            info_hash,
            peers,
        })
    }
}

impl Body for PeersResponse {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write(&self.info_hash)?;
        let n: u8 = self
            .peers
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u8(n);
        for peer in &self.peers {
            w.write(peer)?;
        }
        Ok(())
    }
}

/// A CreateE2e message starts the end-to-end key exchange with a
/// hidden seeder, relayed through an introduction point.
///
/// Besides the key half, it tells the seeder where to meet: the
/// rendezvous point the downloader has prepared, and the one-time
/// cookie that identifies the meeting there.
#[derive(Clone, Debug)]
pub struct CreateE2e {
    /// The lookup infohash of the swarm being joined.
    info_hash: InfoHash,
    /// The downloader's ephemeral key half.
    handshake: [u8; 32],
    /// The rendezvous cookie to present at the rendezvous point.
    cookie: [u8; 20],
    /// The rendezvous point's address.
    rendezvous_point: AddressPort,
}

impl CreateE2e {
    /// Construct a new CreateE2e message.
    pub fn new(
        info_hash: InfoHash,
        handshake: [u8; 32],
        cookie: [u8; 20],
        rendezvous_point: AddressPort,
    ) -> Self {
        CreateE2e {
            info_hash,
            handshake,
            cookie,
            rendezvous_point,
        }
    }
    /// Return the lookup infohash of the swarm being joined.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
    /// Return the handshake half carried in this message.
    pub fn handshake(&self) -> &[u8; 32] {
        &self.handshake
    }
    /// Return the rendezvous cookie.
    pub fn cookie(&self) -> &[u8; 20] {
        &self.cookie
    }
    /// Return the rendezvous point's address.
    pub fn rendezvous_point(&self) -> AddressPort {
        self.rendezvous_point
    }
}

impl Readable for CreateE2e {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(CreateE2e {
            info_hash: r.extract()?,
            handshake: r.extract()?,
            cookie: r.extract()?,
            rendezvous_point: r.extract()?,
        })
    }
}

impl Body for CreateE2e {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.info_hash)?;
        w.write_all(&self.handshake);
        w.write_all(&self.cookie);
        w.write(&self.rendezvous_point)?;
        Ok(())
    }
}

/// A CreatedE2e message answers a CreateE2e, completing the
/// end-to-end key exchange.
#[derive(Clone, Debug)]
pub struct CreatedE2e {
    /// The seeder's ephemeral key half.
    handshake: [u8; 32],
}

impl CreatedE2e {
    /// Construct a new CreatedE2e message.
    pub fn new(handshake: [u8; 32]) -> Self {
        CreatedE2e { handshake }
    }
    /// Return the handshake half carried in this message.
    pub fn handshake(&self) -> &[u8; 32] {
        &self.handshake
    }
}

impl Readable for CreatedE2e {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(CreatedE2e {
            handshake: r.extract()?,
        })
    }
}

impl Body for CreatedE2e {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A LinkE2e message asks a rendezvous point to splice this circuit to
/// the circuit that established the matching cookie.
#[derive(Clone, Debug)]
pub struct LinkE2e {
    /// The rendezvous cookie to match.
    cookie: [u8; 20],
}

impl LinkE2e {
    /// Construct a new LinkE2e message.
    pub fn new(cookie: [u8; 20]) -> Self {
        LinkE2e { cookie }
    }
    /// Return the rendezvous cookie.
    pub fn cookie(&self) -> &[u8; 20] {
        &self.cookie
    }
}

impl Readable for LinkE2e {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(LinkE2e {
            cookie: r.extract()?,
        })
    }
}

impl Body for LinkE2e {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.cookie);
        Ok(())
    }
}

/// A LinkedE2e message confirms that a LinkE2e succeeded and the
/// end-to-end circuit is complete.
#[derive(Clone, Debug, Default)]
pub struct LinkedE2e {}

impl LinkedE2e {
    /// Construct a new LinkedE2e message.
    pub fn new() -> Self {
        LinkedE2e {}
    }
}

impl Readable for LinkedE2e {
    fn take_from(_r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(LinkedE2e {})
    }
}

impl Body for LinkedE2e {
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// An HttpRequest message asks the exit of a circuit to perform a TCP
/// HTTP request and return the response.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// Correlates HttpResponse fragments with this request.
    identifier: u32,
    /// The server to connect to.
    target: AddressPort,
    /// The raw HTTP request to write.
    request: Vec<u8>,
}

impl HttpRequest {
    /// Construct a new HttpRequest message.
    pub fn new(identifier: u32, target: AddressPort, request: Vec<u8>) -> Self {
        HttpRequest {
            identifier,
            target,
            request,
        }
    }
    /// Return the request identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the server to connect to.
    pub fn target(&self) -> AddressPort {
        self.target
    }
    /// Return the raw HTTP request.
    pub fn request(&self) -> &[u8] {
        &self.request
    }
}

impl Readable for HttpRequest {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(HttpRequest {
            identifier: r.take_u32()?,
            target: r.extract()?,
            request: r.take_rest().into(),
        })
    }
}

impl Body for HttpRequest {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write(&self.target)?;
        w.write_all(&self.request);
        Ok(())
    }
}

/// An HttpResponse message carries one fragment of the response to an
/// HttpRequest.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// The identifier of the request being answered.
    identifier: u32,
    /// Zero-based index of this fragment.
    part: u16,
    /// Total number of fragments in the response.
    total: u16,
    /// The bytes of this fragment.
    response: Vec<u8>,
}

impl HttpResponse {
    /// Construct a new HttpResponse fragment.
    pub fn new(identifier: u32, part: u16, total: u16, response: Vec<u8>) -> Self {
        HttpResponse {
            identifier,
            part,
            total,
            response,
        }
    }
    /// Return the identifier of the request being answered.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    /// Return the zero-based index of this fragment.
    pub fn part(&self) -> u16 {
        self.part
    }
    /// Return the total number of fragments in the response.
    pub fn total(&self) -> u16 {
        self.total
    }
    /// Return the bytes of this fragment.
    pub fn response(&self) -> &[u8] {
        &self.response
    }
    /// Consume this message, returning its fragment bytes.
    pub fn into_response(self) -> Vec<u8> {
        self.response
    }
}

impl Readable for HttpResponse {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(HttpResponse {
            identifier: r.take_u32()?,
            part: r.take_u16()?,
            total: r.take_u16()?,
            response: r.take_rest().into(),
        })
    }
}

impl Body for HttpResponse {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.identifier);
        w.write_u16(self.part);
        w.write_u16(self.total);
        w.write_all(&self.response);
        Ok(())
    }
}

/// A cell whose command we don't recognize.
///
/// Relays forward these unchanged; endpoints drop them.
#[derive(Clone, Debug)]
pub struct Unrecognized {
    /// The unrecognized command byte.
    cmd: TunnelCmd,
    /// The raw body of the cell.
    body: Vec<u8>,
}

impl Unrecognized {
    /// Return the command byte of this cell.
    pub fn cmd(&self) -> TunnelCmd {
        self.cmd
    }
    /// Return the raw body of this cell.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Enumeration of every known tunnel message type.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum AnyTunnelMsg {
    /// Start a circuit at the receiving peer.
    Create(Create),
    /// Answer to a Create message.
    Created(Created),
    /// Extend the circuit by one peer.
    Extend(Extend),
    /// Answer to an Extend message.
    Extended(Extended),
    /// A tunneled datagram.
    Data(Data),
    /// Tear down a circuit.
    Destroy(Destroy),
    /// Establish an introduction point.
    EstablishIntro(EstablishIntro),
    /// Answer to EstablishIntro.
    IntroEstablished(IntroEstablished),
    /// Establish a rendezvous point.
    EstablishRendezvous(EstablishRendezvous),
    /// Answer to EstablishRendezvous.
    RendezvousEstablished(RendezvousEstablished),
    /// Look up introduction points for a swarm.
    PeersRequest(PeersRequest),
    /// Answer to PeersRequest.
    PeersResponse(PeersResponse),
    /// Start the end-to-end key exchange.
    CreateE2e(CreateE2e),
    /// Answer to CreateE2e.
    CreatedE2e(CreatedE2e),
    /// Splice circuits at a rendezvous point.
    LinkE2e(LinkE2e),
    /// Answer to LinkE2e.
    LinkedE2e(LinkedE2e),
    /// Exit-side HTTP request.
    HttpRequest(HttpRequest),
    /// One fragment of an HTTP response.
    HttpResponse(HttpResponse),
    /// Any cell whose command we don't recognize.
    Unrecognized(Unrecognized),
}

/// Generate From impls for wrapping message bodies in [`AnyTunnelMsg`].
macro_rules! msg_into {
    { $( $body:ident , )* } => {
        $(
            impl From<$body> for AnyTunnelMsg {
                fn from(m: $body) -> AnyTunnelMsg {
                    AnyTunnelMsg::$body(m)
                }
            }
        )*
    };
}

msg_into! {
    Create,
    Created,
    Extend,
    Extended,
    Data,
    Destroy,
    EstablishIntro,
    IntroEstablished,
    EstablishRendezvous,
    RendezvousEstablished,
    PeersRequest,
    PeersResponse,
    CreateE2e,
    CreatedE2e,
    LinkE2e,
    LinkedE2e,
    HttpRequest,
    HttpResponse,
}

impl AnyTunnelMsg {
    /// Return the command byte for this message.
    pub fn cmd(&self) -> TunnelCmd {
        use AnyTunnelMsg::*;
        match self {
            Create(_) => TunnelCmd::CREATE,
            Created(_) => TunnelCmd::CREATED,
            Extend(_) => TunnelCmd::EXTEND,
            Extended(_) => TunnelCmd::EXTENDED,
            Data(_) => TunnelCmd::DATA,
            Destroy(_) => TunnelCmd::DESTROY,
            EstablishIntro(_) => TunnelCmd::ESTABLISH_INTRO,
            IntroEstablished(_) => TunnelCmd::INTRO_ESTABLISHED,
            EstablishRendezvous(_) => TunnelCmd::ESTABLISH_RENDEZVOUS,
            RendezvousEstablished(_) => TunnelCmd::RENDEZVOUS_ESTABLISHED,
            PeersRequest(_) => TunnelCmd::PEERS_REQUEST,
            PeersResponse(_) => TunnelCmd::PEERS_RESPONSE,
            CreateE2e(_) => TunnelCmd::CREATE_E2E,
            CreatedE2e(_) => TunnelCmd::CREATED_E2E,
            LinkE2e(_) => TunnelCmd::LINK_E2E,
            LinkedE2e(_) => TunnelCmd::LINKED_E2E,
            HttpRequest(_) => TunnelCmd::HTTP_REQUEST,
            HttpResponse(_) => TunnelCmd::HTTP_RESPONSE,
            Unrecognized(u) => u.cmd(),
        }
    }

    /// Decode a message of type `cmd` from the remaining bytes of `r`.
    pub fn decode_from_reader(cmd: TunnelCmd, r: &mut Reader<'_>) -> Result<Self> {
        /// Decode a single known body type, mapping its error.
        macro_rules! decode {
            ($body:ident, $name:expr) => {
                $body::decode_from_reader(r)
                    .map_err(|e| Error::from_bytes(e, $name))?
                    .into()
            };
        }
        Ok(match cmd {
            TunnelCmd::CREATE => decode!(Create, "CREATE cell"),
            TunnelCmd::CREATED => decode!(Created, "CREATED cell"),
            TunnelCmd::EXTEND => decode!(Extend, "EXTEND cell"),
            TunnelCmd::EXTENDED => decode!(Extended, "EXTENDED cell"),
            TunnelCmd::DATA => decode!(Data, "DATA cell"),
            TunnelCmd::DESTROY => decode!(Destroy, "DESTROY cell"),
            TunnelCmd::ESTABLISH_INTRO => decode!(EstablishIntro, "ESTABLISH_INTRO cell"),
            TunnelCmd::INTRO_ESTABLISHED => decode!(IntroEstablished, "INTRO_ESTABLISHED cell"),
            TunnelCmd::ESTABLISH_RENDEZVOUS => {
                decode!(EstablishRendezvous, "ESTABLISH_RENDEZVOUS cell")
            }
            TunnelCmd::RENDEZVOUS_ESTABLISHED => {
                decode!(RendezvousEstablished, "RENDEZVOUS_ESTABLISHED cell")
            }
            TunnelCmd::PEERS_REQUEST => decode!(PeersRequest, "PEERS_REQUEST cell"),
            TunnelCmd::PEERS_RESPONSE => decode!(PeersResponse, "PEERS_RESPONSE cell"),
            TunnelCmd::CREATE_E2E => decode!(CreateE2e, "CREATE_E2E cell"),
            TunnelCmd::CREATED_E2E => decode!(CreatedE2e, "CREATED_E2E cell"),
            TunnelCmd::LINK_E2E => decode!(LinkE2e, "LINK_E2E cell"),
            TunnelCmd::LINKED_E2E => decode!(LinkedE2e, "LINKED_E2E cell"),
            TunnelCmd::HTTP_REQUEST => decode!(HttpRequest, "HTTP_REQUEST cell"),
            TunnelCmd::HTTP_RESPONSE => decode!(HttpResponse, "HTTP_RESPONSE cell"),
            _ => AnyTunnelMsg::Unrecognized(Unrecognized {
                cmd,
                body: r.take_rest().into(),
            }),
        })
    }

    /// Consume this message and encode its body onto `w`.
    pub fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        use AnyTunnelMsg::*;
        match self {
            Create(m) => m.encode_onto(w)?,
            Created(m) => m.encode_onto(w)?,
            Extend(m) => m.encode_onto(w)?,
            Extended(m) => m.encode_onto(w)?,
            Data(m) => m.encode_onto(w)?,
            Destroy(m) => m.encode_onto(w)?,
            EstablishIntro(m) => m.encode_onto(w)?,
            IntroEstablished(m) => m.encode_onto(w)?,
            EstablishRendezvous(m) => m.encode_onto(w)?,
            RendezvousEstablished(m) => m.encode_onto(w)?,
            PeersRequest(m) => m.encode_onto(w)?,
            PeersResponse(m) => m.encode_onto(w)?,
            CreateE2e(m) => m.encode_onto(w)?,
            CreatedE2e(m) => m.encode_onto(w)?,
            LinkE2e(m) => m.encode_onto(w)?,
            LinkedE2e(m) => m.encode_onto(w)?,
            HttpRequest(m) => m.encode_onto(w)?,
            HttpResponse(m) => m.encode_onto(w)?,
            Unrecognized(u) => w.write_all(&u.body),
        }
        Ok(())
    }
}
