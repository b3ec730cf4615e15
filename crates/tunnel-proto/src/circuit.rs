//! Circuits we initiated, and the hops that make them up.

use std::net::SocketAddr;
use std::time::Instant;

use futures::channel::oneshot;
use tracing::debug;
use tunnel_cell::{CircId, InfoHash, PeerFlags, PeerId};

use crate::crypto::{HandshakeState, SessionKeys};
use crate::Result;

/// The lifecycle state of a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitState {
    /// Waiting for the first hop's CREATED.
    Building,
    /// Waiting for a further hop's EXTENDED.
    Extending,
    /// Fully built; the circuit accepts cells.
    Ready,
    /// Being torn down; no new traffic is accepted.
    Closing,
    /// Torn down. Terminal.
    Closed,
}

/// What a circuit is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitType {
    /// General tunneled data (BitTorrent, HTTP-over-tunnel).
    Data,
    /// A seeder's circuit to one of its introduction points.
    IpSeeder,
    /// A seeder's circuit to a rendezvous point.
    RpSeeder,
    /// A downloader's circuit to a rendezvous point.
    RpDownloader,
    /// A downloader's circuit to an introduction point.
    Intro,
}

/// One negotiated hop of a circuit.
pub struct Hop {
    /// The hop's UDP address.
    pub address: SocketAddr,
    /// The hop's identity key.
    pub peer_key: PeerId,
    /// The keys negotiated with this hop.
    pub keys: SessionKeys,
}

/// A hop we have sent a handshake to but not yet heard back from.
pub(crate) struct PendingHop {
    /// The hop's UDP address.
    pub(crate) address: SocketAddr,
    /// The hop's identity key.
    pub(crate) peer_key: PeerId,
    /// Our half-open handshake.
    pub(crate) handshake: HandshakeState,
}

/// End-to-end keys for a hidden-swarm circuit, and whether we were the
/// initiator of the e2e handshake.
struct E2eKeys {
    /// The negotiated keys.
    keys: SessionKeys,
    /// True if we initiated (the downloader side).
    initiator: bool,
}

/// A circuit this node initiated.
///
/// Created by the path builder, mutated by cell handlers and the
/// dispatcher, removed exactly once by
/// [`TunnelCommunity`](crate::TunnelCommunity) teardown.
pub struct Circuit {
    /// The circuit's locally unique identifier.
    circuit_id: CircId,
    /// The number of hops this circuit must reach to become ready.
    goal_hops: u8,
    /// What the circuit is for.
    ctype: CircuitType,
    /// Flags the terminal hop must advertise.
    required_exit_flags: PeerFlags,
    /// The hidden swarm this circuit serves, if any.
    info_hash: Option<InfoHash>,
    /// The circuit's lifecycle state.
    state: CircuitState,
    /// Negotiated hops, first hop first.
    hops: Vec<Hop>,
    /// The hop currently being negotiated.
    unverified_hop: Option<PendingHop>,
    /// Remaining peers to extend through, in order.
    planned_hops: Vec<(SocketAddr, PeerId)>,
    /// End-to-end keys, for circuits linked at a rendezvous point.
    e2e: Option<E2eKeys>,
    /// Bytes sent into this circuit. Monotone.
    bytes_up: u64,
    /// Bytes received from this circuit. Monotone.
    bytes_down: u64,
    /// When the circuit was created.
    created_at: Instant,
    /// Deadline bookkeeping: when the current build step started.
    last_activity: Instant,
    /// Which build attempt of its logical request this circuit is.
    attempt: u32,
    /// Callers waiting for the circuit to become ready (or fail).
    ready_waiters: Vec<oneshot::Sender<bool>>,
    /// Set once teardown ran, making teardown idempotent.
    destroyed: bool,
}

impl Circuit {
    /// Construct a new circuit in the `Building` state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        circuit_id: CircId,
        goal_hops: u8,
        ctype: CircuitType,
        required_exit_flags: PeerFlags,
        info_hash: Option<InfoHash>,
        planned_hops: Vec<(SocketAddr, PeerId)>,
        attempt: u32,
        now: Instant,
    ) -> Self {
        Circuit {
            circuit_id,
            goal_hops,
            ctype,
            required_exit_flags,
            info_hash,
            state: CircuitState::Building,
            hops: Vec::new(),
            unverified_hop: None,
            planned_hops,
            e2e: None,
            bytes_up: 0,
            bytes_down: 0,
            created_at: now,
            last_activity: now,
            attempt,
            ready_waiters: Vec::new(),
            destroyed: false,
        }
    }

    /// Return the circuit's identifier.
    pub fn circuit_id(&self) -> CircId {
        self.circuit_id
    }

    /// Return the circuit's state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Return what the circuit is for.
    pub fn ctype(&self) -> CircuitType {
        self.ctype
    }

    /// Return the hop count this circuit was requested with.
    pub fn goal_hops(&self) -> u8 {
        self.goal_hops
    }

    /// Return the flags required of the terminal hop.
    pub fn required_exit_flags(&self) -> PeerFlags {
        self.required_exit_flags
    }

    /// Return the hidden swarm this circuit serves, if any.
    pub fn info_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    /// Bind this circuit to a hidden swarm.
    pub(crate) fn set_info_hash(&mut self, info_hash: InfoHash) {
        self.info_hash = Some(info_hash);
    }

    /// Return the negotiated hops, first hop first.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Return the first hop, if the circuit has one.
    pub fn first_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }

    /// Return bytes sent into this circuit.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Return bytes received from this circuit.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    /// Return when the circuit was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Return which build attempt of its logical request this is.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return when the current build step started.
    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record traffic sent into this circuit.
    pub(crate) fn record_up(&mut self, n: usize) {
        self.bytes_up += n as u64;
    }

    /// Record traffic received from this circuit.
    pub(crate) fn record_down(&mut self, n: usize) {
        self.bytes_down += n as u64;
    }

    /// Return true once teardown has run.
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Mark teardown as having run. Returns false if it already had.
    pub(crate) fn mark_destroyed(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        true
    }

    /// Begin negotiating the next hop.
    pub(crate) fn set_unverified_hop(&mut self, hop: PendingHop, now: Instant) {
        self.last_activity = now;
        self.unverified_hop = Some(hop);
    }

    /// Take the hop being negotiated, if any.
    pub(crate) fn take_unverified_hop(&mut self) -> Option<PendingHop> {
        self.unverified_hop.take()
    }

    /// Take the next planned extension target.
    pub(crate) fn next_planned_hop(&mut self) -> Option<(SocketAddr, PeerId)> {
        if self.planned_hops.is_empty() {
            None
        } else {
            Some(self.planned_hops.remove(0))
        }
    }

    /// Append a fully negotiated hop.
    pub(crate) fn push_hop(&mut self, hop: Hop, now: Instant) {
        self.last_activity = now;
        self.hops.push(hop);
    }

    /// Move the circuit to a new state.
    ///
    /// `Closed` is terminal; leaving it again would resurrect a dead
    /// circuit, so such transitions are ignored and logged.
    pub(crate) fn set_state(&mut self, state: CircuitState) {
        if self.state == CircuitState::Closed && state != CircuitState::Closed {
            debug!("ignoring state change on closed circuit {}", self.circuit_id);
            return;
        }
        self.state = state;
    }

    /// Mark the circuit ready and wake everyone waiting for it.
    pub(crate) fn mark_ready(&mut self) {
        self.state = CircuitState::Ready;
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(true);
        }
    }

    /// Move the circuit to `Closing` and wake waiters with failure.
    pub(crate) fn close(&mut self) {
        if self.state != CircuitState::Closed {
            self.state = CircuitState::Closing;
        }
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(false);
        }
    }

    /// Subscribe to this circuit's readiness. The returned receiver
    /// yields `true` when the circuit becomes ready, `false` when the
    /// build fails.
    pub(crate) fn wait_ready(&mut self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        if self.state == CircuitState::Ready {
            let _ = tx.send(true);
        } else if matches!(self.state, CircuitState::Closing | CircuitState::Closed) {
            let _ = tx.send(false);
        } else {
            self.ready_waiters.push(tx);
        }
        rx
    }

    /// Install end-to-end keys after a rendezvous link.
    pub(crate) fn set_e2e_keys(&mut self, keys: SessionKeys, initiator: bool) {
        self.e2e = Some(E2eKeys { keys, initiator });
    }

    /// Return true if end-to-end keys are installed.
    pub fn has_e2e_keys(&self) -> bool {
        self.e2e.is_some()
    }

    /// Onion-wrap an outgoing cell body for this circuit.
    ///
    /// The innermost layer is the end-to-end layer (if any), then one
    /// layer per hop, outermost layer last so the first hop peels
    /// first.
    pub(crate) fn encrypt_outgoing(&self, body: &[u8]) -> Vec<u8> {
        let mut body = match &self.e2e {
            Some(e2e) if e2e.initiator => e2e.keys.encrypt_forward(body),
            Some(e2e) => e2e.keys.encrypt_backward(body),
            None => body.to_vec(),
        };
        for hop in self.hops.iter().rev() {
            body = hop.keys.encrypt_forward(&body);
        }
        body
    }

    /// Remove every layer from an incoming cell body.
    ///
    /// Backward layers were added hop by hop on the way to us, nearest
    /// hop first; the end-to-end layer (if any) is innermost.
    pub(crate) fn decrypt_incoming(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut body = body.to_vec();
        for hop in self.hops.iter() {
            body = hop.keys.decrypt_backward(&body)?;
        }
        match &self.e2e {
            Some(e2e) if e2e.initiator => e2e.keys.decrypt_backward(&body),
            Some(e2e) => e2e.keys.decrypt_forward(&body),
            None => Ok(body),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::crypto;

    /// A two-hop circuit with negotiated keys, plus the relays' copies
    /// of those keys.
    fn built_circuit() -> (Circuit, Vec<SessionKeys>) {
        let mut circuit = Circuit::new(
            CircId::new(1).unwrap(),
            2,
            CircuitType::Data,
            PeerFlags::EXIT_BT,
            None,
            Vec::new(),
            0,
            Instant::now(),
        );
        let mut relay_keys = Vec::new();
        for i in 0..2_u8 {
            let (state, half) = crypto::HandshakeState::start();
            let (their_half, their_keys) = crypto::respond(&half).unwrap();
            relay_keys.push(their_keys);
            circuit.push_hop(
                Hop {
                    address: format!("10.0.0.{}:1", i + 1).parse().unwrap(),
                    peer_key: PeerId::new([i; 32]),
                    keys: state.finish(&their_half).unwrap(),
                },
                Instant::now(),
            );
        }
        circuit.mark_ready();
        (circuit, relay_keys)
    }

    #[test]
    fn onion_wrap_unwrap() {
        let (circuit, relay_keys) = built_circuit();

        // Forward: each relay peels one layer in path order.
        let mut body = circuit.encrypt_outgoing(b"payload");
        for keys in &relay_keys {
            body = keys.decrypt_forward(&body).unwrap();
        }
        assert_eq!(body, b"payload".to_vec());

        // Backward: each relay adds one layer, nearest hop last.
        let mut body = b"reply".to_vec();
        for keys in relay_keys.iter().rev() {
            body = keys.encrypt_backward(&body);
        }
        assert_eq!(circuit.decrypt_incoming(&body).unwrap(), b"reply".to_vec());
    }

    #[test]
    fn closed_is_terminal() {
        let (mut circuit, _) = built_circuit();
        circuit.set_state(CircuitState::Closed);
        circuit.set_state(CircuitState::Ready);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn ready_waiters_resolved() {
        let (mut circuit, _) = built_circuit();
        // Already ready: resolves immediately.
        let mut rx = circuit.wait_ready();
        assert_eq!(rx.try_recv().unwrap(), Some(true));

        let mut fresh = Circuit::new(
            CircId::new(2).unwrap(),
            1,
            CircuitType::Data,
            PeerFlags::empty(),
            None,
            Vec::new(),
            0,
            Instant::now(),
        );
        let mut rx = fresh.wait_ready();
        assert_eq!(rx.try_recv().unwrap(), None);
        fresh.close();
        assert_eq!(rx.try_recv().unwrap(), Some(false));
    }

    #[test]
    fn teardown_runs_once() {
        let (mut circuit, _) = built_circuit();
        assert!(circuit.mark_destroyed());
        assert!(!circuit.mark_destroyed());
    }

    #[test]
    fn byte_counters_monotone() {
        let (mut circuit, _) = built_circuit();
        circuit.record_up(10);
        circuit.record_up(5);
        circuit.record_down(7);
        assert_eq!((circuit.bytes_up(), circuit.bytes_down()), (15, 7));
    }
}
