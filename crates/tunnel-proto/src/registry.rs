//! Bookkeeping for every circuit this node participates in.
//!
//! Three disjoint maps, all keyed by circuit ID: circuits we
//! initiated, relay entries for circuits passing through us, and exit
//! sockets for circuits terminating at us. A circuit ID appears in at
//! most one of the three. The registry also tracks the candidate
//! peers discovered through the introduction walk, which the path
//! builder samples from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::warn;
use tunnel_cell::{CircId, PeerFlags, PeerId};

use crate::circuit::{Circuit, CircuitState, CircuitType};
use crate::crypto::SessionKeys;
use crate::{Error, Result};

/// One direction of a relayed circuit.
///
/// Relay entries come in pairs: the entry keyed by the incoming
/// circuit ID names the outgoing circuit ID and peer, and vice versa.
/// Both entries of a pair are inserted and removed together.
pub struct RelayEntry {
    /// Where cells arriving on this entry's circuit ID are forwarded.
    pub out_circuit: CircId,
    /// The peer to forward them to.
    pub out_peer: SocketAddr,
    /// Keys whose forward layer we peel off arriving cells.
    ///
    /// Set on the initiator-to-exit direction of an ordinary relay,
    /// and on both directions of a rendezvous splice (where arriving
    /// cells carry the terminal layer of the circuit they came in
    /// on).
    pub peel_keys: Option<SessionKeys>,
    /// Keys whose backward layer we add to forwarded cells.
    ///
    /// Set on the exit-to-initiator direction of an ordinary relay,
    /// and on both directions of a rendezvous splice.
    pub add_keys: Option<SessionKeys>,
    /// Total bytes relayed through this entry. Monotone.
    pub bytes_relayed: u64,
}

/// A circuit terminating at this node, forwarding cleartext traffic
/// to the internet on behalf of the initiator.
pub struct ExitSocket {
    /// The circuit this socket serves.
    circuit_id: CircId,
    /// The previous hop (toward the initiator).
    pub peer_addr: SocketAddr,
    /// The previous hop's claimed identity.
    pub peer_key: PeerId,
    /// The keys negotiated with the circuit initiator.
    pub keys: SessionKeys,
    /// When this exit was created.
    created_at: Instant,
    /// Bytes sent toward the initiator. Monotone.
    bytes_up: u64,
    /// Bytes received from the initiator. Monotone.
    bytes_down: u64,
    /// The UDP socket used to reach the internet, once traffic flows.
    socket: Option<std::sync::Arc<tokio::net::UdpSocket>>,
    /// The task pumping internet replies back into the circuit.
    task: Option<JoinHandle<()>>,
    /// Number of in-flight exit-side HTTP fetches for this circuit.
    pub http_inflight: usize,
}

impl ExitSocket {
    /// Construct an exit socket for a freshly joined circuit.
    pub(crate) fn new(
        circuit_id: CircId,
        peer_addr: SocketAddr,
        peer_key: PeerId,
        keys: SessionKeys,
        now: Instant,
    ) -> Self {
        ExitSocket {
            circuit_id,
            peer_addr,
            peer_key,
            keys,
            created_at: now,
            bytes_up: 0,
            bytes_down: 0,
            socket: None,
            task: None,
            http_inflight: 0,
        }
    }

    /// Return the circuit this socket serves.
    pub fn circuit_id(&self) -> CircId {
        self.circuit_id
    }

    /// Return when this exit was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Return bytes sent toward the initiator.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Return bytes received from the initiator.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    /// Record traffic sent toward the initiator.
    pub(crate) fn record_up(&mut self, n: usize) {
        self.bytes_up += n as u64;
    }

    /// Record traffic received from the initiator.
    pub(crate) fn record_down(&mut self, n: usize) {
        self.bytes_down += n as u64;
    }

    /// Return the internet-facing socket, if one is open.
    pub(crate) fn socket(&self) -> Option<&std::sync::Arc<tokio::net::UdpSocket>> {
        self.socket.as_ref()
    }

    /// Install the internet-facing socket and its pump task.
    pub(crate) fn set_socket(
        &mut self,
        socket: std::sync::Arc<tokio::net::UdpSocket>,
        task: JoinHandle<()>,
    ) {
        self.socket = Some(socket);
        self.task = Some(task);
    }
}

impl Drop for ExitSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A peer discovered through the introduction walk.
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    /// The peer's UDP address.
    pub address: SocketAddr,
    /// The flags the peer advertises.
    pub flags: PeerFlags,
    /// When we last heard from the peer.
    pub last_seen: Instant,
    /// When the path builder last picked the peer, if ever.
    last_used: Option<Instant>,
}

/// The three circuit maps plus the candidate table.
#[derive(Default)]
pub struct CircuitRegistry {
    /// Circuits we initiated.
    circuits: HashMap<CircId, Circuit>,
    /// Relay entries for circuits passing through us.
    relays: HashMap<CircId, RelayEntry>,
    /// Exit sockets for circuits terminating at us.
    exit_sockets: HashMap<CircId, ExitSocket>,
    /// Candidate peers, keyed by identity.
    candidates: HashMap<PeerId, Candidate>,
}

impl CircuitRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        CircuitRegistry::default()
    }

    /// Return true if `circuit_id` appears in any of the three maps.
    pub fn knows_circuit(&self, circuit_id: CircId) -> bool {
        self.circuits.contains_key(&circuit_id)
            || self.relays.contains_key(&circuit_id)
            || self.exit_sockets.contains_key(&circuit_id)
    }

    /// Pick a random circuit ID not present in any map.
    pub fn allocate_circuit_id(&self) -> CircId {
        let mut rng = rand::thread_rng();
        loop {
            if let Some(id) = CircId::new(rng.gen::<u32>()) {
                if !self.knows_circuit(id) {
                    return id;
                }
            }
        }
    }

    /// Insert a circuit we initiated.
    pub fn insert_circuit(&mut self, circuit: Circuit) -> Result<()> {
        let id = circuit.circuit_id();
        if self.knows_circuit(id) {
            return Err(Error::Internal("circuit id already in use"));
        }
        self.circuits.insert(id, circuit);
        Ok(())
    }

    /// Return the circuit with this ID, if we initiated one.
    pub fn circuit(&self, circuit_id: CircId) -> Option<&Circuit> {
        self.circuits.get(&circuit_id)
    }

    /// Return the circuit with this ID, mutably.
    pub fn circuit_mut(&mut self, circuit_id: CircId) -> Option<&mut Circuit> {
        self.circuits.get_mut(&circuit_id)
    }

    /// Remove and return the circuit with this ID.
    pub fn remove_circuit(&mut self, circuit_id: CircId) -> Option<Circuit> {
        self.circuits.remove(&circuit_id)
    }

    /// Iterate over the circuits we initiated.
    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.values()
    }

    /// Iterate mutably over the circuits we initiated.
    pub fn circuits_mut(&mut self) -> impl Iterator<Item = &mut Circuit> {
        self.circuits.values_mut()
    }

    /// Find the ready circuits matching the given constraints.
    ///
    /// `None` constraints match anything. Only `Ready` circuits are
    /// returned: circuits accept traffic in no other state.
    pub fn find_ready(
        &self,
        hops: Option<u8>,
        exit_flags: Option<PeerFlags>,
        ctype: Option<CircuitType>,
    ) -> Vec<&Circuit> {
        self.circuits
            .values()
            .filter(|c| c.state() == CircuitState::Ready)
            .filter(|c| hops.map_or(true, |h| c.goal_hops() == h))
            .filter(|c| exit_flags.map_or(true, |f| c.required_exit_flags().contains(f)))
            .filter(|c| ctype.map_or(true, |t| c.ctype() == t))
            .collect()
    }

    /// Insert a relay pair for a circuit extended (or spliced)
    /// through us.
    ///
    /// The two entries must reference each other.
    pub fn insert_relay_pair(
        &mut self,
        in_circuit: CircId,
        forward: RelayEntry,
        out_circuit: CircId,
        backward: RelayEntry,
    ) -> Result<()> {
        if forward.out_circuit != out_circuit || backward.out_circuit != in_circuit {
            return Err(Error::Internal("relay entries do not pair up"));
        }
        if self.knows_circuit(in_circuit) || self.knows_circuit(out_circuit) {
            return Err(Error::Internal("relay circuit id already in use"));
        }
        self.relays.insert(in_circuit, forward);
        self.relays.insert(out_circuit, backward);
        Ok(())
    }

    /// Return the relay entry for this circuit ID.
    pub fn relay(&self, circuit_id: CircId) -> Option<&RelayEntry> {
        self.relays.get(&circuit_id)
    }

    /// Return the relay entry for this circuit ID, mutably.
    pub fn relay_mut(&mut self, circuit_id: CircId) -> Option<&mut RelayEntry> {
        self.relays.get_mut(&circuit_id)
    }

    /// Remove the relay entry for this circuit ID *and* its paired
    /// reverse entry, atomically.
    pub fn remove_relay_pair(&mut self, circuit_id: CircId) -> Vec<(CircId, RelayEntry)> {
        let mut removed = Vec::new();
        if let Some(entry) = self.relays.remove(&circuit_id) {
            let paired = entry.out_circuit;
            removed.push((circuit_id, entry));
            match self.relays.remove(&paired) {
                Some(reverse) => removed.push((paired, reverse)),
                // Should never happen: pairs are inserted together.
                None => warn!("relay {} had no paired reverse entry", circuit_id),
            }
        }
        removed
    }

    /// Number of relay entries (both directions counted).
    pub fn n_relays(&self) -> usize {
        self.relays.len()
    }

    /// Insert an exit socket.
    pub fn insert_exit(&mut self, exit: ExitSocket) -> Result<()> {
        let id = exit.circuit_id();
        if self.knows_circuit(id) {
            return Err(Error::Internal("exit circuit id already in use"));
        }
        self.exit_sockets.insert(id, exit);
        Ok(())
    }

    /// Return the exit socket for this circuit ID.
    pub fn exit(&self, circuit_id: CircId) -> Option<&ExitSocket> {
        self.exit_sockets.get(&circuit_id)
    }

    /// Return the exit socket for this circuit ID, mutably.
    pub fn exit_mut(&mut self, circuit_id: CircId) -> Option<&mut ExitSocket> {
        self.exit_sockets.get_mut(&circuit_id)
    }

    /// Remove and return the exit socket for this circuit ID.
    pub fn remove_exit(&mut self, circuit_id: CircId) -> Option<ExitSocket> {
        self.exit_sockets.remove(&circuit_id)
    }

    /// Number of exit sockets.
    pub fn n_exits(&self) -> usize {
        self.exit_sockets.len()
    }

    /// The join-admission quantity: how many circuits built by others
    /// we currently carry.
    pub fn joined_count(&self) -> usize {
        self.relays.len() + self.exit_sockets.len()
    }

    /// Record (or refresh) a candidate peer.
    pub fn add_candidate(&mut self, peer: PeerId, address: SocketAddr, flags: PeerFlags, now: Instant) {
        let candidate = self.candidates.entry(peer).or_insert(Candidate {
            address,
            flags,
            last_seen: now,
            last_used: None,
        });
        candidate.address = address;
        candidate.flags = flags;
        candidate.last_seen = now;
    }

    /// Forget a candidate peer.
    pub fn remove_candidate(&mut self, peer: PeerId) -> Option<Candidate> {
        self.candidates.remove(&peer)
    }

    /// Iterate over the candidates advertising all of `flags`.
    pub fn candidates_with_flags(
        &self,
        flags: PeerFlags,
    ) -> impl Iterator<Item = (&PeerId, &Candidate)> {
        self.candidates
            .iter()
            .filter(move |(_, c)| c.flags.contains(flags))
    }

    /// Number of known candidates.
    pub fn n_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Forget candidates that stayed silent past `ttl`, returning
    /// their identities.
    pub fn prune_candidates(&mut self, ttl: std::time::Duration, now: Instant) -> Vec<PeerId> {
        let gone: Vec<PeerId> = self
            .candidates
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_seen) >= ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in &gone {
            self.candidates.remove(key);
        }
        gone
    }

    /// Pick a path of `hops` distinct peers: interior hops must relay,
    /// the terminal hop must advertise `exit_flags`. Peers are chosen
    /// least-recently-used first, and are marked used on selection.
    pub fn sample_path(
        &mut self,
        hops: u8,
        exit_flags: PeerFlags,
        now: Instant,
    ) -> Option<Vec<(SocketAddr, PeerId)>> {
        let mut chosen: Vec<(SocketAddr, PeerId)> = Vec::with_capacity(hops as usize);
        // The terminal hop first: exit capability is the scarcer one.
        let exit = self.pick_lru(exit_flags, &[])?;
        for _ in 1..hops {
            let taken: Vec<PeerId> =
                chosen.iter().map(|(_, k)| *k).chain([exit.1]).collect();
            let hop = self.pick_lru(PeerFlags::RELAY, &taken)?;
            chosen.push(hop);
        }
        chosen.push(exit);
        for (_, key) in &chosen {
            if let Some(c) = self.candidates.get_mut(key) {
                c.last_used = Some(now);
            }
        }
        Some(chosen)
    }

    /// Pick the least-recently-used candidate advertising `flags`,
    /// excluding `taken`.
    fn pick_lru(&self, flags: PeerFlags, taken: &[PeerId]) -> Option<(SocketAddr, PeerId)> {
        self.candidates
            .iter()
            .filter(|(key, c)| c.flags.contains(flags) && !taken.contains(key))
            .min_by_key(|(_, c)| c.last_used)
            .map(|(key, c)| (c.address, *key))
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

    /// Some negotiated keys for tests.
    fn keys() -> SessionKeys {
        let (state, half) = crypto::HandshakeState::start();
        let (their_half, _) = crypto::respond(&half).unwrap();
        state.finish(&their_half).unwrap()
    }

    /// A relay pair between `a` and `b`.
    fn relay_pair(a: CircId, b: CircId) -> (RelayEntry, RelayEntry) {
        let k = keys();
        (
            RelayEntry {
                out_circuit: b,
                out_peer: "10.0.0.2:1".parse().unwrap(),
                peel_keys: Some(k.clone()),
                add_keys: None,
                bytes_relayed: 0,
            },
            RelayEntry {
                out_circuit: a,
                out_peer: "10.0.0.1:1".parse().unwrap(),
                peel_keys: None,
                add_keys: Some(k),
                bytes_relayed: 0,
            },
        )
    }

    /// A minimal circuit for registry tests.
    fn circuit(id: u32) -> Circuit {
        Circuit::new(
            CircId::new(id).unwrap(),
            1,
            CircuitType::Data,
            PeerFlags::empty(),
            None,
            Vec::new(),
            0,
            Instant::now(),
        )
    }

    #[test]
    fn circuit_id_in_one_map_only() {
        let mut reg = CircuitRegistry::new();
        let id = CircId::new(7).unwrap();
        reg.insert_circuit(circuit(7)).unwrap();

        // The same id cannot enter the other maps.
        let exit = ExitSocket::new(
            id,
            "10.0.0.1:1".parse().unwrap(),
            PeerId::new([1; 32]),
            keys(),
            Instant::now(),
        );
        assert!(reg.insert_exit(exit).is_err());

        let other = CircId::new(8).unwrap();
        let (fwd, bwd) = relay_pair(id, other);
        assert!(reg.insert_relay_pair(id, fwd, other, bwd).is_err());

        // And a fresh allocation avoids it.
        for _ in 0..64 {
            assert_ne!(reg.allocate_circuit_id(), id);
        }
    }

    #[test]
    fn relay_pair_removed_atomically() {
        let mut reg = CircuitRegistry::new();
        let a = CircId::new(1).unwrap();
        let b = CircId::new(2).unwrap();
        let (fwd, bwd) = relay_pair(a, b);
        reg.insert_relay_pair(a, fwd, b, bwd).unwrap();
        assert_eq!(reg.n_relays(), 2);
        assert_eq!(reg.joined_count(), 2);

        // Removing either end removes both.
        let removed = reg.remove_relay_pair(b);
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.n_relays(), 0);
        assert!(reg.remove_relay_pair(a).is_empty());
    }

    #[test]
    fn mispaired_relays_rejected() {
        let mut reg = CircuitRegistry::new();
        let a = CircId::new(1).unwrap();
        let b = CircId::new(2).unwrap();
        let c = CircId::new(3).unwrap();
        let (fwd, bwd) = relay_pair(a, c); // fwd points at c, not b
        assert!(reg.insert_relay_pair(a, fwd, b, bwd).is_err());
    }

    #[test]
    fn lru_candidate_sampling() {
        let mut reg = CircuitRegistry::new();
        let now = Instant::now();
        // Two exit-only candidates, two relay-only candidates.
        for i in 0..4_u8 {
            reg.add_candidate(
                PeerId::new([i; 32]),
                format!("10.0.0.{}:1", i).parse().unwrap(),
                if i < 2 {
                    PeerFlags::EXIT_BT
                } else {
                    PeerFlags::RELAY
                },
                now,
            );
        }

        // A 2-hop path: one relay, one exit, all distinct.
        let path = reg.sample_path(2, PeerFlags::EXIT_BT, now).unwrap();
        assert_eq!(path.len(), 2);
        assert_ne!(path[0].1, path[1].1);

        // The exit just used is now marked; the never-used exit
        // candidate must be picked next.
        let second = reg.sample_path(2, PeerFlags::EXIT_BT, now).unwrap();
        assert_ne!(second[1].1, path[1].1);

        // Asking for more hops than there are candidates fails.
        assert!(reg.sample_path(9, PeerFlags::EXIT_BT, now).is_none());
    }

    #[test]
    fn find_ready_filters() {
        let mut reg = CircuitRegistry::new();
        let mut c = circuit(1);
        c.mark_ready();
        reg.insert_circuit(c).unwrap();
        reg.insert_circuit(circuit(2)).unwrap(); // still Building

        assert_eq!(reg.find_ready(None, None, None).len(), 1);
        assert_eq!(reg.find_ready(Some(1), None, Some(CircuitType::Data)).len(), 1);
        assert_eq!(reg.find_ready(Some(3), None, None).len(), 0);
    }
}
