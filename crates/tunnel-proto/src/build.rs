//! Building circuits by iterative extension.
//!
//! The initiator sends CREATE to its first hop, then asks the current
//! terminal to EXTEND to the next planned peer, one hop at a time.
//! Every hop negotiates its own keys; the initiator learns them from
//! the CREATED/EXTENDED answers. A hop that stays silent past the
//! extend timeout kills the build; the community retries a failed
//! build up to the configured attempt budget.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};
use tunnel_cell::{msg, CircId, InfoHash, PeerFlags, PeerId};

use crate::circuit::{Circuit, CircuitState, CircuitType, Hop, PendingHop};
use crate::community::{encode_inner, encode_plain_cell, PendingExtension, TunnelCommunity};
use crate::crypto::HandshakeState;
use crate::registry::RelayEntry;
use crate::{Error, Result};

impl TunnelCommunity {
    /// Start building a circuit. Returns its ID; readiness is
    /// observed through the circuit's ready waiters.
    pub(crate) fn create_circuit(
        &mut self,
        hops: u8,
        ctype: CircuitType,
        exit_flags: PeerFlags,
        info_hash: Option<InfoHash>,
        attempt: u32,
        now: Instant,
    ) -> Result<CircId> {
        if hops == 0 {
            return Err(Error::Internal("cannot build a zero-hop circuit"));
        }
        // A terminal hop with no specific exit requirement still has
        // to be willing to relay.
        let terminal_flags = if exit_flags == PeerFlags::empty() {
            PeerFlags::RELAY
        } else {
            exit_flags
        };
        let path = self
            .registry
            .sample_path(hops, terminal_flags, now)
            .ok_or(Error::ResourceExhausted("not enough candidates for a path"))?;
        self.start_build(path, hops, ctype, exit_flags, info_hash, attempt, now)
    }

    /// Start building a circuit whose terminal hop is a specific peer
    /// (an introduction or rendezvous point), with sampled interior
    /// relays.
    pub(crate) fn create_circuit_to(
        &mut self,
        target: SocketAddr,
        target_key: PeerId,
        hops: u8,
        ctype: CircuitType,
        info_hash: Option<InfoHash>,
        now: Instant,
    ) -> Result<CircId> {
        if hops == 0 {
            return Err(Error::Internal("cannot build a zero-hop circuit"));
        }
        let mut path = if hops > 1 {
            self.registry
                .sample_path(hops - 1, PeerFlags::RELAY, now)
                .ok_or(Error::ResourceExhausted("not enough candidates for a path"))?
        } else {
            Vec::new()
        };
        path.push((target, target_key));
        self.start_build(path, hops, ctype, PeerFlags::empty(), info_hash, 0, now)
    }

    /// Common tail of circuit creation: allocate an ID, register the
    /// circuit, and fire the first CREATE.
    #[allow(clippy::too_many_arguments)]
    fn start_build(
        &mut self,
        mut path: Vec<(SocketAddr, PeerId)>,
        hops: u8,
        ctype: CircuitType,
        exit_flags: PeerFlags,
        info_hash: Option<InfoHash>,
        attempt: u32,
        now: Instant,
    ) -> Result<CircId> {
        let circuit_id = self.registry.allocate_circuit_id();
        let (first_addr, first_key) = path.remove(0);
        let mut circuit = Circuit::new(
            circuit_id, hops, ctype, exit_flags, info_hash, path, attempt, now,
        );
        let (handshake, our_half) = HandshakeState::start();
        circuit.set_unverified_hop(
            PendingHop {
                address: first_addr,
                peer_key: first_key,
                handshake,
            },
            now,
        );
        self.registry.insert_circuit(circuit)?;
        debug!(
            "creating {:?} circuit {} ({} hops) via {}",
            ctype, circuit_id, hops, first_addr
        );
        let cell = encode_plain_cell(circuit_id, msg::Create::new(our_half).into());
        self.send_raw(first_addr, cell);
        Ok(circuit_id)
    }

    /// Handle a CREATED cell. Either the first hop of a circuit we
    /// are building answered, or a peer we sent CREATE to on behalf
    /// of another initiator did.
    pub(crate) fn on_created(&mut self, addr: SocketAddr, circuit_id: CircId, body: &[u8], now: Instant) {
        let created = match crate::community::decode_body::<msg::Created>(body) {
            Ok(created) => created,
            Err(e) => {
                warn!("bad CREATED from {}: {}", addr, e);
                return;
            }
        };
        if let Some(pending) = self.pending_extensions.remove(&circuit_id) {
            self.finish_extension(circuit_id, pending, created.handshake());
            return;
        }
        self.complete_hop(circuit_id, created.handshake(), now);
    }

    /// Handle an EXTENDED message on a circuit we are building.
    pub(crate) fn on_extended(&mut self, circuit_id: CircId, extended: &msg::Extended, now: Instant) {
        self.complete_hop(circuit_id, extended.handshake(), now);
    }

    /// A hop answered our handshake: finish its keys and either keep
    /// extending or declare the circuit ready.
    fn complete_hop(&mut self, circuit_id: CircId, their_half: &[u8; 32], now: Instant) {
        let Some(circuit) = self.registry.circuit_mut(circuit_id) else {
            debug!("dropping handshake answer for unknown circuit {}", circuit_id);
            return;
        };
        let Some(pending) = circuit.take_unverified_hop() else {
            warn!("unsolicited handshake answer on circuit {}", circuit_id);
            return;
        };
        let keys = match pending.handshake.finish(their_half) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("handshake on circuit {} failed: {}", circuit_id, e);
                self.remove_circuit(circuit_id, "crypto failure", true);
                return;
            }
        };
        circuit.push_hop(
            Hop {
                address: pending.address,
                peer_key: pending.peer_key,
                keys,
            },
            now,
        );
        match circuit.next_planned_hop() {
            Some((next_addr, next_key)) => {
                circuit.set_state(CircuitState::Extending);
                let (handshake, our_half) = HandshakeState::start();
                circuit.set_unverified_hop(
                    PendingHop {
                        address: next_addr,
                        peer_key: next_key,
                        handshake,
                    },
                    now,
                );
                self.send_on_circuit(
                    circuit_id,
                    msg::Extend::new(next_addr.into(), next_key, our_half).into(),
                );
            }
            None => {
                info!("circuit {} is ready", circuit_id);
                circuit.mark_ready();
                self.on_circuit_ready(circuit_id);
            }
        }
    }

    /// Handle an EXTEND arriving at an exit socket: the initiator
    /// wants the circuit to continue past us. We send CREATE to the
    /// named peer and remember the extension until it answers.
    pub(crate) fn on_extend(&mut self, circuit_id: CircId, extend: &msg::Extend, now: Instant) {
        let node_addr: SocketAddr = extend.node_addr().into();
        let mut next_id = self.registry.allocate_circuit_id();
        while self.pending_extensions.contains_key(&next_id) {
            next_id = self.registry.allocate_circuit_id();
        }
        debug!(
            "extending circuit {} to {} as circuit {}",
            circuit_id, node_addr, next_id
        );
        self.pending_extensions.insert(
            next_id,
            PendingExtension {
                in_circuit: circuit_id,
                node_addr,
                started: now,
            },
        );
        let cell = encode_plain_cell(next_id, msg::Create::new(*extend.handshake()).into());
        self.send_raw(node_addr, cell);
    }

    /// The peer we extended to answered: convert our exit socket into
    /// a relay pair and report EXTENDED back to the initiator.
    fn finish_extension(&mut self, new_circuit: CircId, pending: PendingExtension, their_half: &[u8; 32]) {
        let Some(exit) = self.registry.remove_exit(pending.in_circuit) else {
            debug!(
                "extension {} finished but circuit {} is gone",
                new_circuit, pending.in_circuit
            );
            return;
        };
        let keys = exit.keys.clone();
        let initiator_addr = exit.peer_addr;
        let forward = RelayEntry {
            out_circuit: new_circuit,
            out_peer: pending.node_addr,
            peel_keys: Some(keys.clone()),
            add_keys: None,
            bytes_relayed: 0,
        };
        let backward = RelayEntry {
            out_circuit: pending.in_circuit,
            out_peer: initiator_addr,
            peel_keys: None,
            add_keys: Some(keys.clone()),
            bytes_relayed: 0,
        };
        if let Err(e) =
            self.registry
                .insert_relay_pair(pending.in_circuit, forward, new_circuit, backward)
        {
            warn!("could not convert {} into a relay: {}", pending.in_circuit, e);
            return;
        }
        // Report the new hop's handshake back along the old circuit.
        match encode_inner(msg::Extended::new(*their_half).into()) {
            Ok(inner) => {
                let body = keys.encrypt_backward(&inner);
                let cell = tunnel_cell::cell::reframe(
                    pending.in_circuit,
                    tunnel_cell::TunnelCmd::RELAY,
                    &body,
                );
                self.send_raw(initiator_addr, cell);
            }
            Err(e) => warn!("could not encode EXTENDED: {}", e),
        }
    }

    /// A circuit became ready: resume whatever was waiting on it.
    pub(crate) fn on_circuit_ready(&mut self, circuit_id: CircId) {
        // Postponed BitTorrent peers can flow again.
        self.readd_bittorrent_peers();
        let Some(circuit) = self.registry.circuit(circuit_id) else {
            return;
        };
        match circuit.ctype() {
            CircuitType::Data => {}
            CircuitType::IpSeeder => self.on_ip_seeder_ready(circuit_id),
            CircuitType::RpDownloader => self.on_rp_downloader_ready(circuit_id),
            CircuitType::RpSeeder => self.on_rp_seeder_ready(circuit_id),
            CircuitType::Intro => self.on_intro_circuit_ready(circuit_id),
        }
    }

    /// Keep the data-circuit pool sized to `circuits_needed`.
    pub(crate) fn do_circuit_maintenance(&mut self, now: Instant) {
        let needed: Vec<(u8, usize)> = self
            .circuits_needed
            .iter()
            .map(|(&hops, &needed)| (hops, needed))
            .collect();
        for (hops, wanted) in needed {
            let have = self
                .registry
                .circuits()
                .filter(|c| {
                    c.ctype() == CircuitType::Data
                        && c.goal_hops() == hops
                        && c.required_exit_flags().contains(PeerFlags::EXIT_BT)
                        && matches!(
                            c.state(),
                            CircuitState::Building | CircuitState::Extending | CircuitState::Ready
                        )
                })
                .count();
            for _ in have..wanted {
                match self.create_circuit(
                    hops,
                    CircuitType::Data,
                    PeerFlags::EXIT_BT,
                    None,
                    0,
                    now,
                ) {
                    Ok(circuit_id) => debug!("pool build: circuit {} ({} hops)", circuit_id, hops),
                    Err(e) => {
                        debug!("pool build for {} hops failed: {}", hops, e);
                        break;
                    }
                }
            }
        }
    }
}
