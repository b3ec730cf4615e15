//! Routing between local SOCKS5 sessions and circuits.
//!
//! Outgoing datagrams from the BitTorrent engine arrive through a
//! SOCKS5 UDP association and must be pinned to a circuit; incoming
//! tunneled datagrams must find their way back to the right session.
//! The dispatcher owns that mapping and nothing else: it never touches
//! sockets or crypto.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::seq::SliceRandom;
use tracing::debug;
use tunnel_cell::{CircId, PeerFlags};

use crate::circuit::CircuitType;
use crate::registry::CircuitRegistry;
use crate::socks::Socks5Server;

/// Map a circuit ID to the pseudo IP address used to represent its
/// far end to the local BitTorrent engine.
///
/// Hidden-swarm peers have no real address, so each e2e circuit is
/// surfaced as an address in `1.0.0.0/8` derived from its ID.
pub(crate) fn circuit_id_to_ip(circuit_id: CircId) -> Ipv4Addr {
    let id = circuit_id.get();
    Ipv4Addr::new(1, (id >> 16) as u8, (id >> 8) as u8, id as u8)
}

/// The dispatcher: session/destination to circuit bindings.
#[derive(Default)]
pub struct TunnelDispatcher {
    /// Per SOCKS5 server (by index), the circuit pinned to each
    /// destination.
    con_to_cir: HashMap<usize, HashMap<SocketAddr, CircId>>,
    /// Which server each circuit serves, for the return path.
    cir_to_con: HashMap<CircId, usize>,
}

impl TunnelDispatcher {
    /// Construct an empty dispatcher.
    pub fn new() -> Self {
        TunnelDispatcher::default()
    }

    /// Pick the circuit to carry a datagram for `dest`, sent by a
    /// session of server `server_index` (i.e. with `hops` hops).
    ///
    /// Preference order: the circuit already pinned to `dest`; an e2e
    /// circuit whose pseudo address is `dest` (hidden-swarm
    /// affinity); any ready data circuit with the right hop count and
    /// BitTorrent exit capability. `None` means the datagram is
    /// dropped, silently, as UDP wants.
    pub fn select_circuit(
        &mut self,
        registry: &CircuitRegistry,
        server_index: usize,
        hops: u8,
        dest: SocketAddr,
    ) -> Option<CircId> {
        if let Some(existing) = self
            .con_to_cir
            .get(&server_index)
            .and_then(|m| m.get(&dest))
            .copied()
        {
            if registry
                .circuit(existing)
                .map_or(false, |c| c.state() == crate::circuit::CircuitState::Ready)
            {
                return Some(existing);
            }
            // The pinned circuit died; fall through and re-pin.
        }

        let choice = registry
            .circuits()
            .filter(|c| c.state() == crate::circuit::CircuitState::Ready)
            .find(|c| {
                c.has_e2e_keys() && IpAddr::V4(circuit_id_to_ip(c.circuit_id())) == dest.ip()
            })
            .map(|c| c.circuit_id())
            .or_else(|| {
                let options: Vec<CircId> = registry
                    .find_ready(Some(hops), Some(PeerFlags::EXIT_BT), Some(CircuitType::Data))
                    .iter()
                    .map(|c| c.circuit_id())
                    .collect();
                options.choose(&mut rand::thread_rng()).copied()
            });

        match choice {
            Some(circuit_id) => {
                self.pin(server_index, dest, circuit_id);
                Some(circuit_id)
            }
            None => {
                debug!("no circuit for {}; dropping datagram", dest);
                None
            }
        }
    }

    /// Pin `dest` to `circuit_id` for a server.
    fn pin(&mut self, server_index: usize, dest: SocketAddr, circuit_id: CircId) {
        self.con_to_cir
            .entry(server_index)
            .or_default()
            .insert(dest, circuit_id);
        self.cir_to_con.insert(circuit_id, server_index);
    }

    /// Deliver an incoming tunneled datagram to the sessions of the
    /// right SOCKS5 server, and pin the origin to the circuit so
    /// return traffic uses it.
    ///
    /// Returns true if at least one session took the datagram.
    pub fn on_incoming_from_tunnel(
        &mut self,
        socks_servers: &[Socks5Server],
        circuit_id: CircId,
        hops: u8,
        origin: SocketAddr,
        data: &[u8],
    ) -> bool {
        let server_index = self
            .cir_to_con
            .get(&circuit_id)
            .copied()
            .unwrap_or_else(|| usize::from(hops.saturating_sub(1)));
        let Some(server) = socks_servers.get(server_index) else {
            debug!("no SOCKS5 server for {} hops; dropping datagram", hops);
            return false;
        };
        self.pin(server_index, origin, circuit_id);

        let mut delivered = false;
        for session in &server.sessions {
            if let Some(connection) = &session.udp_connection {
                connection.send_datagram(data, origin);
                delivered = true;
            }
        }
        delivered
    }

    /// Drop every binding for a dead circuit, returning the peer
    /// addresses that were using it (so the community can re-add them
    /// once new circuits exist).
    pub fn circuit_dead(&mut self, circuit_id: CircId) -> HashSet<SocketAddr> {
        let mut affected = HashSet::new();
        for table in self.con_to_cir.values_mut() {
            table.retain(|dest, circ| {
                if *circ == circuit_id {
                    affected.insert(*dest);
                    false
                } else {
                    true
                }
            });
        }
        self.cir_to_con.remove(&circuit_id);
        affected
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::circuit::Circuit;
    use std::time::Instant;

    /// Insert a ready data circuit with the given id and hop count.
    fn add_ready(reg: &mut CircuitRegistry, id: u32, hops: u8, flags: PeerFlags) {
        let mut c = Circuit::new(
            CircId::new(id).unwrap(),
            hops,
            CircuitType::Data,
            flags,
            None,
            Vec::new(),
            0,
            Instant::now(),
        );
        c.mark_ready();
        reg.insert_circuit(c).unwrap();
    }

    #[test]
    fn selection_prefers_existing_binding() {
        let mut reg = CircuitRegistry::new();
        add_ready(&mut reg, 1, 1, PeerFlags::EXIT_BT);
        let mut dispatcher = TunnelDispatcher::new();
        let dest: SocketAddr = "93.184.216.34:6881".parse().unwrap();

        let first = dispatcher.select_circuit(&reg, 0, 1, dest).unwrap();
        // Add a second option; the binding must stick.
        add_ready(&mut reg, 2, 1, PeerFlags::EXIT_BT);
        for _ in 0..8 {
            assert_eq!(dispatcher.select_circuit(&reg, 0, 1, dest), Some(first));
        }
    }

    #[test]
    fn selection_honors_hops_and_exit() {
        let mut reg = CircuitRegistry::new();
        add_ready(&mut reg, 1, 2, PeerFlags::EXIT_BT); // wrong hops
        add_ready(&mut reg, 2, 1, PeerFlags::empty()); // no exit flag
        let mut dispatcher = TunnelDispatcher::new();
        let dest: SocketAddr = "93.184.216.34:6881".parse().unwrap();

        assert_eq!(dispatcher.select_circuit(&reg, 0, 1, dest), None);
        add_ready(&mut reg, 3, 1, PeerFlags::EXIT_BT);
        assert_eq!(
            dispatcher.select_circuit(&reg, 0, 1, dest),
            Some(CircId::new(3).unwrap())
        );
    }

    #[test]
    fn dead_circuit_reaps_bindings() {
        let mut reg = CircuitRegistry::new();
        add_ready(&mut reg, 1, 1, PeerFlags::EXIT_BT);
        let mut dispatcher = TunnelDispatcher::new();
        let a: SocketAddr = "93.184.216.34:6881".parse().unwrap();
        let b: SocketAddr = "93.184.216.35:6881".parse().unwrap();
        let circ = dispatcher.select_circuit(&reg, 0, 1, a).unwrap();
        assert_eq!(dispatcher.select_circuit(&reg, 0, 1, b), Some(circ));

        let affected = dispatcher.circuit_dead(circ);
        assert_eq!(affected, HashSet::from([a, b]));
        // And the binding is really gone: re-selection re-pins.
        assert_eq!(dispatcher.select_circuit(&reg, 0, 1, a), Some(circ));
    }

    #[test]
    fn pseudo_address_roundtrip() {
        let id = CircId::new(0x00ab_cdef).unwrap();
        assert_eq!(circuit_id_to_ip(id), Ipv4Addr::new(1, 0xab, 0xcd, 0xef));
    }
}
