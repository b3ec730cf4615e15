//! The rendezvous layer: hidden swarms, introduction points, and
//! end-to-end circuit finalization.
//!
//! A seeder keeps one introduction circuit per hidden swarm and waits
//! behind it. A downloader prepares a rendezvous point, asks the
//! swarm's introduction point to pass its key half (plus the
//! rendezvous cookie and address) to the seeder, and waits for the
//! rendezvous point to splice the two circuits together. Neither side
//! ever learns the other's address: the finished end-to-end circuit is
//! surfaced to BitTorrent as a pseudo peer in `1.0.0.0/8`.
//!
//! Swarms are keyed by *lookup* infohash, a hash of the real one, so
//! rendezvous traffic cannot be correlated with the plaintext swarm.

use std::net::SocketAddr;
use std::time::Instant;

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};
use tunnel_cell::msg::{self, IntroPoint};
use tunnel_cell::{AddressPort, CircId, InfoHash, PeerFlags, PeerId};

use crate::cache::{Pending, RequestKind};
use crate::circuit::{Circuit, CircuitState, CircuitType};
use crate::community::{TunnelCommunity, E2E_PORT};
use crate::crypto::{HandshakeState, SessionKeys};
use crate::dispatcher::circuit_id_to_ip;

/// Derive the lookup infohash under which a swarm rendezvouses.
///
/// The hex-encoding of the real infohash goes into the hash, not the
/// raw bytes, matching every deployed client.
pub(crate) fn lookup_info_hash(real: InfoHash) -> InfoHash {
    /// Lowercase hex digits, as `hexlify` produces them.
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut hasher = Sha1::new();
    hasher.update(b"tribler anonymous download");
    let mut hex = [0_u8; 40];
    for (i, byte) in real.as_bytes().iter().enumerate() {
        hex[i * 2] = DIGITS[usize::from(byte >> 4)];
        hex[i * 2 + 1] = DIGITS[usize::from(byte & 0x0f)];
    }
    hasher.update(hex);
    InfoHash::new(hasher.finalize().into())
}

/// Our membership in one hidden swarm.
pub(crate) struct Swarm {
    /// The hop count this swarm's circuits use.
    pub(crate) hops: u8,
    /// Whether we participate as a seeder.
    pub(crate) seeding: bool,
}

/// State we keep as an introduction point for someone else's swarm.
pub(crate) struct IntroService {
    /// The seeder's circuit to us.
    pub(crate) seeder_circuit: CircId,
    /// The seeder's claimed identity.
    pub(crate) seeder_key: PeerId,
}

/// Downloader- or seeder-side state for an end-to-end link in
/// progress.
#[derive(Default)]
pub(crate) struct PendingE2e {
    /// The one-time rendezvous cookie.
    pub(crate) cookie: [u8; 20],
    /// The downloader's circuit to the rendezvous point.
    pub(crate) rp_circuit: Option<CircId>,
    /// The downloader's circuit to the introduction point.
    pub(crate) intro_circuit: Option<CircId>,
    /// The rendezvous point's address, once established.
    pub(crate) rp_addr: Option<AddressPort>,
    /// Whether the introduction point confirmed it serves the swarm.
    pub(crate) intro_confirmed: bool,
    /// Whether we already sent our CreateE2e.
    pub(crate) sent_create: bool,
    /// The downloader's half-open e2e handshake.
    pub(crate) handshake: Option<HandshakeState>,
    /// The finished e2e keys, until they move onto the circuit.
    pub(crate) keys: Option<SessionKeys>,
}

impl TunnelCommunity {
    // ------------------------------------------------------------------
    // Swarm membership.

    /// Join a hidden swarm.
    ///
    /// Re-triggering a join for a swarm we are already in, in the
    /// same role, is a no-op: existing infrastructure is reused.
    pub(crate) fn join_swarm(&mut self, info_hash: InfoHash, hops: u8, seeding: bool, now: Instant) {
        if let Some(swarm) = self.swarms.get_mut(&info_hash) {
            if swarm.seeding == seeding {
                debug!("already joined swarm {}; nothing to do", info_hash);
                return;
            }
            swarm.seeding = seeding;
            swarm.hops = hops;
        } else {
            info!("joining hidden swarm {} ({} hops)", info_hash, hops);
            self.swarms.insert(info_hash, Swarm { hops, seeding });
        }
        if seeding {
            // Introduction circuits are counted and (re)built by the
            // download monitor.
            return;
        }
        self.begin_rendezvous(info_hash, hops, now);
    }

    /// Leave a hidden swarm. Existing circuits are left to die of
    /// idleness; we only stop maintaining the swarm.
    pub(crate) fn leave_swarm(&mut self, info_hash: InfoHash) {
        if self.swarms.remove(&info_hash).is_some() {
            info!("leaving hidden swarm {}", info_hash);
        }
        self.pending_e2e.remove(&info_hash);
    }

    /// Downloader: prepare the rendezvous and introduction circuits
    /// for a swarm.
    fn begin_rendezvous(&mut self, info_hash: InfoHash, hops: u8, now: Instant) {
        if self.pending_e2e.contains_key(&info_hash) {
            return;
        }
        let mut pending = PendingE2e {
            cookie: rand::random::<[u8; 20]>(),
            ..PendingE2e::default()
        };

        // Reuse a live rendezvous circuit for this swarm if one
        // exists; build otherwise.
        let existing_rp = self
            .registry
            .circuits()
            .find(|c| {
                c.ctype() == CircuitType::RpDownloader
                    && c.info_hash() == Some(info_hash)
                    && !matches!(c.state(), CircuitState::Closing | CircuitState::Closed)
            })
            .map(Circuit::circuit_id);
        pending.rp_circuit = match existing_rp {
            Some(circuit_id) => Some(circuit_id),
            None => self
                .create_circuit(
                    hops,
                    CircuitType::RpDownloader,
                    PeerFlags::empty(),
                    Some(info_hash),
                    0,
                    now,
                )
                .map_err(|e| warn!("cannot build rendezvous circuit: {}", e))
                .ok(),
        };
        pending.intro_circuit = self
            .create_circuit(
                hops,
                CircuitType::Intro,
                PeerFlags::empty(),
                Some(info_hash),
                0,
                now,
            )
            .map_err(|e| warn!("cannot build introduction circuit: {}", e))
            .ok();
        self.pending_e2e.insert(info_hash, pending);
    }

    // ------------------------------------------------------------------
    // Downloader side.

    /// A rendezvous circuit is ready: establish the rendezvous point.
    pub(crate) fn on_rp_downloader_ready(&mut self, circuit_id: CircId) {
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        let Some(pending) = self.pending_e2e.get(&info_hash) else {
            return;
        };
        let cookie = pending.cookie;
        let identifier = self.cache.add(
            Pending::Rendezvous { circuit_id },
            self.settings.request_timeout,
            Instant::now(),
        );
        self.send_on_circuit(
            circuit_id,
            msg::EstablishRendezvous::new(identifier, cookie).into(),
        );
    }

    /// The rendezvous point confirmed and told us its address.
    pub(crate) fn on_rendezvous_established(
        &mut self,
        circuit_id: CircId,
        established: &msg::RendezvousEstablished,
    ) {
        match self.cache.pop(RequestKind::EstablishRendezvous, established.identifier()) {
            Some(Pending::Rendezvous { circuit_id: expected }) if expected == circuit_id => {}
            Some(_) | None => {
                warn!("unexpected RENDEZVOUS_ESTABLISHED on circuit {}", circuit_id);
                return;
            }
        }
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        if let Some(pending) = self.pending_e2e.get_mut(&info_hash) {
            pending.rp_addr = Some(established.rendezvous_point());
        }
        self.try_send_create_e2e(info_hash);
    }

    /// An introduction circuit is ready: ask its terminal whether it
    /// serves the swarm.
    pub(crate) fn on_intro_circuit_ready(&mut self, circuit_id: CircId) {
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        let identifier = self.cache.add(
            Pending::Peers {
                circuit_id,
                info_hash,
            },
            self.settings.request_timeout,
            Instant::now(),
        );
        self.send_on_circuit(
            circuit_id,
            msg::PeersRequest::new(identifier, info_hash).into(),
        );
    }

    /// The introduction lookup answered.
    pub(crate) fn on_peers_response(&mut self, circuit_id: CircId, response: &msg::PeersResponse) {
        match self.cache.pop(RequestKind::PeersRequest, response.identifier()) {
            Some(Pending::Peers { circuit_id: expected, .. }) if expected == circuit_id => {}
            Some(_) | None => {
                warn!("unexpected PEERS_RESPONSE on circuit {}", circuit_id);
                return;
            }
        }
        let info_hash = response.info_hash();
        if response.peers().is_empty() {
            debug!("no introduction points known for {}", info_hash);
            return;
        }
        if let Some(pending) = self.pending_e2e.get_mut(&info_hash) {
            pending.intro_confirmed = true;
        }
        self.try_send_create_e2e(info_hash);
    }

    /// Send our CreateE2e once the introduction point is confirmed
    /// and the rendezvous point is established.
    fn try_send_create_e2e(&mut self, info_hash: InfoHash) {
        let Some(pending) = self.pending_e2e.get_mut(&info_hash) else {
            return;
        };
        if pending.sent_create || !pending.intro_confirmed {
            return;
        }
        let (Some(intro_circuit), Some(rp_addr)) = (pending.intro_circuit, pending.rp_addr) else {
            return;
        };
        let (handshake, our_half) = HandshakeState::start();
        pending.handshake = Some(handshake);
        pending.sent_create = true;
        let cookie = pending.cookie;
        self.send_on_circuit(
            intro_circuit,
            msg::CreateE2e::new(info_hash, our_half, cookie, rp_addr).into(),
        );
    }

    /// The seeder answered our CreateE2e with its key half.
    pub(crate) fn on_created_e2e(&mut self, circuit_id: CircId, created: &msg::CreatedE2e) {
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        let Some(pending) = self.pending_e2e.get_mut(&info_hash) else {
            warn!("unexpected CREATED_E2E on circuit {}", circuit_id);
            return;
        };
        let Some(handshake) = pending.handshake.take() else {
            warn!("CREATED_E2E without an open handshake on {}", circuit_id);
            return;
        };
        match handshake.finish(created.handshake()) {
            Ok(keys) => {
                pending.keys = Some(keys);
                debug!("e2e keys for {} negotiated; waiting for the link", info_hash);
            }
            Err(e) => {
                warn!("e2e handshake for {} failed: {}", info_hash, e);
                self.pending_e2e.remove(&info_hash);
            }
        }
    }

    /// The rendezvous point linked our circuit to the seeder's.
    pub(crate) fn on_linked_e2e(&mut self, circuit_id: CircId) {
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        let Some(pending) = self.pending_e2e.get_mut(&info_hash) else {
            // The seeder side: keys are already on the circuit.
            debug!("e2e link complete on circuit {}", circuit_id);
            return;
        };
        let Some(keys) = pending.keys.take() else {
            warn!("LINKED_E2E before the e2e handshake finished on {}", circuit_id);
            return;
        };
        if let Some(circuit) = self.registry.circuit_mut(circuit_id) {
            circuit.set_e2e_keys(keys, true);
        }
        let address = SocketAddr::new(circuit_id_to_ip(circuit_id).into(), E2E_PORT);
        self.on_e2e_finished(address, info_hash);
        self.update_ip_filter(info_hash);
    }

    /// Hand a finished e2e endpoint to the download it belongs to.
    pub(crate) fn on_e2e_finished(&mut self, address: SocketAddr, info_hash: InfoHash) {
        match self.get_download(info_hash) {
            Some(download) => {
                info!("hidden services peer {} for {}", address, info_hash);
                download.add_peer(address);
            }
            None => {
                warn!(
                    "could not find download for adding hidden services peer {}",
                    address
                );
            }
        }
    }

    /// Refresh the libtorrent IP filter with the pseudo addresses of
    /// every e2e circuit, so the engine accepts them as peers.
    pub(crate) fn update_ip_filter(&mut self, info_hash: InfoHash) {
        let Some(dm) = self.download_manager.clone() else {
            return;
        };
        let Some(hops) = self.swarms.get(&info_hash).map(|s| s.hops) else {
            return;
        };
        let addresses = self
            .registry
            .circuits()
            .filter(|c| c.has_e2e_keys())
            .map(|c| circuit_id_to_ip(c.circuit_id()).into())
            .collect();
        dm.update_ip_filter(hops, addresses);
    }

    // ------------------------------------------------------------------
    // Seeder side.

    /// Build the introduction circuit for a swarm we seed.
    pub(crate) fn create_introduction_point(&mut self, info_hash: InfoHash, hops: u8, now: Instant) {
        self.bind_socks_sessions(hops);
        match self.create_circuit(
            hops,
            CircuitType::IpSeeder,
            PeerFlags::empty(),
            Some(info_hash),
            0,
            now,
        ) {
            Ok(circuit_id) => {
                info!("creating introducing circuit {} for {}", circuit_id, info_hash);
            }
            Err(e) => warn!("cannot build introduction circuit for {}: {}", info_hash, e),
        }
    }

    /// A seeder's introduction circuit is ready: register with its
    /// terminal.
    pub(crate) fn on_ip_seeder_ready(&mut self, circuit_id: CircId) {
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        let identifier = self.cache.add(
            Pending::Intro {
                circuit_id,
                info_hash,
            },
            self.settings.request_timeout,
            Instant::now(),
        );
        self.send_on_circuit(
            circuit_id,
            msg::EstablishIntro::new(identifier, info_hash).into(),
        );
    }

    /// Our introduction point confirmed.
    pub(crate) fn on_intro_established(&mut self, circuit_id: CircId, established: &msg::IntroEstablished) {
        match self.cache.pop(RequestKind::EstablishIntro, established.identifier()) {
            Some(Pending::Intro { circuit_id: expected, .. }) if expected == circuit_id => {
                info!("introduction point established on circuit {}", circuit_id);
            }
            Some(_) | None => {
                warn!("unexpected INTRO_ESTABLISHED on circuit {}", circuit_id);
            }
        }
    }

    /// A downloader wants to meet: negotiate e2e keys and head for
    /// its rendezvous point. Runs on the seeder, which receives the
    /// CreateE2e relayed down its introduction circuit.
    pub(crate) fn on_create_e2e(&mut self, circuit_id: CircId, create: &msg::CreateE2e, now: Instant) {
        let info_hash = create.info_hash();
        if !self.swarms.get(&info_hash).map_or(false, |s| s.seeding) {
            warn!("CREATE_E2E for a swarm we do not seed: {}", info_hash);
            return;
        }
        let (our_half, keys) = match crate::crypto::respond(create.handshake()) {
            Ok(done) => done,
            Err(e) => {
                warn!("e2e handshake for {} failed: {}", info_hash, e);
                return;
            }
        };
        self.send_on_circuit(circuit_id, msg::CreatedE2e::new(our_half).into());

        let hops = self
            .swarms
            .get(&info_hash)
            .map(|s| s.hops)
            .unwrap_or_else(|| self.settings.default_hops.max(1));
        let pending = PendingE2e {
            cookie: *create.cookie(),
            keys: Some(keys),
            ..PendingE2e::default()
        };
        self.pending_e2e.insert(info_hash, pending);
        let rp: SocketAddr = create.rendezvous_point().into();
        if let Err(e) = self.create_circuit_to(
            rp,
            PeerId::new([0; 32]),
            hops,
            CircuitType::RpSeeder,
            Some(info_hash),
            now,
        ) {
            warn!("cannot build circuit to rendezvous point {}: {}", rp, e);
            self.pending_e2e.remove(&info_hash);
        }
    }

    /// The seeder's circuit to the rendezvous point is ready: link up.
    pub(crate) fn on_rp_seeder_ready(&mut self, circuit_id: CircId) {
        let Some(info_hash) = self.registry.circuit(circuit_id).and_then(Circuit::info_hash) else {
            return;
        };
        let Some(pending) = self.pending_e2e.get_mut(&info_hash) else {
            return;
        };
        let Some(keys) = pending.keys.take() else {
            return;
        };
        let cookie = pending.cookie;
        self.pending_e2e.remove(&info_hash);
        if let Some(circuit) = self.registry.circuit_mut(circuit_id) {
            circuit.set_e2e_keys(keys, false);
        }
        self.send_on_circuit(circuit_id, msg::LinkE2e::new(cookie).into());
        self.update_ip_filter(info_hash);
    }

    // ------------------------------------------------------------------
    // Exit side: introduction- and rendezvous-point services.

    /// Serve as an introduction point for a seeder.
    pub(crate) fn on_establish_intro(&mut self, circuit_id: CircId, establish: &msg::EstablishIntro) {
        let Some(exit) = self.registry.exit(circuit_id) else {
            return;
        };
        let seeder_key = exit.peer_key;
        info!(
            "serving as introduction point for {} on circuit {}",
            establish.info_hash(),
            circuit_id
        );
        self.intro_services.insert(
            establish.info_hash(),
            IntroService {
                seeder_circuit: circuit_id,
                seeder_key,
            },
        );
        self.send_from_exit(
            circuit_id,
            msg::IntroEstablished::new(establish.identifier()).into(),
        );
    }

    /// Answer an introduction lookup from our service table.
    pub(crate) fn on_peers_request(&mut self, circuit_id: CircId, request: &msg::PeersRequest) {
        let peers = match (self.intro_services.get(&request.info_hash()), self.endpoint.local_addr()) {
            (Some(service), Ok(local)) => vec![IntroPoint {
                address: local.into(),
                seeder_key: service.seeder_key,
            }],
            _ => Vec::new(),
        };
        self.send_from_exit(
            circuit_id,
            msg::PeersResponse::new(request.identifier(), request.info_hash(), peers).into(),
        );
    }

    /// Forward a downloader's CreateE2e to the seeder behind us.
    pub(crate) fn on_intro_forward_create(&mut self, circuit_id: CircId, create: &msg::CreateE2e) {
        let Some(service) = self.intro_services.get(&create.info_hash()) else {
            warn!("CREATE_E2E for unknown swarm {}", create.info_hash());
            return;
        };
        let seeder_circuit = service.seeder_circuit;
        self.pending_intro_relays.insert(seeder_circuit, circuit_id);
        self.send_from_exit(seeder_circuit, create.clone().into());
    }

    /// Forward a seeder's CreatedE2e back to the waiting downloader.
    pub(crate) fn on_intro_forward_created(&mut self, circuit_id: CircId, created: &msg::CreatedE2e) {
        let Some(downloader_circuit) = self.pending_intro_relays.remove(&circuit_id) else {
            warn!("CREATED_E2E with no waiting downloader on {}", circuit_id);
            return;
        };
        self.send_from_exit(downloader_circuit, created.clone().into());
    }

    /// Serve as a rendezvous point: remember the cookie.
    pub(crate) fn on_establish_rendezvous(
        &mut self,
        circuit_id: CircId,
        establish: &msg::EstablishRendezvous,
    ) {
        let local = match self.endpoint.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!("cannot determine our address for rendezvous: {}", e);
                return;
            }
        };
        self.rendezvous_points.insert(*establish.cookie(), circuit_id);
        self.send_from_exit(
            circuit_id,
            msg::RendezvousEstablished::new(establish.identifier(), local.into()).into(),
        );
    }

    /// The second side of a rendezvous arrived: splice the circuits.
    pub(crate) fn on_link_e2e(&mut self, circuit_id: CircId, link: &msg::LinkE2e) {
        let Some(&other) = self.rendezvous_points.get(link.cookie()) else {
            warn!("LINK_E2E with unknown cookie on circuit {}", circuit_id);
            return;
        };
        if other == circuit_id {
            debug!("duplicate LINK_E2E on circuit {}", circuit_id);
            return;
        }
        self.rendezvous_points.remove(link.cookie());

        // Confirm to both sides while we still hold their exit
        // sockets, then convert the pair into a splice.
        self.send_from_exit(circuit_id, msg::LinkedE2e::new().into());
        self.send_from_exit(other, msg::LinkedE2e::new().into());

        let (Some(one), Some(two)) = (
            self.registry.remove_exit(circuit_id),
            self.registry.remove_exit(other),
        ) else {
            warn!("rendezvous circuits vanished while splicing");
            return;
        };
        let forward = crate::registry::RelayEntry {
            out_circuit: other,
            out_peer: two.peer_addr,
            peel_keys: Some(one.keys.clone()),
            add_keys: Some(two.keys.clone()),
            bytes_relayed: 0,
        };
        let backward = crate::registry::RelayEntry {
            out_circuit: circuit_id,
            out_peer: one.peer_addr,
            peel_keys: Some(two.keys.clone()),
            add_keys: Some(one.keys.clone()),
            bytes_relayed: 0,
        };
        if let Err(e) = self
            .registry
            .insert_relay_pair(circuit_id, forward, other, backward)
        {
            warn!("could not splice rendezvous circuits: {}", e);
            return;
        }
        info!("linked e2e circuits {} and {}", circuit_id, other);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn lookup_infohash_is_stable_and_distinct() {
        let a = lookup_info_hash(InfoHash::new([0xab; 20]));
        let b = lookup_info_hash(InfoHash::new([0xab; 20]));
        let c = lookup_info_hash(InfoHash::new([0xcd; 20]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, InfoHash::new([0xab; 20]));
    }

    #[test]
    fn lookup_infohash_known_value() {
        // SHA1("tribler anonymous download" + "00" * 20), hex input.
        let real = InfoHash::new([0; 20]);
        let lookup = lookup_info_hash(real);
        let mut hasher = Sha1::new();
        hasher.update(b"tribler anonymous download");
        hasher.update([b'0'; 40]);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(lookup, InfoHash::new(expected));
    }
}
