//! The download monitor.
//!
//! Once a second the community looks at the download manager's latest
//! state observations and reconciles the overlay with them: sizing the
//! data-circuit pool, joining and leaving hidden swarms, keeping one
//! introduction circuit per seeded swarm, nudging the libtorrent DHT
//! when a download sits peerless, and binding SOCKS5 UDP associations
//! to the libtorrent listen ports.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use tracing::{debug, warn};
use tunnel_cell::InfoHash;

use crate::circuit::{CircuitState, CircuitType};
use crate::community::TunnelCommunity;
use crate::download::{DownloadState, DownloadStatus};
use crate::rendezvous::lookup_info_hash;

/// A decision taken while scanning the swarm states, applied after
/// the scan.
enum SwarmAction {
    /// Join (or re-join in a new role) a swarm.
    Join {
        /// The swarm's lookup infohash.
        info_hash: InfoHash,
        /// Hop count for its circuits.
        hops: u8,
        /// Whether we are seeding it.
        seeding: bool,
    },
    /// Leave a swarm.
    Leave {
        /// The swarm's lookup infohash.
        info_hash: InfoHash,
    },
    /// Build a missing introduction circuit for a seeded swarm.
    CreateIntro {
        /// The swarm's lookup infohash.
        info_hash: InfoHash,
        /// Hop count for the circuit.
        hops: u8,
    },
}

impl TunnelCommunity {
    /// Reconcile the overlay with the latest download states.
    pub(crate) fn monitor_downloads(&mut self, states: &[DownloadState], now: Instant) {
        let mut new_states: HashMap<InfoHash, DownloadStatus> = HashMap::new();
        let mut hops_by_swarm: HashMap<InfoHash, u8> = HashMap::new();
        let mut active_per_hop: HashMap<u8, usize> = HashMap::new();

        // Keep the default hop count represented even with nothing
        // active, so its pool never drains to zero.
        if self.settings.default_hops > 0 {
            active_per_hop.insert(self.settings.default_hops, 0);
        }

        for state in states {
            let download = &state.download;
            // Metainfo downloads are alive for a short period and
            // don't warrant circuit creation.
            if download.hidden() {
                continue;
            }
            let hop_count = download.hops();
            if hop_count == 0 {
                continue;
            }
            let real_info_hash = download.info_hash();
            let info_hash = lookup_info_hash(real_info_hash);
            hops_by_swarm.insert(info_hash, hop_count);
            new_states.insert(info_hash, state.status);

            if !state.status.is_active() {
                continue;
            }
            *active_per_hop.entry(hop_count).or_insert(0) += 1;

            // Work-around for the libtorrent DHT making no requests
            // after a period of having no circuits.
            let throttled = self
                .last_forced_announce
                .get(&real_info_hash)
                .map_or(false, |last| {
                    now.duration_since(*last) < self.settings.dht_announce_interval
                });
            if !throttled
                && state.peers == 0
                && !self.registry.find_ready(Some(hop_count), None, None).is_empty()
                && self
                    .download_manager
                    .as_ref()
                    .map_or(false, |dm| dm.has_session(hop_count))
            {
                debug!("forcing DHT announce for {}", real_info_hash);
                download.force_dht_announce();
                self.last_forced_announce.insert(real_info_hash, now);
            }
        }

        // One circuit per download, clamped per hop count.
        self.circuits_needed = active_per_hop
            .into_iter()
            .map(|(hops, count)| {
                (
                    hops,
                    count.clamp(self.settings.min_circuits, self.settings.max_circuits),
                )
            })
            .collect();

        self.monitor_hidden_swarms(&new_states, &hops_by_swarm, now);
        self.download_states = new_states;
    }

    /// Join and leave hidden swarms as download states change, and
    /// keep one introduction circuit per seeded swarm.
    fn monitor_hidden_swarms(
        &mut self,
        new_states: &HashMap<InfoHash, DownloadStatus>,
        hops_by_swarm: &HashMap<InfoHash, u8>,
        now: Instant,
    ) {
        let mut intro_counter: HashMap<InfoHash, usize> = HashMap::new();
        for circuit in self.registry.circuits() {
            if circuit.ctype() == CircuitType::IpSeeder
                && !matches!(circuit.state(), CircuitState::Closing | CircuitState::Closed)
            {
                if let Some(info_hash) = circuit.info_hash() {
                    *intro_counter.entry(info_hash).or_insert(0) += 1;
                }
            }
        }

        let all_swarms: HashSet<InfoHash> = new_states
            .keys()
            .chain(self.download_states.keys())
            .copied()
            .collect();
        let mut actions = Vec::new();
        for info_hash in all_swarms {
            let new_state = new_states.get(&info_hash).copied();
            let old_state = self.download_states.get(&info_hash).copied();
            let state_changed = new_state != old_state;
            let hops = hops_by_swarm.get(&info_hash).copied().unwrap_or(0);

            if state_changed && new_state.map_or(false, |s| s.is_active()) {
                // A metadata fetch graduating into a download keeps
                // its swarm infrastructure; re-joining would be
                // redundant.
                let suppressed = old_state == Some(DownloadStatus::Metadata)
                    && new_state == Some(DownloadStatus::Downloading);
                if !suppressed && hops > 0 {
                    actions.push(SwarmAction::Join {
                        info_hash,
                        hops,
                        seeding: new_state == Some(DownloadStatus::Seeding),
                    });
                }
            } else if state_changed
                && matches!(
                    new_state,
                    None | Some(DownloadStatus::Stopped) | Some(DownloadStatus::StoppedOnError)
                )
            {
                actions.push(SwarmAction::Leave { info_hash });
            }

            // Ensure we have enough introduction circuits for this
            // swarm. Currently we keep exactly one.
            if new_state == Some(DownloadStatus::Seeding)
                && intro_counter.get(&info_hash).copied().unwrap_or(0) == 0
                && hops > 0
            {
                actions.push(SwarmAction::CreateIntro { info_hash, hops });
            }
        }

        for action in actions {
            match action {
                SwarmAction::Join {
                    info_hash,
                    hops,
                    seeding,
                } => self.join_swarm(info_hash, hops, seeding, now),
                SwarmAction::Leave { info_hash } => self.leave_swarm(info_hash),
                SwarmAction::CreateIntro { info_hash, hops } => {
                    self.create_introduction_point(info_hash, hops, now);
                }
            }
        }
    }

    /// Bind the UDP association of every SOCKS5 session for this hop
    /// count to the libtorrent listen port.
    ///
    /// libtorrent's ASSOCIATE does not carry the source address, so
    /// the association must be pinned from our side. Any non-loopback
    /// listen interface will do; loopback is never chosen.
    pub(crate) fn bind_socks_sessions(&mut self, hops: u8) {
        let Some(dm) = self.download_manager.as_ref() else {
            return;
        };
        let ports = dm.listen_ports(hops);
        let Some(port) = ports
            .iter()
            .find(|(addr, _)| !addr.is_loopback())
            .map(|(_, port)| *port)
        else {
            warn!("no non-loopback listen port for {} hops", hops);
            return;
        };
        let Some(server) = self.socks_servers.get_mut(usize::from(hops.saturating_sub(1))) else {
            return;
        };
        for session in &mut server.sessions {
            if let Some(connection) = &mut session.udp_connection {
                if connection.remote_udp_address().is_none() {
                    connection.set_remote_udp_address(SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::LOCALHOST),
                        port,
                    ));
                }
            }
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
    use crate::circuit::Circuit;
    use crate::config::TunnelSettings;
    use crate::download::{Download, DownloadManager};
    use crate::endpoint::Endpoint;
    use crate::events::Notifier;
    use crate::socks::{Socks5Server, Socks5Session};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tunnel_cell::{CircId, PeerFlags, PeerId};
    use tunnel_eva::EvaSettings;

    /// A download whose status the test controls.
    struct MockDownload {
        /// Real infohash.
        info_hash: InfoHash,
        /// Hop count.
        hops: u8,
        /// Metainfo download flag.
        hidden: bool,
        /// Current status.
        status: Mutex<DownloadStatus>,
        /// Addresses handed to `add_peer`.
        peers_added: Mutex<Vec<SocketAddr>>,
        /// Number of forced DHT announces.
        announces: AtomicUsize,
    }

    impl MockDownload {
        /// A visible (non-hidden) download in the given state.
        fn new(seed: u8, hops: u8, status: DownloadStatus) -> Arc<Self> {
            Arc::new(MockDownload {
                info_hash: InfoHash::new([seed; 20]),
                hops,
                hidden: false,
                status: Mutex::new(status),
                peers_added: Mutex::new(Vec::new()),
                announces: AtomicUsize::new(0),
            })
        }
    }

    impl Download for MockDownload {
        fn info_hash(&self) -> InfoHash {
            self.info_hash
        }
        fn hops(&self) -> u8 {
            self.hops
        }
        fn hidden(&self) -> bool {
            self.hidden
        }
        fn status(&self) -> DownloadStatus {
            *self.status.lock().unwrap()
        }
        fn add_peer(&self, addr: SocketAddr) {
            self.peers_added.lock().unwrap().push(addr);
        }
        fn force_dht_announce(&self) {
            self.announces.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A download manager over a fixed set of mock downloads.
    struct MockManager {
        /// The downloads it reports.
        downloads: Vec<Arc<MockDownload>>,
    }

    impl DownloadManager for MockManager {
        fn get_downloads(&self) -> Vec<Arc<dyn Download>> {
            self.downloads
                .iter()
                .map(|d| Arc::clone(d) as Arc<dyn Download>)
                .collect()
        }
        fn get_last_download_states(&self) -> Vec<DownloadState> {
            self.downloads
                .iter()
                .map(|d| DownloadState {
                    download: Arc::clone(d) as Arc<dyn Download>,
                    status: d.status(),
                    peers: 0,
                })
                .collect()
        }
        fn has_session(&self, _hops: u8) -> bool {
            true
        }
        fn listen_ports(&self, _hops: u8) -> HashMap<IpAddr, u16> {
            HashMap::from([
                (IpAddr::V4(Ipv4Addr::LOCALHOST), 1111),
                ("192.168.1.2".parse().unwrap(), 6881),
            ])
        }
        fn update_ip_filter(&self, _hops: u8, _addresses: Vec<IpAddr>) {}
    }

    /// A community wired to the given manager, with one SOCKS5 server.
    async fn community_with(
        dm: Option<Arc<dyn DownloadManager>>,
    ) -> TunnelCommunity {
        let (endpoint, _rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap(), PeerId::new([9; 32]))
            .await
            .unwrap();
        let servers = vec![Socks5Server {
            sessions: vec![Socks5Session::with_udp()],
        }];
        let (community, _handle) = TunnelCommunity::new(
            TunnelSettings::default(),
            endpoint,
            Notifier::new(),
            dm,
            servers,
            EvaSettings::default(),
        );
        community
    }

    /// Insert a ready 1-hop data circuit so the announce gate opens.
    fn add_ready_circuit(community: &mut TunnelCommunity, id: u32) {
        let mut circuit = Circuit::new(
            CircId::new(id).unwrap(),
            1,
            CircuitType::Data,
            PeerFlags::EXIT_BT,
            None,
            Vec::new(),
            0,
            Instant::now(),
        );
        circuit.mark_ready();
        community.registry.insert_circuit(circuit).unwrap();
    }

    #[tokio::test]
    async fn circuits_needed_clamped() {
        let downloads: Vec<Arc<MockDownload>> = (0..12)
            .map(|i| MockDownload::new(i, 1, DownloadStatus::Downloading))
            .collect();
        let dm = Arc::new(MockManager { downloads });
        let mut community = community_with(Some(dm.clone())).await;

        let states = dm.get_last_download_states();
        community.monitor_downloads(&states, Instant::now());

        // Twelve active downloads, clamped to max_circuits.
        assert_eq!(
            community.circuits_needed.get(&1).copied(),
            Some(TunnelSettings::default().max_circuits)
        );
    }

    #[tokio::test]
    async fn announce_throttled_to_one_per_minute() {
        let download = MockDownload::new(1, 1, DownloadStatus::Downloading);
        let dm = Arc::new(MockManager {
            downloads: vec![Arc::clone(&download)],
        });
        let mut community = community_with(Some(dm.clone())).await;
        add_ready_circuit(&mut community, 5);

        let t0 = Instant::now();
        let states = dm.get_last_download_states();
        community.monitor_downloads(&states, t0);
        assert_eq!(download.announces.load(Ordering::SeqCst), 1);

        // Thirty seconds later: still throttled.
        community.monitor_downloads(&states, t0 + std::time::Duration::from_secs(30));
        assert_eq!(download.announces.load(Ordering::SeqCst), 1);

        // Past the interval: announced again.
        community.monitor_downloads(&states, t0 + std::time::Duration::from_secs(61));
        assert_eq!(download.announces.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn metadata_to_downloading_does_not_rejoin() {
        let download = MockDownload::new(2, 1, DownloadStatus::Metadata);
        let dm = Arc::new(MockManager {
            downloads: vec![Arc::clone(&download)],
        });
        let mut community = community_with(Some(dm.clone())).await;

        let states = dm.get_last_download_states();
        community.monitor_downloads(&states, Instant::now());
        assert_eq!(community.swarms.len(), 1);
        let joined_pending = community.pending_e2e.len();

        // The metadata fetch graduates into a download.
        *download.status.lock().unwrap() = DownloadStatus::Downloading;
        let states = dm.get_last_download_states();
        community.monitor_downloads(&states, Instant::now());

        // The swarm is reused: no second join happened.
        assert_eq!(community.swarms.len(), 1);
        assert_eq!(community.pending_e2e.len(), joined_pending);
        assert!(!community.swarms.values().next().unwrap().seeding);
    }

    #[tokio::test]
    async fn stopping_leaves_the_swarm() {
        let download = MockDownload::new(3, 1, DownloadStatus::Downloading);
        let dm = Arc::new(MockManager {
            downloads: vec![Arc::clone(&download)],
        });
        let mut community = community_with(Some(dm.clone())).await;

        community.monitor_downloads(&dm.get_last_download_states(), Instant::now());
        assert_eq!(community.swarms.len(), 1);

        *download.status.lock().unwrap() = DownloadStatus::Stopped;
        community.monitor_downloads(&dm.get_last_download_states(), Instant::now());
        assert!(community.swarms.is_empty());
    }

    #[tokio::test]
    async fn rejoining_same_state_is_idempotent() {
        let mut community = community_with(None).await;
        let info_hash = InfoHash::new([4; 20]);

        community.join_swarm(info_hash, 1, false, Instant::now());
        let cookie = community.pending_e2e.get(&info_hash).unwrap().cookie;
        community.join_swarm(info_hash, 1, false, Instant::now());

        // Same swarm, same pending state: nothing was rebuilt.
        assert_eq!(community.swarms.len(), 1);
        assert_eq!(community.pending_e2e.get(&info_hash).unwrap().cookie, cookie);
    }

    #[tokio::test]
    async fn socks_binding_skips_loopback() {
        let dm = Arc::new(MockManager { downloads: vec![] });
        let mut community = community_with(Some(dm)).await;

        community.bind_socks_sessions(1);
        let bound = community.socks_servers[0].sessions[0]
            .udp_connection
            .as_ref()
            .unwrap()
            .remote_udp_address()
            .unwrap();
        // Bound to the non-loopback interface's port, via localhost.
        assert_eq!(bound.port(), 6881);
        assert_eq!(bound.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
