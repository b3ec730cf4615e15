//! Configuration for the tunnel community.

use std::path::PathBuf;
use std::time::Duration;

use tunnel_cell::PeerFlags;

/// Tuning knobs and collaborator wiring for a [`TunnelCommunity`].
///
/// [`TunnelCommunity`]: crate::TunnelCommunity
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TunnelSettings {
    /// Smallest number of data circuits to keep per hop count with
    /// at least one active download.
    pub min_circuits: usize,
    /// Largest number of data circuits to build per hop count.
    pub max_circuits: usize,
    /// How many circuits built by others we are willing to carry, as
    /// relay or exit.
    pub max_joined_circuits: usize,
    /// The flags we advertise to other peers.
    pub peer_flags: PeerFlags,
    /// Whether we exit traffic to the open internet.
    pub exitnode_enabled: bool,
    /// Hop count used for circuits not tied to a download.
    pub default_hops: u8,
    /// How long one circuit-extension step may take before the
    /// circuit is torn down.
    pub extend_timeout: Duration,
    /// Total build attempts for one logical circuit request.
    pub max_build_attempts: u32,
    /// Largest number of concurrent HTTP requests served per circuit
    /// at an exit.
    pub max_http_requests_per_circuit: usize,
    /// Deadline for one exit-side HTTP fetch.
    pub http_fetch_timeout: Duration,
    /// How long an unanswered request-cache entry lives.
    pub request_timeout: Duration,
    /// Minimum spacing between forced DHT announces per torrent.
    pub dht_announce_interval: Duration,
    /// How long a candidate may stay silent before we forget it.
    pub candidate_timeout: Duration,
    /// Snapshot file for known exit peers, if any.
    pub exitnode_cache: Option<PathBuf>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        TunnelSettings {
            min_circuits: 1,
            max_circuits: 8,
            max_joined_circuits: 100,
            peer_flags: PeerFlags::RELAY,
            exitnode_enabled: false,
            default_hops: 1,
            extend_timeout: Duration::from_secs(10),
            max_build_attempts: 3,
            max_http_requests_per_circuit: 5,
            http_fetch_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            dht_announce_interval: Duration::from_secs(60),
            candidate_timeout: Duration::from_secs(180),
            exitnode_cache: None,
        }
    }
}

impl TunnelSettings {
    /// Return the flags we advertise, accounting for exit-node mode.
    ///
    /// An exit node advertises every exit capability on top of its
    /// configured flags.
    pub fn advertised_flags(&self) -> PeerFlags {
        if self.exitnode_enabled {
            self.peer_flags
                .union(PeerFlags::EXIT_BT)
                .union(PeerFlags::EXIT_IPV8)
                .union(PeerFlags::EXIT_HTTP)
        } else {
            self.peer_flags
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

    #[test]
    fn exit_mode_adds_flags() {
        let mut settings = TunnelSettings::default();
        assert!(!settings.advertised_flags().contains(PeerFlags::EXIT_BT));
        settings.exitnode_enabled = true;
        let flags = settings.advertised_flags();
        assert!(flags.contains(PeerFlags::RELAY));
        assert!(flags.contains(PeerFlags::EXIT_BT));
        assert!(flags.contains(PeerFlags::EXIT_IPV8));
        assert!(flags.contains(PeerFlags::EXIT_HTTP));
    }
}
