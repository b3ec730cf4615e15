//! Contracts for the download manager collaborator.
//!
//! The libtorrent session wrapper lives outside this crate; the tunnel
//! community only sees these narrow traits. Tests drive the community
//! with hand-written fakes implementing them.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tunnel_cell::InfoHash;

/// The status of a download, as reported by the download manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DownloadStatus {
    /// Waiting for a hash check before starting.
    HashChecking,
    /// Fetching metadata from the swarm.
    Metadata,
    /// Transferring payload data.
    Downloading,
    /// Complete and uploading to others.
    Seeding,
    /// Stopped by the user.
    Stopped,
    /// Stopped because of an error.
    StoppedOnError,
}

impl DownloadStatus {
    /// Return true for the states in which a download needs circuits.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Downloading | DownloadStatus::Seeding | DownloadStatus::Metadata
        )
    }
}

/// One local download, as seen by the tunnel community.
pub trait Download: Send + Sync {
    /// The real infohash of the torrent.
    fn info_hash(&self) -> InfoHash;
    /// The number of hops this download's circuits must have.
    fn hops(&self) -> u8;
    /// True for short-lived internal (metainfo) downloads, which never
    /// warrant circuit creation.
    fn hidden(&self) -> bool;
    /// The current status of this download.
    fn status(&self) -> DownloadStatus;
    /// Offer the BitTorrent engine a peer address for this download.
    fn add_peer(&self, addr: SocketAddr);
    /// Force a DHT announce for this torrent.
    fn force_dht_announce(&self);
}

/// A point-in-time observation of one download.
#[derive(Clone)]
pub struct DownloadState {
    /// The download this state belongs to.
    pub download: Arc<dyn Download>,
    /// The status at observation time.
    pub status: DownloadStatus,
    /// How many peers the download was connected to.
    pub peers: usize,
}

/// The download manager collaborator.
pub trait DownloadManager: Send + Sync {
    /// Return every download the manager knows about.
    fn get_downloads(&self) -> Vec<Arc<dyn Download>>;
    /// Return the most recent state observation for every download.
    fn get_last_download_states(&self) -> Vec<DownloadState>;
    /// Return true if a libtorrent session exists for this hop count.
    fn has_session(&self, hops: u8) -> bool;
    /// Return the listen ports of the session for this hop count,
    /// keyed by interface address.
    fn listen_ports(&self, hops: u8) -> HashMap<IpAddr, u16>;
    /// Replace the IP filter of the session for this hop count.
    fn update_ip_filter(&self, hops: u8, addresses: Vec<IpAddr>);
}
