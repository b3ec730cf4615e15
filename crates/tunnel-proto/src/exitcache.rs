//! Disk snapshot of known exit peers.
//!
//! Building the first circuit after startup is slow when the
//! candidate table is empty. On unload we snapshot the verified
//! BitTorrent-exit peers to disk; on startup we load the snapshot and
//! send each peer an introduction request, warming the table up. File
//! trouble is never fatal: a missing or corrupt snapshot just means a
//! cold start.

use std::net::SocketAddr;
use std::path::Path;

use tracing::{info, warn};
use tunnel_bytes::{Reader, Writer};
use tunnel_cell::{AddressPort, PeerFlags, PeerId};

/// Magic number identifying an exit-node snapshot file.
const SNAPSHOT_MAGIC: u32 = 0x4558_4e31; // "EXN1"

/// One snapshot entry.
pub(crate) type SnapshotPeer = (SocketAddr, PeerId, PeerFlags);

/// Serialize `peers` to `path`. Failures are logged and swallowed.
pub(crate) fn save_snapshot(path: &Path, peers: &[SnapshotPeer]) {
    let mut bytes: Vec<u8> = Vec::new();
    bytes.write_u32(SNAPSHOT_MAGIC);
    bytes.write_u32(peers.len() as u32);
    for (addr, key, flags) in peers {
        // AddressPort encoding is infallible for the types we hold.
        if bytes.write(&AddressPort::from(*addr)).is_err() {
            warn!("could not encode exit-node snapshot entry");
            return;
        }
        let _ = bytes.write(key);
        let _ = bytes.write(flags);
    }
    info!("writing {} exit nodes to cache file {:?}", peers.len(), path);
    if let Err(e) = std::fs::write(path, bytes) {
        warn!("could not write exit-node cache: {}", e);
    }
}

/// Load a snapshot from `path`. A missing or unreadable file yields
/// the empty set, with a warning.
pub(crate) fn load_snapshot(path: &Path) -> Vec<SnapshotPeer> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("could not read exit-node cache {:?}: {}", path, e);
            return Vec::new();
        }
    };
    match parse_snapshot(&bytes) {
        Ok(peers) => peers,
        Err(e) => {
            warn!("corrupt exit-node cache {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Decode the snapshot body.
fn parse_snapshot(bytes: &[u8]) -> tunnel_bytes::Result<Vec<SnapshotPeer>> {
    let mut r = Reader::from_slice(bytes);
    if r.take_u32()? != SNAPSHOT_MAGIC {
        return Err(tunnel_bytes::Error::BadMessage("bad snapshot magic"));
    }
    let n = r.take_u32()? as usize;
    let mut peers = Vec::with_capacity(n.min(r.remaining()));
    for _ in 0..n {
        let addr: AddressPort = r.extract()?;
        let key: PeerId = r.extract()?;
        let flags: PeerFlags = r.extract()?;
        peers.push((addr.into(), key, flags));
    }
    r.should_be_exhausted()?;
    Ok(peers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// A scratch file path that will not collide between tests.
    fn scratch(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tunnel-exitcache-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn snapshot_roundtrip() {
        let path = scratch("roundtrip");
        let peers: Vec<SnapshotPeer> = (0..3_u8)
            .map(|i| {
                (
                    format!("10.0.0.{}:700{}", i, i).parse().unwrap(),
                    PeerId::new([i; 32]),
                    PeerFlags::EXIT_BT,
                )
            })
            .collect();
        save_snapshot(&path, &peers);
        assert_eq!(load_snapshot(&path), peers);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty() {
        assert!(load_snapshot(&scratch("missing")).is_empty());
    }

    #[test]
    fn corrupt_file_is_empty() {
        let path = scratch("corrupt");
        std::fs::write(&path, b"not a snapshot").unwrap();
        assert!(load_snapshot(&path).is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
