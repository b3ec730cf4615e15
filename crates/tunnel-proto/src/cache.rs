//! Short-lived request correlation.
//!
//! Every request/response exchange on the overlay is correlated by a
//! `(kind, identifier)` pair. Entries carry a TTL; the community's
//! maintenance tick sweeps expired entries and fails whatever was
//! waiting on them with a timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tunnel_cell::{CircId, InfoHash};

use crate::{Error, Result};

/// The kinds of outstanding requests we track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RequestKind {
    /// An HTTP-over-tunnel request awaiting response fragments.
    HttpRequest,
    /// An EstablishIntro awaiting IntroEstablished.
    EstablishIntro,
    /// An EstablishRendezvous awaiting RendezvousEstablished.
    EstablishRendezvous,
    /// A PeersRequest awaiting PeersResponse.
    PeersRequest,
}

/// Reassembly state for a fragmented HTTP response.
pub(crate) struct HttpPending {
    /// The circuit the request was sent down.
    pub(crate) circuit_id: CircId,
    /// Received fragments, by part index. Sized on first fragment.
    parts: Vec<Option<Vec<u8>>>,
    /// Resolves with the reassembled response.
    pub(crate) reply: Option<oneshot::Sender<Result<Vec<u8>>>>,
}

impl HttpPending {
    /// Construct reassembly state for a request on `circuit_id`.
    pub(crate) fn new(circuit_id: CircId, reply: oneshot::Sender<Result<Vec<u8>>>) -> Self {
        HttpPending {
            circuit_id,
            parts: Vec::new(),
            reply: Some(reply),
        }
    }

    /// Record one response fragment.
    ///
    /// Returns the full response once every fragment is present.
    /// Fragments disagreeing with the first-seen `total`, duplicates,
    /// and out-of-range parts are ignored.
    pub(crate) fn add_response(&mut self, part: u16, total: u16, data: Vec<u8>) -> Option<Vec<u8>> {
        if total == 0 {
            return None;
        }
        if self.parts.is_empty() {
            self.parts = vec![None; total as usize];
        }
        if self.parts.len() != total as usize {
            return None;
        }
        let Some(slot) = self.parts.get_mut(part as usize) else {
            return None;
        };
        if slot.is_none() {
            *slot = Some(data);
        }
        if self.parts.iter().all(Option::is_some) {
            let response = self
                .parts
                .drain(..)
                .map(|p| p.unwrap_or_default())
                .collect::<Vec<_>>()
                .concat();
            return Some(response);
        }
        None
    }
}

/// What an expired or answered cache entry was waiting for.
pub(crate) enum Pending {
    /// HTTP response reassembly.
    Http(HttpPending),
    /// An introduction-point confirmation, for this swarm.
    Intro {
        /// The circuit carrying the EstablishIntro.
        circuit_id: CircId,
        /// The swarm the introduction point serves.
        info_hash: InfoHash,
    },
    /// A rendezvous-point confirmation.
    Rendezvous {
        /// The circuit carrying the EstablishRendezvous.
        circuit_id: CircId,
    },
    /// An introduction-point lookup.
    Peers {
        /// The circuit carrying the PeersRequest.
        circuit_id: CircId,
        /// The swarm being looked up.
        info_hash: InfoHash,
    },
}

impl Pending {
    /// Which kind of request this entry answers.
    fn kind(&self) -> RequestKind {
        match self {
            Pending::Http(_) => RequestKind::HttpRequest,
            Pending::Intro { .. } => RequestKind::EstablishIntro,
            Pending::Rendezvous { .. } => RequestKind::EstablishRendezvous,
            Pending::Peers { .. } => RequestKind::PeersRequest,
        }
    }
}

/// One cache entry.
struct Entry {
    /// When the entry was added.
    created_at: Instant,
    /// How long the entry lives.
    ttl: Duration,
    /// The request state.
    pending: Pending,
}

/// The request cache: `(kind, identifier)` to pending request state.
#[derive(Default)]
pub(crate) struct RequestCache {
    /// Identifier allocator; wraps around.
    next_id: u32,
    /// The live entries.
    entries: HashMap<(RequestKind, u32), Entry>,
}

impl RequestCache {
    /// Construct an empty cache.
    pub(crate) fn new() -> Self {
        RequestCache::default()
    }

    /// Add an entry, returning its identifier (unique per kind among
    /// live entries).
    pub(crate) fn add(&mut self, pending: Pending, ttl: Duration, now: Instant) -> u32 {
        let kind = pending.kind();
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.entries.contains_key(&(kind, id)) {
                continue;
            }
            self.entries.insert(
                (kind, id),
                Entry {
                    created_at: now,
                    ttl,
                    pending,
                },
            );
            return id;
        }
    }

    /// Return true if an entry with this kind and identifier is live.
    pub(crate) fn has(&self, kind: RequestKind, id: u32) -> bool {
        self.entries.contains_key(&(kind, id))
    }

    /// Return the pending state for this entry, mutably.
    pub(crate) fn get_mut(&mut self, kind: RequestKind, id: u32) -> Option<&mut Pending> {
        self.entries.get_mut(&(kind, id)).map(|e| &mut e.pending)
    }

    /// Remove and return the pending state for this entry.
    pub(crate) fn pop(&mut self, kind: RequestKind, id: u32) -> Option<Pending> {
        self.entries.remove(&(kind, id)).map(|e| e.pending)
    }

    /// Number of live entries of this kind bound to `circuit_id`.
    pub(crate) fn count_for_circuit(&self, kind: RequestKind, circuit_id: CircId) -> usize {
        self.entries
            .iter()
            .filter(|((k, _), e)| {
                *k == kind
                    && match &e.pending {
                        Pending::Http(h) => h.circuit_id == circuit_id,
                        Pending::Intro { circuit_id: c, .. } => *c == circuit_id,
                        Pending::Rendezvous { circuit_id: c } => *c == circuit_id,
                        Pending::Peers { circuit_id: c, .. } => *c == circuit_id,
                    }
            })
            .count()
    }

    /// Sweep expired entries, failing their futures with a timeout.
    ///
    /// Returns the expired entries so the caller can do kind-specific
    /// cleanup (e.g. schedule a rebuild).
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(RequestKind, u32, Pending)> {
        let expired: Vec<(RequestKind, u32)> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.created_at) >= e.ttl)
            .map(|(key, _)| *key)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for (kind, id) in expired {
            if let Some(entry) = self.entries.remove(&(kind, id)) {
                let mut pending = entry.pending;
                if let Pending::Http(http) = &mut pending {
                    if let Some(reply) = http.reply.take() {
                        let _ = reply.send(Err(Error::Timeout(entry.ttl)));
                    }
                }
                out.push((kind, id, pending));
            }
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// A pending HTTP entry plus its reply receiver.
    fn http_pending(circ: u32) -> (Pending, oneshot::Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending::Http(HttpPending::new(CircId::new(circ).unwrap(), tx)),
            rx,
        )
    }

    #[test]
    fn add_has_pop() {
        let mut cache = RequestCache::new();
        let now = Instant::now();
        let (pending, _rx) = http_pending(1);
        let id = cache.add(pending, Duration::from_secs(10), now);
        assert!(cache.has(RequestKind::HttpRequest, id));
        assert!(!cache.has(RequestKind::PeersRequest, id));
        assert!(cache.pop(RequestKind::HttpRequest, id).is_some());
        assert!(!cache.has(RequestKind::HttpRequest, id));
    }

    #[test]
    fn expiry_fails_the_future() {
        let mut cache = RequestCache::new();
        let now = Instant::now();
        let (pending, mut rx) = http_pending(1);
        let id = cache.add(pending, Duration::from_secs(5), now);

        assert!(cache.expire(now + Duration::from_secs(1)).is_empty());
        let expired = cache.expire(now + Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, id);
        assert!(matches!(rx.try_recv().unwrap(), Some(Err(Error::Timeout(_)))));
    }

    #[test]
    fn fragment_reassembly_in_part_order() {
        let (tx, _rx) = oneshot::channel();
        let mut pending = HttpPending::new(CircId::new(1).unwrap(), tx);
        // Fragments arrive out of order; the result is in part order.
        assert!(pending.add_response(1, 3, b"bbb".to_vec()).is_none());
        assert!(pending.add_response(2, 3, b"cc".to_vec()).is_none());
        // A duplicate changes nothing.
        assert!(pending.add_response(1, 3, b"XXX".to_vec()).is_none());
        // A fragment with an inconsistent total is ignored.
        assert!(pending.add_response(0, 7, b"zz".to_vec()).is_none());
        let full = pending.add_response(0, 3, b"aaaa".to_vec()).unwrap();
        assert_eq!(full, b"aaaabbbcc".to_vec());
    }

    #[test]
    fn per_circuit_counting() {
        let mut cache = RequestCache::new();
        let now = Instant::now();
        for _ in 0..3 {
            let (pending, rx) = http_pending(9);
            std::mem::forget(rx);
            cache.add(pending, Duration::from_secs(10), now);
        }
        let (pending, rx) = http_pending(4);
        std::mem::forget(rx);
        cache.add(pending, Duration::from_secs(10), now);

        let circ9 = CircId::new(9).unwrap();
        assert_eq!(cache.count_for_circuit(RequestKind::HttpRequest, circ9), 3);
    }
}
