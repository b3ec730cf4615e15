//! The outbound event bus of the tunnel community.
//!
//! Observers (the REST event stream, the GUI, tests) subscribe with a
//! closure; the community publishes fire-and-forget notifications.
//! Nothing in the core ever depends on an observer being present.

use tunnel_cell::{CircId, PeerId};

/// An event published by the tunnel community.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Notification {
    /// A circuit, relay, or exit socket was removed.
    CircuitRemoved {
        /// The circuit that was removed.
        circuit_id: CircId,
        /// Why it was removed.
        additional_info: String,
    },
    /// A tunnel was removed, with its lifetime statistics.
    TunnelRemoved {
        /// The circuit that carried the tunnel.
        circuit_id: CircId,
        /// Bytes sent over the tunnel.
        bytes_up: u64,
        /// Bytes received over the tunnel.
        bytes_down: u64,
        /// Seconds the tunnel was alive.
        uptime: f64,
        /// Why it was removed.
        additional_info: String,
    },
    /// A peer disappeared from the overlay.
    PeerDisconnected {
        /// The identity of the peer.
        peer_id: PeerId,
    },
    /// Torrent metadata arrived over an EVA transfer.
    TorrentMetadataAdded {
        /// The raw metadata blob.
        metadata: Vec<u8>,
    },
}

/// Observer callback type.
type Observer = Box<dyn Fn(&Notification) + Send>;

/// A minimal synchronous event bus.
#[derive(Default)]
pub struct Notifier {
    /// The registered observers.
    observers: Vec<Observer>,
}

impl Notifier {
    /// Construct a notifier with no observers.
    pub fn new() -> Self {
        Notifier::default()
    }

    /// Register an observer for all notifications.
    pub fn add_observer<F>(&mut self, observer: F)
    where
        F: Fn(&Notification) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Publish a notification to every observer.
    pub fn notify(&self, notification: &Notification) {
        for observer in &self.observers {
            observer(notification);
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_observers_notified() {
        let mut notifier = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            notifier.add_observer(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        notifier.notify(&Notification::PeerDisconnected {
            peer_id: PeerId::new([0; 32]),
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
