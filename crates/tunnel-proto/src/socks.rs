//! Contracts for the SOCKS5 layer collaborator.
//!
//! The SOCKS5 servers themselves live outside this crate. What the
//! dispatcher needs from them is small: each server (one per hop
//! count) has sessions, each session may have a UDP association, and
//! the community must be able to pin that association to the local
//! libtorrent listen port and hand incoming datagrams back to it.

use std::net::SocketAddr;

/// Callback delivering a datagram to the local SOCKS5 client,
/// together with the origin address to report.
type DatagramSink = Box<dyn Fn(&[u8], SocketAddr) + Send>;

/// The UDP association of one SOCKS5 session.
#[derive(Default)]
pub struct UdpConnection {
    /// Where to send datagrams for this association.
    ///
    /// libtorrent's ASSOCIATE does not carry a source address, so this
    /// stays unset until the community binds it to a listen port.
    remote_udp_address: Option<SocketAddr>,
    /// Delivery callback toward the local client.
    sink: Option<DatagramSink>,
}

impl UdpConnection {
    /// Construct an unbound association.
    pub fn new() -> Self {
        UdpConnection::default()
    }

    /// Return the bound client address, if any.
    pub fn remote_udp_address(&self) -> Option<SocketAddr> {
        self.remote_udp_address
    }

    /// Bind the association to a client address.
    pub fn set_remote_udp_address(&mut self, addr: SocketAddr) {
        self.remote_udp_address = Some(addr);
    }

    /// Install the delivery callback toward the local client.
    pub fn set_sink<F>(&mut self, sink: F)
    where
        F: Fn(&[u8], SocketAddr) + Send + 'static,
    {
        self.sink = Some(Box::new(sink));
    }

    /// Deliver a datagram to the local client, recording `origin` as
    /// the address it came from.
    pub fn send_datagram(&self, payload: &[u8], origin: SocketAddr) {
        if let Some(sink) = &self.sink {
            sink(payload, origin);
        }
    }
}

/// One SOCKS5 session.
#[derive(Default)]
pub struct Socks5Session {
    /// The session's UDP association, if one was negotiated.
    pub udp_connection: Option<UdpConnection>,
}

impl Socks5Session {
    /// Construct a session with a fresh (unbound) UDP association.
    pub fn with_udp() -> Self {
        Socks5Session {
            udp_connection: Some(UdpConnection::new()),
        }
    }
}

/// One SOCKS5 server. Servers are indexed by `hops - 1` in the
/// community's server list.
#[derive(Default)]
pub struct Socks5Server {
    /// The server's live sessions.
    pub sessions: Vec<Socks5Session>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn datagram_delivery() {
        let seen: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let mut conn = UdpConnection::new();
        conn.set_sink(move |payload, origin| {
            sink.lock().unwrap().push((payload.to_vec(), origin));
        });

        let origin: SocketAddr = "1.2.3.4:5".parse().unwrap();
        conn.send_datagram(b"hello", origin);
        assert_eq!(seen.lock().unwrap()[0], (b"hello".to_vec(), origin));
    }

    #[test]
    fn binding_is_sticky() {
        let mut conn = UdpConnection::new();
        assert!(conn.remote_udp_address().is_none());
        conn.set_remote_udp_address("127.0.0.1:6881".parse().unwrap());
        assert_eq!(
            conn.remote_udp_address().unwrap().port(),
            6881
        );
    }
}
