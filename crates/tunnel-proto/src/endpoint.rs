//! The UDP messaging endpoint.
//!
//! The endpoint is the only place in the crate where raw network I/O
//! happens. It frames outgoing messages, decodes incoming datagrams,
//! and hands them to the reactor over a channel. It offers no
//! ordering or reliability: that is what circuits and EVA are for.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::channel::mpsc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tunnel_cell::frame::{Frame, FrameMsg};
use tunnel_cell::PeerId;

/// Largest datagram we are prepared to receive.
const MAX_DATAGRAM: usize = 65_535;

/// A bound UDP endpoint.
pub struct Endpoint {
    /// The socket, shared with the receive task.
    socket: Arc<UdpSocket>,
    /// The public key we put in every outgoing frame.
    identity: PeerId,
    /// The receive task, aborted when the endpoint is dropped.
    recv_task: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Bind an endpoint and start its receive task.
    ///
    /// Returns the endpoint and the channel on which decoded frames
    /// arrive, tagged with their source address.
    pub async fn bind(
        addr: SocketAddr,
        identity: PeerId,
    ) -> std::io::Result<(Endpoint, mpsc::UnboundedReceiver<(SocketAddr, Frame)>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = mpsc::unbounded();
        let recv_socket = Arc::clone(&socket);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0_u8; MAX_DATAGRAM];
            loop {
                let (n, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("endpoint receive failed: {}", e);
                        continue;
                    }
                };
                match Frame::decode(&buf[..n]) {
                    Ok(frame) => {
                        if tx.unbounded_send((from, frame)).is_err() {
                            // The reactor is gone; stop reading.
                            return;
                        }
                    }
                    Err(e) => debug!("dropping undecodable datagram from {}: {}", from, e),
                }
            }
        });
        Ok((
            Endpoint {
                socket,
                identity,
                recv_task: Some(recv_task),
            },
            rx,
        ))
    }

    /// Return the address the endpoint is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Return the identity key stamped on outgoing frames.
    pub fn identity(&self) -> PeerId {
        self.identity
    }

    /// Frame and send a message to a peer.
    ///
    /// Sending is fire-and-forget: encode failures and socket errors
    /// are logged and otherwise ignored, as is a datagram the kernel
    /// will not take right now.
    pub fn send_msg(&self, addr: SocketAddr, msg: FrameMsg) {
        let frame = Frame::new(self.identity, msg);
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("could not encode frame for {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = self.socket.try_send_to(&bytes, addr) {
            debug!("send to {} failed: {}", addr, e);
        }
    }

    /// Send an already-encoded tunnel cell to a peer.
    pub fn send_cell_bytes(&self, addr: SocketAddr, cell: Vec<u8>) {
        self.send_msg(addr, FrameMsg::Cell(cell));
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}
