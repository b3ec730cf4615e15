//! The per-node EVA protocol instance: one transfer per direction per
//! peer, frame dispatch, and retransmission timing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tracing::{debug, warn};
use tunnel_cell::eva::{Acknowledgement, Data, Done, ErrorFrame, EvaFrame, WriteRequest};
use tunnel_cell::PeerId;

use crate::incoming::{IncomingOutcome, IncomingTransfer};
use crate::outgoing::{OutgoingOutcome, OutgoingTransfer};
use crate::{EvaError, Result};

/// Tuning knobs for the EVA protocol.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct EvaSettings {
    /// Size of one DATA block, in bytes.
    pub block_size: usize,
    /// Number of blocks a receiver requests per acknowledgement.
    pub window_size: usize,
    /// How long to wait for progress before retransmitting.
    pub retransmit_interval: Duration,
    /// How many consecutive retransmissions to attempt before
    /// declaring the peer gone.
    pub retransmit_attempts: u32,
    /// Largest transfer we are willing to send or accept.
    pub binary_size_limit: u64,
}

impl Default for EvaSettings {
    fn default() -> Self {
        EvaSettings {
            block_size: 1000,
            window_size: 16,
            retransmit_interval: Duration::from_secs(1),
            retransmit_attempts: 3,
            binary_size_limit: 1024 * 1024 * 1024,
        }
    }
}

/// A handle on an outgoing transfer, resolving when it completes.
#[derive(Debug)]
pub struct TransferHandle {
    /// The completion channel.
    rx: oneshot::Receiver<Result<()>>,
}

impl TransferHandle {
    /// Wait for the transfer to complete.
    pub async fn done(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(EvaError::Shutdown))
    }

    /// Return the transfer's outcome if it has completed, without
    /// blocking.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(done) => done,
            Err(_) => Some(Err(EvaError::Shutdown)),
        }
    }
}

/// Callback type invoked with `(peer, info, data)` when an incoming
/// transfer completes.
type ReceiveCallback = Box<dyn FnMut(PeerId, Vec<u8>, Vec<u8>) + Send>;

/// One node's EVA protocol state.
///
/// The instance is purely reactive: feed it received frames with
/// [`on_frame`](EvaProtocol::on_frame) and time with
/// [`tick`](EvaProtocol::tick), and transmit whatever frames come
/// back. All returned frames are addressed to the peer they concern.
pub struct EvaProtocol {
    /// Protocol tuning.
    settings: EvaSettings,
    /// Active incoming transfers, at most one per peer.
    incoming: HashMap<PeerId, IncomingTransfer>,
    /// Active outgoing transfers, at most one per peer.
    outgoing: HashMap<PeerId, OutgoingTransfer>,
    /// Invoked when an incoming transfer completes.
    on_receive: Option<ReceiveCallback>,
}

impl EvaProtocol {
    /// Construct a protocol instance with the given settings.
    pub fn new(settings: EvaSettings) -> Self {
        EvaProtocol {
            settings,
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            on_receive: None,
        }
    }

    /// Return the protocol settings.
    pub fn settings(&self) -> &EvaSettings {
        &self.settings
    }

    /// Return the number of active incoming transfers.
    pub fn n_incoming(&self) -> usize {
        self.incoming.len()
    }

    /// Return the number of active outgoing transfers.
    pub fn n_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    /// Register the callback invoked when an incoming transfer
    /// completes.
    pub fn register_receive_callback<F>(&mut self, f: F)
    where
        F: FnMut(PeerId, Vec<u8>, Vec<u8>) + Send + 'static,
    {
        self.on_receive = Some(Box::new(f));
    }

    /// Start sending `data` to `peer`.
    ///
    /// On success, returns a completion handle and the WRITE_REQUEST
    /// frame to transmit. Fails immediately if a transfer to this peer
    /// is already active, or the data exceeds the size limit.
    pub fn send_binary(
        &mut self,
        peer: PeerId,
        info: Vec<u8>,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<(TransferHandle, EvaFrame)> {
        if self.outgoing.contains_key(&peer) {
            return Err(EvaError::Busy);
        }
        if data.len() as u64 > self.settings.binary_size_limit {
            return Err(EvaError::Size {
                size: data.len() as u64,
                limit: self.settings.binary_size_limit,
            });
        }
        let nonce = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        let transfer = OutgoingTransfer::new(
            info,
            data,
            self.settings.block_size,
            nonce,
            peer,
            tx,
            now,
        );
        let request = EvaFrame::WriteRequest(transfer.write_request());
        self.outgoing.insert(peer, transfer);
        Ok((TransferHandle { rx }, request))
    }

    /// Cancel the outgoing transfer to `peer`, if any, returning the
    /// ERROR frame to transmit.
    pub fn cancel_send(&mut self, peer: PeerId, message: &str) -> Option<EvaFrame> {
        let mut transfer = self.outgoing.remove(&peer)?;
        transfer.resolve(Err(EvaError::Cancelled(message.into())));
        Some(EvaFrame::Error(ErrorFrame {
            nonce: transfer.nonce(),
            message: message.as_bytes().to_vec(),
        }))
    }

    /// Process one received frame from `peer`, returning the frames to
    /// send back.
    pub fn on_frame(&mut self, peer: PeerId, frame: EvaFrame, now: Instant) -> Vec<EvaFrame> {
        match frame {
            EvaFrame::WriteRequest(f) => self.on_write_request(peer, f, now),
            EvaFrame::Acknowledgement(f) => self.on_acknowledgement(peer, f, now),
            EvaFrame::Data(f) => self.on_data(peer, f, now),
            EvaFrame::Error(f) => self.on_error(peer, f),
            EvaFrame::Done(f) => self.on_done(peer, f),
            // `EvaFrame` is non_exhaustive for wire evolution; an
            // unknown frame is a protocol violation here.
            _ => {
                warn!("dropping unexpected EVA frame from {}", peer);
                Vec::new()
            }
        }
    }

    /// Handle a WRITE_REQUEST: open an incoming transfer and invite
    /// the first window.
    fn on_write_request(&mut self, peer: PeerId, f: WriteRequest, now: Instant) -> Vec<EvaFrame> {
        if let Some(existing) = self.incoming.get(&peer) {
            if existing.nonce() == f.nonce {
                // The peer retransmitted its announcement; our
                // acknowledgement was lost.
                return vec![EvaFrame::Acknowledgement(
                    existing.repeat_acknowledgement(self.settings.window_size),
                )];
            }
            warn!("refusing second incoming transfer from {}", peer);
            return vec![EvaFrame::Error(ErrorFrame {
                nonce: f.nonce,
                message: b"already busy with a transfer for this peer".to_vec(),
            })];
        }
        if f.data_size > self.settings.binary_size_limit {
            warn!(
                "refusing {}-byte transfer from {} (limit {})",
                f.data_size, peer, self.settings.binary_size_limit
            );
            return vec![EvaFrame::Error(ErrorFrame {
                nonce: f.nonce,
                message: b"data size exceeds limit".to_vec(),
            })];
        }
        let mut transfer = IncomingTransfer::new(f.info, f.data_size, f.nonce, peer, now);
        let ack = transfer.make_acknowledgement(self.settings.window_size);
        self.incoming.insert(peer, transfer);
        vec![EvaFrame::Acknowledgement(ack)]
    }

    /// Handle an ACKNOWLEDGEMENT for our outgoing transfer.
    fn on_acknowledgement(
        &mut self,
        peer: PeerId,
        f: Acknowledgement,
        now: Instant,
    ) -> Vec<EvaFrame> {
        let Some(transfer) = self.outgoing.get_mut(&peer) else {
            debug!("dropping acknowledgement from {} with no transfer", peer);
            return Vec::new();
        };
        if transfer.nonce() != f.nonce {
            debug!("dropping acknowledgement from {} with stale nonce", peer);
            return Vec::new();
        }
        match transfer.on_acknowledgement(f.number, f.window_size, now) {
            OutgoingOutcome::Send(blocks) => {
                blocks.into_iter().map(EvaFrame::Data).collect()
            }
            OutgoingOutcome::Finished => {
                let nonce = transfer.nonce();
                self.outgoing.remove(&peer);
                vec![EvaFrame::Done(Done { nonce })]
            }
        }
    }

    /// Handle a DATA block for our incoming transfer.
    fn on_data(&mut self, peer: PeerId, f: Data, now: Instant) -> Vec<EvaFrame> {
        let Some(transfer) = self.incoming.get_mut(&peer) else {
            debug!("dropping data from {} with no transfer", peer);
            return Vec::new();
        };
        if transfer.nonce() != f.nonce {
            debug!("dropping data from {} with stale nonce", peer);
            return Vec::new();
        }
        match transfer.on_data(f.block_index, f.payload, self.settings.window_size, now) {
            IncomingOutcome::Absorbed => Vec::new(),
            IncomingOutcome::Reply(ack) => vec![EvaFrame::Acknowledgement(ack)],
            IncomingOutcome::Finished { ack, data } => {
                let info = transfer.info().to_vec();
                self.incoming.remove(&peer);
                if let Some(cb) = self.on_receive.as_mut() {
                    cb(peer, info, data);
                }
                vec![EvaFrame::Acknowledgement(ack)]
            }
            IncomingOutcome::Overflow => {
                let nonce = transfer.nonce();
                warn!("incoming transfer from {} exceeded its announced size", peer);
                self.incoming.remove(&peer);
                vec![EvaFrame::Error(ErrorFrame {
                    nonce,
                    message: b"data size exceeded".to_vec(),
                })]
            }
        }
    }

    /// Handle an ERROR frame: the peer aborted a transfer.
    fn on_error(&mut self, peer: PeerId, f: ErrorFrame) -> Vec<EvaFrame> {
        let message = String::from_utf8_lossy(&f.message).into_owned();
        if let Some(mut transfer) = self.outgoing.remove(&peer) {
            if transfer.nonce() == f.nonce {
                warn!("peer {} aborted outgoing transfer: {}", peer, message);
                transfer.resolve(Err(EvaError::Remote(message)));
                return Vec::new();
            }
            // Wrong nonce: not ours to kill.
            self.outgoing.insert(peer, transfer);
        }
        if let Some(transfer) = self.incoming.get(&peer) {
            if transfer.nonce() == f.nonce {
                warn!("peer {} aborted incoming transfer: {}", peer, message);
                self.incoming.remove(&peer);
            }
        }
        Vec::new()
    }

    /// Handle a DONE frame. Completion already happened when we sent
    /// the terminal acknowledgement, so there is nothing left to do
    /// for a well-behaved peer.
    fn on_done(&mut self, peer: PeerId, f: Done) -> Vec<EvaFrame> {
        if self
            .incoming
            .get(&peer)
            .is_some_and(|t| t.nonce() == f.nonce)
        {
            debug!("dropping DONE from {} for unfinished transfer", peer);
        }
        Vec::new()
    }

    /// Advance protocol timers.
    ///
    /// Returns the frames to retransmit, addressed per peer. Transfers
    /// whose peer stayed quiet through every allowed attempt are
    /// failed and dropped.
    pub fn tick(&mut self, now: Instant) -> Vec<(PeerId, EvaFrame)> {
        let interval = self.settings.retransmit_interval;
        let attempts = self.settings.retransmit_attempts;
        let mut out = Vec::new();

        let mut dead_outgoing = Vec::new();
        for (peer, transfer) in self.outgoing.iter_mut() {
            if now.duration_since(transfer.updated()) < interval {
                continue;
            }
            if transfer.note_attempt(now) >= attempts {
                warn!("outgoing transfer to {} timed out", peer);
                transfer.resolve(Err(EvaError::Timeout));
                dead_outgoing.push(*peer);
                continue;
            }
            match transfer.repeat_window() {
                Some(blocks) => {
                    out.extend(blocks.into_iter().map(|b| (*peer, EvaFrame::Data(b))));
                }
                None => {
                    // No acknowledgement yet: re-announce.
                    out.push((*peer, EvaFrame::WriteRequest(transfer.write_request())));
                }
            }
        }
        for peer in dead_outgoing {
            self.outgoing.remove(&peer);
        }

        let mut dead_incoming = Vec::new();
        for (peer, transfer) in self.incoming.iter_mut() {
            if now.duration_since(transfer.updated()) < interval {
                continue;
            }
            if transfer.note_attempt(now) >= attempts {
                warn!("incoming transfer from {} timed out", peer);
                dead_incoming.push(*peer);
                continue;
            }
            out.push((
                *peer,
                EvaFrame::Acknowledgement(
                    transfer.repeat_acknowledgement(self.settings.window_size),
                ),
            ));
        }
        for peer in dead_incoming {
            self.incoming.remove(&peer);
        }

        out
    }

    /// Drop every active transfer. Outgoing completion handles resolve
    /// with a shutdown error.
    pub fn shutdown(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::{Arc, Mutex};

    /// A settings value matching the normal-packet scenario:
    /// ten-byte blocks, ten-block windows.
    fn small_settings() -> EvaSettings {
        EvaSettings {
            block_size: 10,
            window_size: 10,
            ..EvaSettings::default()
        }
    }

    /// Collector for completed incoming transfers.
    type Received = Arc<Mutex<Vec<(PeerId, Vec<u8>, Vec<u8>)>>>;

    /// Build a protocol that records completed transfers.
    fn receiving_protocol(settings: EvaSettings) -> (EvaProtocol, Received) {
        let mut p = EvaProtocol::new(settings);
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        p.register_receive_callback(move |peer, info, data| {
            sink.lock().unwrap().push((peer, info, data));
        });
        (p, received)
    }

    /// Relay frames between a sender and a receiver until both go
    /// quiet, starting from the sender's initial frame.
    fn pump(
        sender: &mut EvaProtocol,
        receiver: &mut EvaProtocol,
        sender_peer: PeerId,
        receiver_peer: PeerId,
        first: EvaFrame,
    ) {
        let now = Instant::now();
        // Frames in flight toward the receiver and toward the sender.
        let mut to_receiver = vec![first];
        let mut to_sender = Vec::new();
        for _ in 0..1000 {
            if to_receiver.is_empty() && to_sender.is_empty() {
                return;
            }
            for frame in std::mem::take(&mut to_receiver) {
                to_sender.extend(receiver.on_frame(sender_peer, frame, now));
            }
            for frame in std::mem::take(&mut to_sender) {
                to_receiver.extend(sender.on_frame(receiver_peer, frame, now));
            }
        }
        panic!("transfer did not converge");
    }

    #[test]
    fn normal_transfer() {
        let alice = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let (mut b, received) = receiving_protocol(small_settings());

        let payload: Vec<u8> = (0..100_u32).map(|i| i as u8).collect();
        let (mut handle, first) = a
            .send_binary(bob, b"test".to_vec(), payload.clone(), Instant::now())
            .unwrap();

        pump(&mut a, &mut b, alice, bob, first);

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, alice);
        assert_eq!(got[0].1, b"test".to_vec());
        assert_eq!(got[0].2, payload);
        assert_eq!(a.n_outgoing(), 0);
        assert_eq!(b.n_incoming(), 0);
        assert_eq!(handle.try_result(), Some(Ok(())));
    }

    #[test]
    fn empty_transfer() {
        let alice = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let (mut b, received) = receiving_protocol(small_settings());

        let (_handle, first) = a
            .send_binary(bob, b"nothing".to_vec(), Vec::new(), Instant::now())
            .unwrap();
        pump(&mut a, &mut b, alice, bob, first);

        assert_eq!(received.lock().unwrap()[0].2, Vec::<u8>::new());
    }

    #[test]
    fn second_send_is_busy() {
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let _ = a
            .send_binary(bob, b"one".to_vec(), vec![0; 10], Instant::now())
            .unwrap();
        assert_eq!(
            a.send_binary(bob, b"two".to_vec(), vec![0; 10], Instant::now())
                .err(),
            Some(EvaError::Busy)
        );
    }

    #[test]
    fn oversized_send_refused() {
        let bob = PeerId::new([2; 32]);
        let mut settings = small_settings();
        settings.binary_size_limit = 50;
        let mut a = EvaProtocol::new(settings);
        assert!(matches!(
            a.send_binary(bob, Vec::new(), vec![0; 51], Instant::now()),
            Err(EvaError::Size { size: 51, limit: 50 })
        ));
    }

    #[test]
    fn oversized_write_request_refused() {
        let alice = PeerId::new([1; 32]);
        let mut settings = small_settings();
        settings.binary_size_limit = 50;
        let mut b = EvaProtocol::new(settings);
        let replies = b.on_frame(
            alice,
            EvaFrame::WriteRequest(WriteRequest {
                data_size: 1000,
                nonce: 7,
                info: Vec::new(),
            }),
            Instant::now(),
        );
        assert!(matches!(replies[0], EvaFrame::Error(_)));
        assert_eq!(b.n_incoming(), 0);
    }

    #[test]
    fn stale_nonce_dropped() {
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let _ = a
            .send_binary(bob, b"x".to_vec(), vec![0; 30], Instant::now())
            .unwrap();

        let replies = a.on_frame(
            bob,
            EvaFrame::Acknowledgement(Acknowledgement {
                number: 0,
                window_size: 10,
                nonce: u64::MAX, // never the real nonce
            }),
            Instant::now(),
        );
        assert!(replies.is_empty());
        assert_eq!(a.n_outgoing(), 1);
    }

    #[test]
    fn retransmit_then_timeout() {
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let start = Instant::now();
        let (mut handle, _first) = a
            .send_binary(bob, b"x".to_vec(), vec![0; 30], start)
            .unwrap();

        // The first expiries re-announce the transfer...
        for i in 1..=2 {
            let frames = a.tick(start + Duration::from_secs(2 * i));
            assert_eq!(frames.len(), 1);
            assert!(matches!(frames[0].1, EvaFrame::WriteRequest(_)));
        }
        // ...and the expiry that reaches the attempt budget kills it.
        let frames = a.tick(start + Duration::from_secs(20));
        assert!(frames.is_empty());
        assert_eq!(a.n_outgoing(), 0);
        assert_eq!(handle.try_result(), Some(Err(EvaError::Timeout)));
    }

    #[test]
    fn remote_error_fails_transfer() {
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let (mut handle, first) = a
            .send_binary(bob, b"x".to_vec(), vec![0; 30], Instant::now())
            .unwrap();
        let nonce = first.nonce();
        let replies = a.on_frame(
            bob,
            EvaFrame::Error(ErrorFrame {
                nonce,
                message: b"no thanks".to_vec(),
            }),
            Instant::now(),
        );
        assert!(replies.is_empty());
        assert_eq!(
            handle.try_result(),
            Some(Err(EvaError::Remote("no thanks".into())))
        );
    }

    #[test]
    fn cancel_emits_error_frame() {
        let bob = PeerId::new([2; 32]);
        let mut a = EvaProtocol::new(small_settings());
        let (mut handle, _first) = a
            .send_binary(bob, b"x".to_vec(), vec![0; 30], Instant::now())
            .unwrap();
        let frame = a.cancel_send(bob, "shutting down").unwrap();
        assert!(matches!(frame, EvaFrame::Error(_)));
        assert_eq!(
            handle.try_result(),
            Some(Err(EvaError::Cancelled("shutting down".into())))
        );
        // A second cancel has nothing to do.
        assert!(a.cancel_send(bob, "again").is_none());
    }

    #[test]
    fn duplicate_write_request_reacked() {
        let alice = PeerId::new([1; 32]);
        let mut b = EvaProtocol::new(small_settings());
        let request = EvaFrame::WriteRequest(WriteRequest {
            data_size: 30,
            nonce: 5,
            info: Vec::new(),
        });
        let first = b.on_frame(alice, request.clone(), Instant::now());
        let second = b.on_frame(alice, request, Instant::now());
        assert_eq!(first, second);
        assert_eq!(b.n_incoming(), 1);
    }
}
