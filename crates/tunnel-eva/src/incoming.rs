//! The receiving side of an EVA transfer.

use std::time::Instant;

use tunnel_cell::eva::Acknowledgement;
use tunnel_cell::PeerId;

use crate::window::TransferWindow;

/// What the protocol should do after feeding a DATA frame to an
/// incoming transfer.
#[derive(Debug)]
pub(crate) enum IncomingOutcome {
    /// The block was absorbed; nothing to send yet.
    Absorbed,
    /// The window finished: acknowledge and keep receiving.
    Reply(Acknowledgement),
    /// The final window finished: acknowledge, deliver, and forget the
    /// transfer.
    Finished {
        /// The terminal acknowledgement to send.
        ack: Acknowledgement,
        /// The complete received byte stream, in block-index order.
        data: Vec<u8>,
    },
    /// The peer sent more bytes than it announced; abort the transfer.
    Overflow,
}

/// State for one incoming transfer.
///
/// Created when a WRITE_REQUEST arrives, destroyed when the transfer
/// finishes, times out, or is aborted.
#[derive(Debug)]
pub struct IncomingTransfer {
    /// Opaque tag identifying the logical transfer.
    info: Vec<u8>,
    /// Total number of bytes the peer announced.
    data_size: u64,
    /// Uniqueness nonce of this transfer.
    nonce: u64,
    /// The peer sending to us.
    peer: PeerId,
    /// Consecutive unanswered retransmissions of our acknowledgement.
    attempt: u32,
    /// The current receive window, if one has been opened.
    window: Option<TransferWindow>,
    /// Blocks delivered so far, in order. `None` after `finish`.
    data_list: Option<Vec<Vec<u8>>>,
    /// Whether the zero-length EOF block has been seen.
    last_window: bool,
    /// Whether the transfer has completed.
    finished: bool,
    /// Total payload bytes accepted so far.
    bytes_received: u64,
    /// Last time this transfer made progress.
    updated: Instant,
}

impl IncomingTransfer {
    /// Construct state for a newly announced transfer.
    pub(crate) fn new(info: Vec<u8>, data_size: u64, nonce: u64, peer: PeerId, now: Instant) -> Self {
        IncomingTransfer {
            info,
            data_size,
            nonce,
            peer,
            attempt: 0,
            window: None,
            data_list: Some(Vec::new()),
            last_window: false,
            finished: false,
            bytes_received: 0,
            updated: now,
        }
    }

    /// Return the transfer's tag.
    pub fn info(&self) -> &[u8] {
        &self.info
    }

    /// Return the transfer's nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Return the peer sending to us.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Return true once the transfer has completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Return the current retransmission attempt count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return the last time this transfer made progress.
    pub(crate) fn updated(&self) -> Instant {
        self.updated
    }

    /// Note a retransmission attempt, returning the new count.
    pub(crate) fn note_attempt(&mut self, now: Instant) -> u32 {
        self.attempt += 1;
        self.updated = now;
        self.attempt
    }

    /// Process one DATA frame.
    ///
    /// Any arrival resets the retransmission counter and the liveness
    /// timer, even a duplicate: the peer is alive.
    pub(crate) fn on_data(
        &mut self,
        index: u32,
        payload: Vec<u8>,
        window_size: usize,
        now: Instant,
    ) -> IncomingOutcome {
        let index = index as usize;
        let is_final_packet = payload.is_empty();

        self.bytes_received += payload.len() as u64;
        if self.bytes_received > self.data_size {
            return IncomingOutcome::Overflow;
        }

        let window = self
            .window
            .get_or_insert_with(|| TransferWindow::new(0, window_size));
        if is_final_packet {
            self.last_window = true;
            window.resize_for_last_block(index);
        }
        window.add(index, payload);
        self.attempt = 0;
        self.updated = now;

        if window.is_finished() {
            let ack = self.make_acknowledgement(window_size);
            if self.last_window {
                let data = self.finish();
                return IncomingOutcome::Finished { ack, data };
            }
            return IncomingOutcome::Reply(ack);
        }
        IncomingOutcome::Absorbed
    }

    /// Drain the finished prefix of the current window into
    /// `data_list`, open the next window, and build the matching
    /// acknowledgement.
    ///
    /// The acknowledgement `number` and the new window's start are the
    /// same quantity: the count of blocks delivered so far.
    pub(crate) fn make_acknowledgement(&mut self, window_size: usize) -> Acknowledgement {
        if let (Some(window), Some(list)) = (self.window.as_mut(), self.data_list.as_mut()) {
            list.extend(window.consecutive_blocks());
        }
        let start = self.data_list.as_ref().map(Vec::len).unwrap_or(0);
        self.window = Some(TransferWindow::new(start, window_size));
        Acknowledgement {
            number: start as u32,
            window_size: window_size as u32,
            nonce: self.nonce,
        }
    }

    /// Rebuild the last acknowledgement without touching the window.
    ///
    /// Used when the sender has gone quiet and we re-request the
    /// window we are still waiting for.
    pub(crate) fn repeat_acknowledgement(&self, window_size: usize) -> Acknowledgement {
        Acknowledgement {
            number: self.window.as_ref().map(TransferWindow::start).unwrap_or(0) as u32,
            window_size: window_size as u32,
            nonce: self.nonce,
        }
    }

    /// Complete the transfer: concatenate the delivered blocks and
    /// release the buffers.
    fn finish(&mut self) -> Vec<u8> {
        let data = self.data_list.take().map(|blocks| blocks.concat()).unwrap_or_default();
        self.finished = true;
        data
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Window size used by the tests, matching the protocol default.
    const WINDOW: usize = 16;

    /// A transfer expecting 100 bytes.
    fn transfer() -> IncomingTransfer {
        IncomingTransfer::new(b"info".to_vec(), 100, 0, PeerId::new([7; 32]), Instant::now())
    }

    #[test]
    fn on_data_normal_packet() {
        let mut t = transfer();
        t.window = Some(TransferWindow::new(0, WINDOW));
        t.attempt = 2;

        let outcome = t.on_data(3, b"data".to_vec(), WINDOW, Instant::now());

        assert!(matches!(outcome, IncomingOutcome::Absorbed));
        assert_eq!(t.attempt, 0);
        assert!(!t.is_finished());
    }

    #[test]
    fn on_data_window_is_finished() {
        let mut t = transfer();
        t.window = Some(TransferWindow::new(0, 1));
        t.attempt = 2;

        let outcome = t.on_data(0, b"data".to_vec(), WINDOW, Instant::now());

        match outcome {
            IncomingOutcome::Reply(ack) => {
                assert_eq!(ack.number, 1);
                assert_eq!(ack.window_size, WINDOW as u32);
            }
            other => panic!("expected Reply, got {:?}", other),
        }
        assert_eq!(t.attempt, 0);
        assert!(!t.is_finished());
    }

    #[test]
    fn on_data_window_is_last_and_finished() {
        let mut t = transfer();
        t.window = Some(TransferWindow::new(0, 2));
        t.on_data(0, b"data".to_vec(), WINDOW, Instant::now());

        let outcome = t.on_data(1, Vec::new(), WINDOW, Instant::now());

        match outcome {
            IncomingOutcome::Finished { ack, data } => {
                // One real block plus the empty EOF block were delivered.
                assert_eq!(ack.number, 2);
                assert_eq!(data, b"data".to_vec());
            }
            other => panic!("expected Finished, got {:?}", other),
        }
        assert!(t.is_finished());
        assert!(t.data_list.is_none());
    }

    #[test]
    fn on_data_final_packet_resizes_window() {
        let mut t = transfer();
        t.window = Some(TransferWindow::new(0, 10));

        t.on_data(3, Vec::new(), WINDOW, Instant::now());

        assert!(t.last_window);
        assert_eq!(t.window.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn make_acknowledgement_no_window() {
        let mut t = transfer();
        assert!(t.window.is_none());

        let ack = t.make_acknowledgement(WINDOW);

        assert!(t.window.is_some());
        assert_eq!(ack.number, 0);
        assert_eq!(ack.window_size, WINDOW as u32);
    }

    #[test]
    fn make_acknowledgement_next_window() {
        // A 7-block window at start 10 with a 4-block finished prefix.
        let window_size = 7;
        let mut t = transfer();
        t.window = Some(TransferWindow::with_blocks(
            10,
            vec![
                Some(b"d".to_vec()),
                Some(b"a".to_vec()),
                Some(b"t".to_vec()),
                Some(b"a".to_vec()),
                None,
                None,
                None,
            ],
        ));

        let ack = t.make_acknowledgement(window_size);

        // The acknowledgement number and the new window start are both
        // the count of blocks delivered so far.
        assert_eq!(t.data_list.as_ref().unwrap().len(), 4);
        let window = t.window.as_ref().unwrap();
        assert_eq!(window.start(), 4);
        assert_eq!(window.processed(), 0);
        assert_eq!(window.len(), window_size);
        assert_eq!(ack.number, 4);
        assert_eq!(ack.window_size, window_size as u32);
    }

    #[test]
    fn overflow_detected() {
        let mut t = IncomingTransfer::new(b"info".to_vec(), 5, 0, PeerId::new([7; 32]), Instant::now());
        let outcome = t.on_data(0, b"too many bytes".to_vec(), WINDOW, Instant::now());
        assert!(matches!(outcome, IncomingOutcome::Overflow));
    }

    #[test]
    fn repeat_acknowledgement_preserves_window() {
        let mut t = transfer();
        t.make_acknowledgement(WINDOW);
        t.on_data(0, b"x".to_vec(), WINDOW, Instant::now());
        let ack = t.repeat_acknowledgement(WINDOW);
        assert_eq!(ack.number, 0);
        // The partially filled window was not reset.
        assert!(t.window.is_some());
    }
}
