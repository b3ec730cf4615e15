//! The sending side of an EVA transfer.

use std::time::Instant;

use futures::channel::oneshot;
use tunnel_cell::eva::{Data, WriteRequest};
use tunnel_cell::PeerId;

use crate::{EvaError, Result};

/// What the protocol should do after feeding an ACKNOWLEDGEMENT frame
/// to an outgoing transfer.
#[derive(Debug)]
pub(crate) enum OutgoingOutcome {
    /// Transmit these blocks.
    Send(Vec<Data>),
    /// The terminal acknowledgement arrived: the transfer succeeded.
    Finished,
}

/// State for one outgoing transfer.
///
/// Created by a local send request, destroyed when the terminal
/// acknowledgement arrives, the peer goes quiet for too long, or the
/// transfer is cancelled.
#[derive(Debug)]
pub struct OutgoingTransfer {
    /// Opaque tag identifying the logical transfer.
    info: Vec<u8>,
    /// The byte stream being sent.
    data: Vec<u8>,
    /// Block size this transfer was split with.
    block_size: usize,
    /// Number of non-empty blocks in `data`. The zero-length EOF
    /// block has index `block_count`.
    block_count: u32,
    /// Uniqueness nonce of this transfer.
    nonce: u64,
    /// The peer we are sending to.
    peer: PeerId,
    /// Consecutive expiries of the retransmit interval without an
    /// acknowledgement.
    attempt: u32,
    /// The last acknowledgement received, as `(number, window_size)`.
    last_ack: Option<(u32, u32)>,
    /// Last time this transfer made progress.
    updated: Instant,
    /// Completion channel, consumed exactly once.
    on_complete: Option<oneshot::Sender<Result<()>>>,
}

impl OutgoingTransfer {
    /// Construct state for a new transfer of `data`, reporting
    /// completion on `on_complete`.
    pub(crate) fn new(
        info: Vec<u8>,
        data: Vec<u8>,
        block_size: usize,
        nonce: u64,
        peer: PeerId,
        on_complete: oneshot::Sender<Result<()>>,
        now: Instant,
    ) -> Self {
        let block_count = data.len().div_ceil(block_size) as u32;
        OutgoingTransfer {
            info,
            data,
            block_size,
            block_count,
            nonce,
            peer,
            attempt: 0,
            last_ack: None,
            updated: now,
            on_complete: Some(on_complete),
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

    /// Return the peer we are sending to.
    pub fn peer(&self) -> PeerId {
        self.peer
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

    /// Build the WRITE_REQUEST announcing this transfer.
    pub(crate) fn write_request(&self) -> WriteRequest {
        WriteRequest {
            data_size: self.data.len() as u64,
            nonce: self.nonce,
            info: self.info.clone(),
        }
    }

    /// Process one ACKNOWLEDGEMENT frame.
    ///
    /// Any acknowledgement resets the retransmission counter: the
    /// receiver is alive, whether or not it advanced.
    pub(crate) fn on_acknowledgement(
        &mut self,
        number: u32,
        window_size: u32,
        now: Instant,
    ) -> OutgoingOutcome {
        self.attempt = 0;
        self.updated = now;
        self.last_ack = Some((number, window_size));
        if number > self.block_count {
            self.resolve(Ok(()));
            return OutgoingOutcome::Finished;
        }
        OutgoingOutcome::Send(self.window_frames(number, window_size))
    }

    /// Rebuild the DATA frames for the window the receiver last asked
    /// for. Used for retransmission.
    pub(crate) fn repeat_window(&self) -> Option<Vec<Data>> {
        self.last_ack
            .map(|(number, window_size)| self.window_frames(number, window_size))
    }

    /// Build the DATA frames for blocks `[number, number + window_size)`,
    /// stopping at the zero-length EOF block.
    fn window_frames(&self, number: u32, window_size: u32) -> Vec<Data> {
        let mut frames = Vec::new();
        for index in number..number.saturating_add(window_size) {
            if index < self.block_count {
                let lo = index as usize * self.block_size;
                let hi = (lo + self.block_size).min(self.data.len());
                frames.push(Data {
                    block_index: index,
                    nonce: self.nonce,
                    payload: self.data[lo..hi].to_vec(),
                });
            } else if index == self.block_count {
                // EOF marker.
                frames.push(Data {
                    block_index: index,
                    nonce: self.nonce,
                    payload: Vec::new(),
                });
            } else {
                break;
            }
        }
        frames
    }

    /// Resolve the completion channel. A second call is a no-op: the
    /// channel fires at most once.
    pub(crate) fn resolve(&mut self, result: Result<()>) {
        if let Some(tx) = self.on_complete.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for OutgoingTransfer {
    fn drop(&mut self) {
        // A transfer dropped without an explicit outcome (e.g. at
        // protocol shutdown) still owes its caller an answer.
        self.resolve(Err(EvaError::Shutdown));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Build a transfer plus its completion receiver.
    fn transfer(len: usize, block_size: usize) -> (OutgoingTransfer, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let t = OutgoingTransfer::new(
            b"info".to_vec(),
            data,
            block_size,
            99,
            PeerId::new([3; 32]),
            tx,
            Instant::now(),
        );
        (t, rx)
    }

    #[test]
    fn write_request_announces_size() {
        let (t, _rx) = transfer(100, 10);
        let req = t.write_request();
        assert_eq!(req.data_size, 100);
        assert_eq!(req.nonce, 99);
        assert_eq!(req.info, b"info".to_vec());
    }

    #[test]
    fn window_frames_with_eof() {
        let (mut t, _rx) = transfer(25, 10);
        // Blocks: 0..=1 full, 2 partial (5 bytes), EOF at 3.
        match t.on_acknowledgement(0, 16, Instant::now()) {
            OutgoingOutcome::Send(frames) => {
                assert_eq!(frames.len(), 4);
                assert_eq!(frames[0].payload.len(), 10);
                assert_eq!(frames[2].payload.len(), 5);
                assert_eq!(frames[3].payload.len(), 0);
                assert_eq!(frames[3].block_index, 3);
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn terminal_ack_finishes_once() {
        let (mut t, mut rx) = transfer(25, 10);
        // 3 blocks + EOF delivered: the receiver acknowledges block 4.
        assert!(matches!(
            t.on_acknowledgement(4, 16, Instant::now()),
            OutgoingOutcome::Finished
        ));
        assert_eq!(rx.try_recv().unwrap(), Some(Ok(())));
        // Resolving again changes nothing.
        t.resolve(Err(EvaError::Timeout));
    }

    #[test]
    fn ack_resets_attempt() {
        let (mut t, _rx) = transfer(25, 10);
        t.note_attempt(Instant::now());
        t.note_attempt(Instant::now());
        assert_eq!(t.attempt(), 2);
        let _ = t.on_acknowledgement(0, 4, Instant::now());
        assert_eq!(t.attempt(), 0);
    }

    #[test]
    fn empty_transfer_is_just_eof() {
        let (mut t, _rx) = transfer(0, 10);
        match t.on_acknowledgement(0, 16, Instant::now()) {
            OutgoingOutcome::Send(frames) => {
                assert_eq!(frames.len(), 1);
                assert!(frames[0].payload.is_empty());
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }
}
