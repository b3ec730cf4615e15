//! The receiver's sliding window of pending blocks.

/// A window of blocks the receiver is currently willing to accept.
///
/// The window covers the absolute block indexes
/// `[start, start + blocks.len())`. A slot is `None` until its block
/// arrives. The zero-length EOF block occupies a slot like any other
/// block, so that a finished window implies every block up to and
/// including EOF has been seen.
#[derive(Debug)]
pub(crate) struct TransferWindow {
    /// Absolute index of the first block in this window.
    start: usize,
    /// Number of leading blocks already drained by
    /// [`consecutive_blocks`](TransferWindow::consecutive_blocks).
    processed: usize,
    /// The block slots.
    blocks: Vec<Option<Vec<u8>>>,
}

impl TransferWindow {
    /// Construct a window of `size` empty slots starting at block
    /// index `start`.
    pub(crate) fn new(start: usize, size: usize) -> Self {
        TransferWindow {
            start,
            processed: 0,
            blocks: vec![None; size],
        }
    }

    /// Return the absolute index of the first block in this window.
    pub(crate) fn start(&self) -> usize {
        self.start
    }

    /// Return the number of slots in this window.
    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Return how many leading blocks have been drained so far.
    pub(crate) fn processed(&self) -> usize {
        self.processed
    }

    /// Store a received block.
    ///
    /// Blocks below `start` are duplicates of already-consumed data
    /// and are ignored; blocks past the end of the window are dropped
    /// (the next acknowledgement will ask for them again).
    pub(crate) fn add(&mut self, index: usize, block: Vec<u8>) {
        if index < self.start {
            return;
        }
        let slot = index - self.start;
        if slot >= self.blocks.len() {
            return;
        }
        if self.blocks[slot].is_none() {
            self.blocks[slot] = Some(block);
        }
    }

    /// Shrink (or grow) the window so that the block at absolute index
    /// `index` is its final slot.
    ///
    /// Called when the zero-length EOF block arrives: nothing past EOF
    /// will ever be sent, so the window must end exactly there for
    /// [`is_finished`](TransferWindow::is_finished) to become true.
    pub(crate) fn resize_for_last_block(&mut self, index: usize) {
        if index < self.start {
            return;
        }
        self.blocks.resize(index - self.start + 1, None);
    }

    /// Return true if every slot in the window is filled.
    pub(crate) fn is_finished(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    /// Drain the filled prefix of the window, in order.
    ///
    /// Advances `processed` past every drained slot; a later call
    /// continues where the previous one stopped.
    pub(crate) fn consecutive_blocks(&mut self) -> Vec<Vec<u8>> {
        let mut drained = Vec::new();
        while self.processed < self.blocks.len() {
            match self.blocks[self.processed].take() {
                Some(block) => {
                    drained.push(block);
                    self.processed += 1;
                }
                None => break,
            }
        }
        drained
    }

    /// Testing constructor: a window with explicit slot contents.
    #[cfg(test)]
    pub(crate) fn with_blocks(start: usize, blocks: Vec<Option<Vec<u8>>>) -> Self {
        TransferWindow {
            start,
            processed: 0,
            blocks,
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
    fn add_and_finish() {
        let mut w = TransferWindow::new(0, 3);
        assert!(!w.is_finished());
        w.add(0, b"a".to_vec());
        w.add(2, b"c".to_vec());
        assert!(!w.is_finished());
        w.add(1, b"b".to_vec());
        assert!(w.is_finished());
    }

    #[test]
    fn out_of_range_ignored() {
        let mut w = TransferWindow::new(10, 3);
        // Below the window: a duplicate of consumed data.
        w.add(9, b"old".to_vec());
        // Past the window: will be re-requested.
        w.add(13, b"future".to_vec());
        assert_eq!(w.consecutive_blocks(), Vec::<Vec<u8>>::new());
        w.add(10, b"x".to_vec());
        assert_eq!(w.consecutive_blocks(), vec![b"x".to_vec()]);
    }

    #[test]
    fn duplicate_block_kept_first() {
        let mut w = TransferWindow::new(0, 2);
        w.add(0, b"first".to_vec());
        w.add(0, b"second".to_vec());
        assert_eq!(w.consecutive_blocks(), vec![b"first".to_vec()]);
    }

    #[test]
    fn consecutive_blocks_resumes() {
        let mut w = TransferWindow::new(0, 4);
        w.add(0, b"a".to_vec());
        w.add(1, b"b".to_vec());
        w.add(3, b"d".to_vec());
        assert_eq!(w.consecutive_blocks(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(w.processed(), 2);
        w.add(2, b"c".to_vec());
        assert_eq!(w.consecutive_blocks(), vec![b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(w.processed(), 4);
    }

    #[test]
    fn resize_for_eof() {
        let mut w = TransferWindow::new(0, 10);
        w.resize_for_last_block(3);
        assert_eq!(w.len(), 4);
        w.add(3, Vec::new());
        assert!(!w.is_finished());
        w.add(0, b"a".to_vec());
        w.add(1, b"b".to_vec());
        w.add(2, b"c".to_vec());
        assert!(w.is_finished());
    }
}
