//! Block tracker: the realtime view of one chain: a finalized anchor block
//! followed by a window of unfinalized blocks, each extending the previous.

use std::collections::VecDeque;

use crate::types::Block;

/// Tracks the finalized anchor plus every unfinalized block above it.
///
/// When a new block arrives, the tracker checks whether its `parent_hash`
/// matches the hash of the current head. A mismatch means a reorg occurred.
#[derive(Debug, Default)]
pub struct BlockTracker {
    finalized: Option<Block>,
    /// Unfinalized blocks, oldest first.
    window: VecDeque<Block>,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the tracker to a single finalized block.
    pub fn anchor(&mut self, finalized: Block) {
        self.window.clear();
        self.finalized = Some(finalized);
    }

    /// Add a new block on top of the head.
    ///
    /// Returns `Err(depth)` with the distance back to the block's parent
    /// (window length if the parent is unknown) when the block does not
    /// extend the head.
    pub fn push(&mut self, block: Block) -> Result<(), u64> {
        if let Some(head) = self.head() {
            if !block.extends(head) {
                return Err(self.find_reorg_depth(&block));
            }
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Current chain head (most recently added block, or the anchor).
    pub fn head(&self) -> Option<&Block> {
        self.window.back().or(self.finalized.as_ref())
    }

    pub fn finalized(&self) -> Option<&Block> {
        self.finalized.as_ref()
    }

    /// Returns a block by number if it's the anchor or in the window.
    pub fn get(&self, number: u64) -> Option<&Block> {
        match &self.finalized {
            Some(f) if f.number == number => Some(f),
            _ => self.window.iter().find(|b| b.number == number),
        }
    }

    /// Number of unfinalized blocks.
    pub fn unfinalized_len(&self) -> usize {
        self.window.len()
    }

    /// Discard every unfinalized block above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    /// Promote the window up to and including `block_number` to finalized.
    ///
    /// Returns the new anchor, or `None` if nothing changed.
    pub fn finalize_through(&mut self, block_number: u64) -> Option<&Block> {
        let mut promoted = None;
        while let Some(front) = self.window.front() {
            if front.number > block_number {
                break;
            }
            promoted = self.window.pop_front();
        }
        if promoted.is_some() {
            self.finalized = promoted;
            self.finalized.as_ref()
        } else {
            None
        }
    }

    fn find_reorg_depth(&self, new_block: &Block) -> u64 {
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.hash == new_block.parent_hash {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        self.window.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number * 12,
        }
    }

    fn chain(tracker: &mut BlockTracker, from: u64, to: u64) {
        for i in from..=to {
            tracker
                .push(block(i, &format!("0x{i}"), &format!("0x{}", i - 1)))
                .unwrap();
        }
    }

    #[test]
    fn push_normal_chain() {
        let mut tracker = BlockTracker::new();
        tracker.anchor(block(99, "0x99", "0x98"));
        chain(&mut tracker, 100, 102);
        assert_eq!(tracker.head().unwrap().number, 102);
        assert_eq!(tracker.unfinalized_len(), 3);
        assert_eq!(tracker.get(99).unwrap().hash, "0x99");
    }

    #[test]
    fn push_detects_reorg() {
        let mut tracker = BlockTracker::new();
        tracker.anchor(block(99, "0x99", "0x98"));
        chain(&mut tracker, 100, 101);
        let result = tracker.push(block(102, "0xc2", "0xb-different"));
        assert_eq!(result, Err(2));
    }

    #[test]
    fn rewind_to() {
        let mut tracker = BlockTracker::new();
        tracker.anchor(block(99, "0x99", "0x98"));
        chain(&mut tracker, 100, 110);
        tracker.rewind_to(105);
        assert_eq!(tracker.head().unwrap().number, 105);
        tracker.rewind_to(10);
        assert_eq!(tracker.head().unwrap().number, 99);
    }

    #[test]
    fn finalize_moves_anchor() {
        let mut tracker = BlockTracker::new();
        tracker.anchor(block(99, "0x99", "0x98"));
        chain(&mut tracker, 100, 110);
        let anchor = tracker.finalize_through(104).unwrap().clone();
        assert_eq!(anchor.number, 104);
        assert_eq!(tracker.unfinalized_len(), 6);
        assert!(tracker.get(103).is_none());
        assert!(tracker.finalize_through(104).is_none());
    }
}
