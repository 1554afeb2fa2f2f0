//! Common-ancestor search for realtime reorg resolution.
//!
//! Starting from a freshly fetched head, the search walks the remote chain
//! backward one parent at a time and compares each remote parent hash with
//! the locally tracked block at the same height. The first match is the
//! common ancestor. Blocks above the local head are gap fill and do not count
//! toward the depth bound; blocks at or below it do.

use crate::tracker::BlockTracker;
use crate::types::Block;

/// Outcome of feeding one remote block to [`AncestorSearch::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStep {
    /// The remote block's parent is tracked locally.
    Found { ancestor: Block },
    /// Fetch the parent (by hash) and feed it back in.
    NeedParent { hash: String, number: u64 },
    /// The search would cross the finalized anchor or the depth bound.
    Exceeded { searched_to: u64 },
}

/// Incremental common-ancestor search.
#[derive(Debug)]
pub struct AncestorSearch {
    max_depth: u64,
    depth: u64,
    /// Remote blocks seen so far, newest first.
    branch: Vec<Block>,
}

impl AncestorSearch {
    pub fn new(max_depth: u64) -> Self {
        Self {
            max_depth,
            depth: 0,
            branch: Vec::new(),
        }
    }

    /// Feed the next remote block (the head first, then successive parents).
    pub fn step(&mut self, remote: Block, tracker: &BlockTracker) -> SearchStep {
        let parent_number = match remote.number.checked_sub(1) {
            Some(n) => n,
            None => return SearchStep::Exceeded { searched_to: 0 },
        };
        let parent_hash = remote.parent_hash.clone();
        let head_number = tracker.head().map(|h| h.number);
        let at_or_below_head = head_number.map_or(false, |h| remote.number <= h);
        self.branch.push(remote);

        if let Some(local) = tracker.get(parent_number) {
            if local.hash == parent_hash {
                return SearchStep::Found {
                    ancestor: local.clone(),
                };
            }
        }

        if let Some(finalized) = tracker.finalized() {
            if parent_number <= finalized.number {
                return SearchStep::Exceeded {
                    searched_to: parent_number,
                };
            }
        }

        if at_or_below_head || head_number.map_or(false, |h| parent_number <= h) {
            self.depth += 1;
            if self.depth > self.max_depth {
                return SearchStep::Exceeded {
                    searched_to: parent_number,
                };
            }
        }

        SearchStep::NeedParent {
            hash: parent_hash,
            number: parent_number,
        }
    }

    /// Remote blocks above the ancestor, oldest first.
    pub fn into_branch(self) -> Vec<Block> {
        let mut branch = self.branch;
        branch.reverse();
        branch
    }
}

/// A resolved reorg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgResolution {
    pub common_ancestor: Block,
    /// Local blocks that are no longer canonical, most recent first.
    pub dropped: Vec<Block>,
    /// Canonical blocks above the ancestor, oldest first.
    pub new_branch: Vec<Block>,
}

impl ReorgResolution {
    /// Number of local blocks rolled back.
    pub fn depth(&self) -> u64 {
        self.dropped.len() as u64
    }
}

/// Local blocks above `ancestor`, most recent first.
pub fn dropped_blocks(tracker: &BlockTracker, ancestor: &Block) -> Vec<Block> {
    let Some(head) = tracker.head() else {
        return vec![];
    };
    (ancestor.number + 1..=head.number)
        .rev()
        .filter_map(|n| tracker.get(n).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(num: u64, hash: &str, parent: &str) -> Block {
        Block {
            number: num,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: num * 12,
        }
    }

    /// Finalized 100, local chain 101..=105 with hashes `0x{n}`.
    fn tracker() -> BlockTracker {
        let mut t = BlockTracker::new();
        t.anchor(b(100, "0x100", "0x99"));
        for n in 101..=105 {
            t.push(b(n, &format!("0x{n}"), &format!("0x{}", n - 1))).unwrap();
        }
        t
    }

    #[test]
    fn plain_extension_finds_head() {
        let t = tracker();
        let mut search = AncestorSearch::new(10);
        let step = search.step(b(106, "0x106", "0x105"), &t);
        assert_eq!(step, SearchStep::Found { ancestor: t.head().unwrap().clone() });
    }

    #[test]
    fn gap_fill_does_not_count_as_depth() {
        let t = tracker();
        let mut search = AncestorSearch::new(0);
        assert!(matches!(
            search.step(b(108, "0x108", "0x107"), &t),
            SearchStep::NeedParent { number: 107, .. }
        ));
        assert!(matches!(
            search.step(b(107, "0x107", "0x106"), &t),
            SearchStep::NeedParent { number: 106, .. }
        ));
        assert!(matches!(
            search.step(b(106, "0x106", "0x105"), &t),
            SearchStep::Found { .. }
        ));
        let branch = search.into_branch();
        assert_eq!(branch.iter().map(|b| b.number).collect::<Vec<_>>(), vec![106, 107, 108]);
    }

    #[test]
    fn finds_ancestor_three_deep() {
        let t = tracker();
        let mut search = AncestorSearch::new(10);
        // New branch forks after 102: 103' 104' 105' 106'
        let steps = [
            b(106, "0x106b", "0x105b"),
            b(105, "0x105b", "0x104b"),
            b(104, "0x104b", "0x103b"),
            b(103, "0x103b", "0x102"),
        ];
        let mut last = None;
        for block in steps {
            last = Some(search.step(block, &t));
        }
        match last.unwrap() {
            SearchStep::Found { ancestor } => assert_eq!(ancestor.number, 102),
            other => panic!("unexpected {other:?}"),
        }
        let dropped = dropped_blocks(&t, &b(102, "0x102", "0x101"));
        assert_eq!(dropped.iter().map(|b| b.number).collect::<Vec<_>>(), vec![105, 104, 103]);
    }

    #[test]
    fn depth_bound_exceeded() {
        let t = tracker();
        let mut search = AncestorSearch::new(1);
        assert!(matches!(
            search.step(b(105, "0x105b", "0x104b"), &t),
            SearchStep::NeedParent { .. }
        ));
        assert!(matches!(
            search.step(b(104, "0x104b", "0x103b"), &t),
            SearchStep::Exceeded { searched_to: 103 }
        ));
    }

    #[test]
    fn cannot_reorg_past_finalized_anchor() {
        let t = tracker();
        let mut search = AncestorSearch::new(100);
        assert!(matches!(
            search.step(b(101, "0x101b", "0x100b"), &t),
            SearchStep::Exceeded { searched_to: 100 }
        ));
    }
}
