//! Checkpoint algebra: per-chain delivery watermarks and the global read
//! frontier derived from them.
//!
//! A checkpoint is a block timestamp (unix seconds). For a chain, the
//! frontier is the historical checkpoint until historical sync completes and
//! the realtime checkpoint afterwards. The global checkpoint is the minimum
//! frontier across all chains: every configured chain has delivered all of its
//! events up to that timestamp.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ChainId;

/// Watermarks reported by one chain's sync services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheckpoints {
    pub historical_checkpoint: u64,
    pub historical_complete: bool,
    pub realtime_checkpoint: u64,
    pub finality_checkpoint: u64,
}

impl ChainCheckpoints {
    /// Timestamp up to which this chain has delivered every event.
    ///
    /// Once historical sync is complete, historical progress covers everything
    /// up to the finalized block and realtime covers the rest, so the larger of
    /// the two is safe.
    pub fn frontier(&self) -> u64 {
        if self.historical_complete {
            self.historical_checkpoint.max(self.realtime_checkpoint)
        } else {
            self.historical_checkpoint
        }
    }
}

/// Checkpoints for every configured chain.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTable {
    chains: BTreeMap<ChainId, ChainCheckpoints>,
}

impl CheckpointTable {
    pub fn new(chain_ids: impl IntoIterator<Item = ChainId>) -> Self {
        Self {
            chains: chain_ids
                .into_iter()
                .map(|id| (id, ChainCheckpoints::default()))
                .collect(),
        }
    }

    pub fn get(&self, chain_id: ChainId) -> Option<&ChainCheckpoints> {
        self.chains.get(&chain_id)
    }

    /// Mutable access; unknown chains are added on first use.
    pub fn entry(&mut self, chain_id: ChainId) -> &mut ChainCheckpoints {
        self.chains.entry(chain_id).or_default()
    }

    /// Minimum frontier across chains (0 when no chain is configured).
    pub fn global(&self) -> u64 {
        self.chains
            .values()
            .map(ChainCheckpoints::frontier)
            .min()
            .unwrap_or(0)
    }

    pub fn all_historical_complete(&self) -> bool {
        !self.chains.is_empty() && self.chains.values().all(|c| c.historical_complete)
    }

    /// Highest historical checkpoint across chains.
    pub fn max_historical(&self) -> u64 {
        self.chains
            .values()
            .map(|c| c.historical_checkpoint)
            .max()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChainId, &ChainCheckpoints)> {
        self.chains.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_switches_on_completion() {
        let mut c = ChainCheckpoints {
            historical_checkpoint: 100,
            realtime_checkpoint: 130,
            ..Default::default()
        };
        assert_eq!(c.frontier(), 100);
        c.historical_complete = true;
        assert_eq!(c.frontier(), 130);
        c.realtime_checkpoint = 0;
        assert_eq!(c.frontier(), 100);
    }

    #[test]
    fn global_is_min_across_chains() {
        let mut table = CheckpointTable::new([1, 2]);
        table.entry(1).historical_checkpoint = 100;
        table.entry(1).historical_complete = true;
        table.entry(2).historical_checkpoint = 50;
        assert_eq!(table.global(), 50);
        assert!(!table.all_historical_complete());

        table.entry(2).historical_complete = true;
        table.entry(1).realtime_checkpoint = 110;
        table.entry(2).realtime_checkpoint = 120;
        assert_eq!(table.global(), 110);
        assert!(table.all_historical_complete());
        assert_eq!(table.max_historical(), 100);
    }

    #[test]
    fn empty_table_has_zero_checkpoint() {
        assert_eq!(CheckpointTable::default().global(), 0);
        assert!(!CheckpointTable::default().all_historical_complete());
    }
}
