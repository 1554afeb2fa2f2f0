//! Event cursor: a position in the globally ordered event sequence.

use serde::{Deserialize, Serialize};

use crate::types::{Block, ChainId, Log};

/// Sort key of a matched event.
///
/// Events are ordered by block timestamp, then chain, then block number, then
/// log index. Within one chain this is `(block.number, log.index)` ascending.
/// The filter name breaks ties when one log matches several filters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp: u64,
    pub chain_id: ChainId,
    pub block_number: u64,
    pub log_index: u32,
    pub log_filter_name: String,
}

impl EventCursor {
    pub fn new(chain_id: ChainId, block: &Block, log: &Log, log_filter_name: &str) -> Self {
        Self {
            timestamp: block.timestamp,
            chain_id,
            block_number: block.number,
            log_index: log.log_index,
            log_filter_name: log_filter_name.to_string(),
        }
    }

    /// Returns `true` if `self` is strictly after `other` (or `other` is unset).
    pub fn is_after(&self, other: Option<&EventCursor>) -> bool {
        other.map_or(true, |o| self > o)
    }
}
