//! Normalized chain records shared by the sync services, the stores, and
//! the handler pipeline.

use serde::{Deserialize, Serialize};

/// Numeric chain identifier (EIP-155).
pub type ChainId = u64;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block header, normalized from the provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Transaction ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_index: u32,
    pub from: String,
    pub to: Option<String>,
    /// Calldata (`0x…`).
    pub input: String,
    /// Value in wei, decimal string.
    pub value: String,
}

/// A block together with its full transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWithTransactions {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

impl BlockWithTransactions {
    /// Keep only the transactions referenced by `logs`.
    pub fn transactions_for(&self, logs: &[Log]) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|tx| logs.iter().any(|l| l.transaction_hash == tx.hash))
            .cloned()
            .collect()
    }
}

// ─── Log ──────────────────────────────────────────────────────────────────────

/// An event log as emitted by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: u32,
    /// Position of the log within its block. Unique per block.
    pub log_index: u32,
}

impl Log {
    /// Stable row id: `{blockHash}-{logIndex}`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.block_hash, self.log_index)
    }

    /// The event selector (`topic0`), if any.
    pub fn selector(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

// ─── LogEvent ─────────────────────────────────────────────────────────────────

/// The unit replayed to user handlers: a stored log matched against a filter ABI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub log_filter_name: String,
    pub chain_id: ChainId,
    /// Safe (deduplicated) event name, e.g. `"Transfer"`.
    pub event_name: String,
    pub selector: String,
    pub block: Block,
    pub transaction: Transaction,
    pub log: Log,
    /// Decoded event arguments.
    pub params: serde_json::Value,
}

impl LogEvent {
    /// `"{logFilterName}:{eventName}"`, used as the metrics / error label.
    pub fn label(&self) -> String {
        format!("{}:{}", self.log_filter_name, self.event_name)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
