//! Chain data provider abstraction.
//!
//! The sync services and read-only contract calls talk to a chain only through
//! [`ChainProvider`]. Transport, authentication, and JSON-RPC encoding belong
//! to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LogFilter;
use crate::error::ProviderError;
use crate::types::{BlockWithTransactions, Log};

/// Which block to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

/// Block selector of an `eth_getLogs`-style request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRange {
    Blocks { from: u64, to: u64 },
    BlockHash(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    /// Contract addresses (empty = any).
    pub addresses: Vec<String>,
    /// Positional topic constraints, `None` = wildcard.
    pub topics: Vec<Option<Vec<String>>>,
    pub range: LogRange,
}

impl LogRequest {
    pub fn for_filter(filter: &LogFilter, range: LogRange) -> Self {
        Self {
            addresses: filter.addresses.clone(),
            topics: filter.topics.clone(),
            range,
        }
    }
}

/// Read-only `eth_call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub to: String,
    /// ABI-encoded calldata (`0x…`).
    pub data: String,
    pub block: BlockTag,
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Latest block number.
    async fn block_number(&self) -> Result<u64, ProviderError>;

    async fn block_by_number(&self, tag: BlockTag) -> Result<BlockWithTransactions, ProviderError>;

    async fn block_by_hash(&self, hash: &str) -> Result<BlockWithTransactions, ProviderError>;

    async fn logs(&self, request: &LogRequest) -> Result<Vec<Log>, ProviderError>;

    /// Returns the raw call result (`0x…`).
    async fn call(&self, request: &CallRequest) -> Result<String, ProviderError>;
}
