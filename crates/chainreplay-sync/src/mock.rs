//! Scripted in-memory chain used by the sync and engine test suites.
//!
//! Blocks are addressed by `0x{tag}-{number}` hashes so a test can build a
//! canonical chain, fork it under a different tag, and still fetch the
//! orphaned blocks by hash.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use chainreplay_core::config::{EventMetadata, LogFilter};
use chainreplay_core::error::ProviderError;
use chainreplay_core::provider::{BlockTag, CallRequest, ChainProvider, LogRange, LogRequest};
use chainreplay_core::types::{Block, BlockWithTransactions, ChainId, Log, Transaction};

/// `Transfer(address,address,uint256)` selector.
pub const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// `Approval(address,address,uint256)` selector.
pub const APPROVAL: &str = "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925";
pub const TOKEN_ADDRESS: &str = "0x00000000000000000000000000000000000000aa";

pub fn block_hash(tag: &str, number: u64) -> String {
    format!("0x{tag}-{number}")
}

/// Filter named `Token` on chain 1 watching [`TOKEN_ADDRESS`] for Transfer
/// and Approval.
pub fn token_filter(start_block: u64) -> LogFilter {
    named_filter("Token", "mainnet", 1, TOKEN_ADDRESS, start_block)
}

pub fn named_filter(name: &str, network: &str, chain_id: ChainId, address: &str, start_block: u64) -> LogFilter {
    let mut events = BTreeMap::new();
    events.insert(
        TRANSFER.to_string(),
        EventMetadata {
            safe_name: "Transfer".into(),
            signature: "Transfer(address,address,uint256)".into(),
        },
    );
    events.insert(
        APPROVAL.to_string(),
        EventMetadata {
            safe_name: "Approval".into(),
            signature: "Approval(address,address,uint256)".into(),
        },
    );
    LogFilter {
        name: name.into(),
        network: network.into(),
        chain_id,
        addresses: vec![address.into()],
        topics: vec![],
        start_block,
        end_block: None,
        events,
    }
}

#[derive(Default)]
struct MockChain {
    /// Every block ever added, canonical or orphaned.
    blocks: HashMap<String, BlockWithTransactions>,
    logs: HashMap<String, Vec<Log>>,
    canonical: BTreeMap<u64, String>,
    failures: VecDeque<ProviderError>,
    max_log_range: Option<u64>,
    call_results: HashMap<(String, String), String>,
    log_calls: usize,
    block_calls: usize,
    eth_calls: usize,
}

/// A [`ChainProvider`] backed by a scripted chain.
pub struct MockProvider {
    chain_id: ChainId,
    genesis_timestamp: u64,
    block_time: u64,
    address: String,
    state: Mutex<MockChain>,
}

impl MockProvider {
    /// Chain 1, genesis at t=1000, 12 s blocks, logs emitted by [`TOKEN_ADDRESS`].
    pub fn new() -> Self {
        Self::with_chain(1, 1_000, 12)
    }

    pub fn with_chain(chain_id: ChainId, genesis_timestamp: u64, block_time: u64) -> Self {
        Self {
            chain_id,
            genesis_timestamp,
            block_time,
            address: TOKEN_ADDRESS.into(),
            state: Mutex::new(MockChain::default()),
        }
    }

    /// Address stamped on generated logs.
    pub fn emitting(mut self, address: &str) -> Self {
        self.address = address.into();
        self
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn timestamp_of(&self, number: u64) -> u64 {
        self.genesis_timestamp + number * self.block_time
    }

    /// Make `[from, to]` canonical under `tag`, replacing any canonical block
    /// at or above `from`. `logs_at(n)` lists the Transfer log indexes of
    /// block `n`; each log gets its own transaction.
    pub fn extend_canonical(&self, tag: &str, from: u64, to: u64, logs_at: impl Fn(u64) -> Vec<u32>) {
        let mut state = self.state.lock().unwrap();
        state.canonical.retain(|n, _| *n < from);
        for number in from..=to {
            let hash = block_hash(tag, number);
            let parent_hash = match number.checked_sub(1) {
                Some(parent) => state
                    .canonical
                    .get(&parent)
                    .cloned()
                    .unwrap_or_else(|| block_hash(tag, parent)),
                None => "0x0".to_string(),
            };
            let block = Block {
                number,
                hash: hash.clone(),
                parent_hash,
                timestamp: self.timestamp_of(number),
            };
            let logs: Vec<Log> = logs_at(number)
                .into_iter()
                .map(|log_index| self.transfer_log(&block, log_index))
                .collect();
            let transactions = logs
                .iter()
                .map(|log| Transaction {
                    hash: log.transaction_hash.clone(),
                    block_hash: hash.clone(),
                    block_number: number,
                    transaction_index: log.transaction_index,
                    from: "0x00000000000000000000000000000000000000f1".into(),
                    to: Some(self.address.clone()),
                    input: "0x".into(),
                    value: "0".into(),
                })
                .collect();
            state.blocks.insert(hash.clone(), BlockWithTransactions { block, transactions });
            state.logs.insert(hash.clone(), logs);
            state.canonical.insert(number, hash);
        }
    }

    fn transfer_log(&self, block: &Block, log_index: u32) -> Log {
        Log {
            address: self.address.clone(),
            topics: vec![
                TRANSFER.to_string(),
                format!("0x{:064x}", 0xf1),
                format!("0x{:064x}", 0xf2),
            ],
            data: format!("0x{:064x}", block.number * 100 + log_index as u64),
            block_number: block.number,
            block_hash: block.hash.clone(),
            transaction_hash: format!("{}-tx{log_index}", block.hash),
            transaction_index: log_index,
            log_index,
        }
    }

    /// Fail the next `times` provider calls with `err`.
    pub fn fail_next(&self, err: ProviderError, times: usize) {
        let mut state = self.state.lock().unwrap();
        state.failures.extend(std::iter::repeat(err).take(times));
    }

    /// Reject `eth_getLogs` ranges wider than `blocks` with a result-limit error.
    pub fn set_max_log_range(&self, blocks: u64) {
        self.state.lock().unwrap().max_log_range = Some(blocks);
    }

    pub fn set_call_result(&self, to: &str, data: &str, result: &str) {
        self.state
            .lock()
            .unwrap()
            .call_results
            .insert((to.to_lowercase(), data.to_string()), result.to_string());
    }

    pub fn log_calls(&self) -> usize {
        self.state.lock().unwrap().log_calls
    }

    pub fn block_calls(&self) -> usize {
        self.state.lock().unwrap().block_calls
    }

    pub fn eth_calls(&self) -> usize {
        self.state.lock().unwrap().eth_calls
    }

    pub fn canonical_block(&self, number: u64) -> Option<Block> {
        let state = self.state.lock().unwrap();
        let hash = state.canonical.get(&number)?;
        state.blocks.get(hash).map(|b| b.block.clone())
    }

    fn take_failure(state: &mut MockChain) -> Result<(), ProviderError> {
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn request_matches(request: &LogRequest, log: &Log) -> bool {
    let address_ok = request.addresses.is_empty()
        || request.addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address));
    let topics_ok = request.topics.iter().enumerate().all(|(i, position)| match position {
        None => true,
        Some(values) => log
            .topics
            .get(i)
            .map_or(false, |t| values.iter().any(|v| v.eq_ignore_ascii_case(t))),
    });
    address_ok && topics_ok
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state)?;
        state
            .canonical
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| ProviderError::NotFound("empty chain".into()))
    }

    async fn block_by_number(&self, tag: BlockTag) -> Result<BlockWithTransactions, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.block_calls += 1;
        Self::take_failure(&mut state)?;
        let hash = match tag {
            BlockTag::Latest => state.canonical.values().next_back(),
            BlockTag::Number(n) => state.canonical.get(&n),
        }
        .ok_or_else(|| ProviderError::NotFound(format!("block {tag:?}")))?;
        state
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(hash.clone()))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<BlockWithTransactions, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.block_calls += 1;
        Self::take_failure(&mut state)?;
        state
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(hash.to_string()))
    }

    async fn logs(&self, request: &LogRequest) -> Result<Vec<Log>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.log_calls += 1;
        Self::take_failure(&mut state)?;
        let hashes: Vec<String> = match &request.range {
            LogRange::Blocks { from, to } if from > to => vec![],
            LogRange::Blocks { from, to } => {
                if let Some(max) = state.max_log_range {
                    if to - from >= max {
                        return Err(ProviderError::TooManyResults(format!(
                            "query returned more than 10000 results for range [{from}, {to}]"
                        )));
                    }
                }
                state.canonical.range(*from..=*to).map(|(_, h)| h.clone()).collect()
            }
            LogRange::BlockHash(hash) => {
                if !state.blocks.contains_key(hash) {
                    return Err(ProviderError::NotFound(hash.clone()));
                }
                vec![hash.clone()]
            }
        };
        Ok(hashes
            .iter()
            .filter_map(|h| state.logs.get(h))
            .flatten()
            .filter(|log| request_matches(request, log))
            .cloned()
            .collect())
    }

    async fn call(&self, request: &CallRequest) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.eth_calls += 1;
        Self::take_failure(&mut state)?;
        state
            .call_results
            .get(&(request.to.to_lowercase(), request.data.clone()))
            .cloned()
            .ok_or_else(|| ProviderError::Rpc {
                code: 3,
                message: "execution reverted".into(),
            })
    }
}
