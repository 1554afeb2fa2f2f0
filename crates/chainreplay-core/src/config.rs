//! Static configuration: networks, log filters, contracts, and sync tuning.
//!
//! Everything here is built once at startup and never mutated afterwards.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::{ChainId, Log};

// ─── Network ──────────────────────────────────────────────────────────────────

/// One configured chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub chain_id: ChainId,
    pub rpc_url: String,
    /// Realtime poll interval.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Blocks behind the head after which a block is treated as final.
    #[serde(default = "default_finality_block_count")]
    pub finality_block_count: u64,
}

fn default_polling_interval_ms() -> u64 {
    1_000
}

fn default_finality_block_count() -> u64 {
    10
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// ABI metadata for one event a filter may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Name handlers are registered under. Overloaded events get a
    /// signature-qualified safe name.
    pub safe_name: String,
    /// Human-readable ABI signature, e.g. `Transfer(address,address,uint256)`.
    pub signature: String,
}

/// Describes which logs to fetch for a network and how to name them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub name: String,
    /// Name of the [`Network`] this filter belongs to.
    pub network: String,
    /// Filled in from the network during [`IndexerConfig::resolve`].
    #[serde(default)]
    pub chain_id: ChainId,
    /// Contract addresses (empty = any address).
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Topic constraints by position; `None` is a wildcard.
    #[serde(default)]
    pub topics: Vec<Option<Vec<String>>>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    /// Selector (`topic0`) → event metadata.
    #[serde(default)]
    pub events: BTreeMap<String, EventMetadata>,
}

impl LogFilter {
    /// Deterministic key identifying the fetch criteria of this filter.
    ///
    /// Two filters with identical chain, addresses, and topics share a key and
    /// therefore share one cached-range index.
    pub fn filter_key(&self) -> String {
        let addresses = if self.addresses.is_empty() {
            "*".to_string()
        } else {
            let mut addrs: Vec<String> = self.addresses.iter().map(|a| a.to_lowercase()).collect();
            addrs.sort();
            addrs.dedup();
            addrs.join("|")
        };
        let topics = if self.topics.is_empty() {
            "*".to_string()
        } else {
            self.topics
                .iter()
                .map(|position| match position {
                    None => "*".to_string(),
                    Some(values) => {
                        let mut values: Vec<String> =
                            values.iter().map(|t| t.to_lowercase()).collect();
                        values.sort();
                        values.join("|")
                    }
                })
                .collect::<Vec<_>>()
                .join("_")
        };
        format!("{}-{}-{}", self.chain_id, addresses, topics)
    }

    /// Returns `true` if `address` matches this filter.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if the log's topics satisfy every positional constraint.
    pub fn matches_topics(&self, topics: &[String]) -> bool {
        self.topics.iter().enumerate().all(|(i, position)| match position {
            None => true,
            Some(values) => topics
                .get(i)
                .map(|t| values.iter().any(|v| v.eq_ignore_ascii_case(t)))
                .unwrap_or(false),
        })
    }

    /// Returns `true` if `block_number` lies inside `[start_block, end_block]`.
    pub fn contains_block(&self, block_number: u64) -> bool {
        block_number >= self.start_block && self.end_block.map_or(true, |end| block_number <= end)
    }

    /// Full match: address, topics, and block range.
    pub fn matches(&self, log: &Log) -> bool {
        self.contains_block(log.block_number)
            && self.matches_address(&log.address)
            && self.matches_topics(&log.topics)
    }

    /// Look up event metadata by selector (case-insensitive).
    pub fn event_for_selector(&self, selector: &str) -> Option<&EventMetadata> {
        self.events
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(selector))
            .map(|(_, m)| m)
    }

    /// Look up the selector registered under a safe name.
    pub fn selector_for_name(&self, safe_name: &str) -> Option<&str> {
        self.events
            .iter()
            .find(|(_, m)| m.safe_name == safe_name)
            .map(|(s, _)| s.as_str())
    }

    /// Last block this filter wants, capped by `finalized`.
    pub fn last_block(&self, finalized: u64) -> u64 {
        self.end_block.map_or(finalized, |end| end.min(finalized))
    }
}

// ─── Contracts ────────────────────────────────────────────────────────────────

/// A contract handlers may call read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractConfig {
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub chain_id: ChainId,
    pub address: String,
}

// ─── SyncTuning ───────────────────────────────────────────────────────────────

/// Operational constants. Every field has a default suitable for public RPC
/// endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncTuning {
    /// Initial block window per `eth_getLogs` call.
    pub max_block_range: u64,
    /// Smallest window; a result-limit error at this size is fatal.
    pub min_block_range: u64,
    /// Maximum historical sub-ranges in flight per network.
    pub historical_concurrency: usize,
    /// Bound on the realtime common-ancestor search.
    pub max_reorg_depth: u64,
    /// Events per page served by the aggregator.
    pub event_page_size: usize,
    pub retry: RetryConfig,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            max_block_range: 2_000,
            min_block_range: 1,
            historical_concurrency: 10,
            max_reorg_depth: 256,
            event_page_size: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

// ─── IndexerConfig ────────────────────────────────────────────────────────────

/// The whole static configuration of an indexer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig {
    pub networks: Vec<Network>,
    #[serde(default)]
    pub log_filters: Vec<LogFilter>,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    #[serde(default)]
    pub tuning: SyncTuning,
}

impl IndexerConfig {
    /// Parse and resolve a JSON config document.
    pub fn from_json(raw: &str) -> Result<Self, IndexerError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| IndexerError::Config(format!("invalid config: {e}")))?;
        config.resolve()
    }

    /// Validate the config and fill in `chain_id` on filters and contracts.
    pub fn resolve(mut self) -> Result<Self, IndexerError> {
        self.validate()?;
        let chain_ids: BTreeMap<String, ChainId> = self
            .networks
            .iter()
            .map(|n| (n.name.clone(), n.chain_id))
            .collect();
        for filter in &mut self.log_filters {
            filter.chain_id = chain_ids[&filter.network];
        }
        for contract in &mut self.contracts {
            contract.chain_id = chain_ids[&contract.network];
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        let mut names = HashSet::new();
        let mut chain_ids = HashSet::new();
        for network in &self.networks {
            if network.rpc_url.trim().is_empty() {
                return Err(IndexerError::Config(format!(
                    "missing RPC URL for network \"{}\"",
                    network.name
                )));
            }
            if !names.insert(network.name.as_str()) {
                return Err(IndexerError::Config(format!(
                    "duplicate network name \"{}\"",
                    network.name
                )));
            }
            if !chain_ids.insert(network.chain_id) {
                return Err(IndexerError::Config(format!(
                    "duplicate chain id {}",
                    network.chain_id
                )));
            }
        }

        let mut filter_names = HashSet::new();
        for filter in &self.log_filters {
            if !filter_names.insert(filter.name.as_str()) {
                return Err(IndexerError::Config(format!(
                    "duplicate log filter name \"{}\"",
                    filter.name
                )));
            }
            if !names.contains(filter.network.as_str()) {
                return Err(IndexerError::Config(format!(
                    "log filter \"{}\" references unknown network \"{}\"",
                    filter.name, filter.network
                )));
            }
            if filter.events.is_empty() {
                return Err(IndexerError::Config(format!(
                    "log filter \"{}\" declares no events",
                    filter.name
                )));
            }
            if let Some(end) = filter.end_block {
                if end < filter.start_block {
                    return Err(IndexerError::Config(format!(
                        "log filter \"{}\" ends (block {end}) before it starts (block {})",
                        filter.name, filter.start_block
                    )));
                }
            }
        }

        for contract in &self.contracts {
            if !names.contains(contract.network.as_str()) {
                return Err(IndexerError::Config(format!(
                    "contract \"{}\" references unknown network \"{}\"",
                    contract.name, contract.network
                )));
            }
        }

        let tuning = &self.tuning;
        if tuning.min_block_range == 0 || tuning.max_block_range < tuning.min_block_range {
            return Err(IndexerError::Config(format!(
                "invalid block range window [{}, {}]",
                tuning.min_block_range, tuning.max_block_range
            )));
        }
        if tuning.historical_concurrency == 0 || tuning.event_page_size == 0 {
            return Err(IndexerError::Config(
                "historical_concurrency and event_page_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Filters that belong to `network`.
    pub fn filters_for(&self, network: &str) -> Vec<LogFilter> {
        self.log_filters
            .iter()
            .filter(|f| f.network == network)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> LogFilter {
        let mut events = BTreeMap::new();
        events.insert(
            "0xddf2".to_string(),
            EventMetadata {
                safe_name: "Transfer".into(),
                signature: "Transfer(address,address,uint256)".into(),
            },
        );
        LogFilter {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id: 1,
            addresses: vec!["0xAbC".into()],
            topics: vec![Some(vec!["0xDDF2".into()]), None],
            start_block: 100,
            end_block: None,
            events,
        }
    }

    fn log(address: &str, topics: &[&str], block_number: u64) -> Log {
        Log {
            address: address.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: "0x".into(),
            block_number,
            block_hash: "0xb".into(),
            transaction_hash: "0xt".into(),
            transaction_index: 0,
            log_index: 0,
        }
    }

    #[test]
    fn filter_key_is_order_and_case_insensitive() {
        let mut a = filter();
        a.addresses = vec!["0xB".into(), "0xa".into()];
        let mut b = filter();
        b.addresses = vec!["0xA".into(), "0xb".into()];
        assert_eq!(a.filter_key(), b.filter_key());
        assert_eq!(a.filter_key(), "1-0xa|0xb-0xddf2_*");
    }

    #[test]
    fn filter_matches_address_topics_and_range() {
        let f = filter();
        assert!(f.matches(&log("0xabc", &["0xddf2", "0x1"], 150)));
        assert!(!f.matches(&log("0xabc", &["0xddf2"], 50)));
        assert!(!f.matches(&log("0xdef", &["0xddf2"], 150)));
        assert!(!f.matches(&log("0xabc", &["0x8c5b"], 150)));
        assert!(!f.matches(&log("0xabc", &[], 150)));
    }

    #[test]
    fn resolve_fills_chain_ids() {
        let mut f = filter();
        f.chain_id = 0;
        let config = IndexerConfig {
            networks: vec![Network {
                name: "mainnet".into(),
                chain_id: 1,
                rpc_url: "http://localhost:8545".into(),
                polling_interval_ms: 1000,
                finality_block_count: 10,
            }],
            log_filters: vec![f],
            ..Default::default()
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.log_filters[0].chain_id, 1);
    }

    #[test]
    fn missing_rpc_url_is_config_error() {
        let config = IndexerConfig {
            networks: vec![Network {
                name: "mainnet".into(),
                chain_id: 1,
                rpc_url: "".into(),
                polling_interval_ms: 1000,
                finality_block_count: 10,
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, IndexerError::Config(msg) if msg.contains("missing RPC URL")));
    }

    #[test]
    fn unknown_network_rejected() {
        let config = IndexerConfig {
            networks: vec![],
            log_filters: vec![filter()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(IndexerError::Config(_))));
    }

    #[test]
    fn parses_json_with_defaults() {
        let raw = r#"{
            "networks": [{ "name": "mainnet", "chainId": 1, "rpcUrl": "http://node" }],
            "logFilters": [{
                "name": "Token",
                "network": "mainnet",
                "addresses": ["0xabc"],
                "startBlock": 10,
                "events": { "0xddf2": { "safeName": "Transfer", "signature": "Transfer(address,address,uint256)" } }
            }]
        }"#;
        let config = IndexerConfig::from_json(raw).unwrap();
        assert_eq!(config.networks[0].polling_interval_ms, 1_000);
        assert_eq!(config.networks[0].finality_block_count, 10);
        assert_eq!(config.log_filters[0].chain_id, 1);
        assert_eq!(config.tuning.max_reorg_depth, 256);
    }
}
