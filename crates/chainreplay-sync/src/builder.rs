//! Fluent builders for networks, log filters, and whole configs.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainreplay_sync::builder::{ConfigBuilder, LogFilterBuilder, NetworkBuilder};
//!
//! let config = ConfigBuilder::new()
//!     .network(
//!         NetworkBuilder::new("mainnet", 1)
//!             .rpc_url("https://eth.llamarpc.com")
//!             .finality_block_count(12)
//!             .build(),
//!     )
//!     .log_filter(
//!         LogFilterBuilder::new("UsdcToken", "mainnet")
//!             .address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")
//!             .start_block(19_000_000)
//!             .event(
//!                 "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
//!                 "Transfer",
//!                 "Transfer(address,address,uint256)",
//!             )
//!             .build(),
//!     )
//!     .build()
//!     .unwrap();
//! ```

use std::collections::BTreeMap;

use chainreplay_core::config::{ContractConfig, EventMetadata, IndexerConfig, LogFilter, Network, SyncTuning};
use chainreplay_core::error::IndexerError;
use chainreplay_core::types::ChainId;

/// Fluent builder for [`Network`].
pub struct NetworkBuilder {
    network: Network,
}

impl NetworkBuilder {
    pub fn new(name: impl Into<String>, chain_id: ChainId) -> Self {
        Self {
            network: Network {
                name: name.into(),
                chain_id,
                rpc_url: String::new(),
                polling_interval_ms: 1_000,
                finality_block_count: 10,
            },
        }
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.network.rpc_url = url.into();
        self
    }

    /// Realtime poll interval in milliseconds.
    pub fn polling_interval_ms(mut self, ms: u64) -> Self {
        self.network.polling_interval_ms = ms;
        self
    }

    /// Blocks behind the head before a block counts as final.
    pub fn finality_block_count(mut self, blocks: u64) -> Self {
        self.network.finality_block_count = blocks;
        self
    }

    pub fn build(self) -> Network {
        self.network
    }
}

/// Fluent builder for [`LogFilter`]. The chain id is filled in when the
/// filter goes through [`ConfigBuilder::build`].
pub struct LogFilterBuilder {
    filter: LogFilter,
}

impl LogFilterBuilder {
    pub fn new(name: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            filter: LogFilter {
                name: name.into(),
                network: network.into(),
                chain_id: 0,
                addresses: Vec::new(),
                topics: Vec::new(),
                start_block: 0,
                end_block: None,
                events: BTreeMap::new(),
            },
        }
    }

    /// Add a contract address. No addresses means any address.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.filter.addresses.push(address.into());
        self
    }

    /// Constrain topic `position` to one of `values`.
    pub fn topic(mut self, position: usize, values: &[&str]) -> Self {
        if self.filter.topics.len() <= position {
            self.filter.topics.resize(position + 1, None);
        }
        self.filter.topics[position] = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn start_block(mut self, block: u64) -> Self {
        self.filter.start_block = block;
        self
    }

    /// Stop the filter at `block` (inclusive).
    pub fn end_block(mut self, block: u64) -> Self {
        self.filter.end_block = Some(block);
        self
    }

    /// Register an ABI event by selector.
    pub fn event(mut self, selector: &str, safe_name: &str, signature: &str) -> Self {
        self.filter.events.insert(
            selector.to_string(),
            EventMetadata {
                safe_name: safe_name.into(),
                signature: signature.into(),
            },
        );
        self
    }

    pub fn build(self) -> LogFilter {
        self.filter
    }
}

/// Assembles and resolves an [`IndexerConfig`].
#[derive(Default)]
pub struct ConfigBuilder {
    config: IndexerConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(mut self, network: Network) -> Self {
        self.config.networks.push(network);
        self
    }

    pub fn log_filter(mut self, filter: LogFilter) -> Self {
        self.config.log_filters.push(filter);
        self
    }

    /// A contract handlers may call read-only.
    pub fn contract(mut self, name: impl Into<String>, network: impl Into<String>, address: impl Into<String>) -> Self {
        self.config.contracts.push(ContractConfig {
            name: name.into(),
            network: network.into(),
            chain_id: 0,
            address: address.into(),
        });
        self
    }

    pub fn tuning(mut self, tuning: SyncTuning) -> Self {
        self.config.tuning = tuning;
        self
    }

    /// Validate and resolve chain ids.
    pub fn build(self) -> Result<IndexerConfig, IndexerError> {
        self.config.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_defaults() {
        let network = NetworkBuilder::new("mainnet", 1).build();
        assert_eq!(network.polling_interval_ms, 1_000);
        assert_eq!(network.finality_block_count, 10);
        assert!(network.rpc_url.is_empty());
    }

    #[test]
    fn filter_topics_pad_wildcards() {
        let filter = LogFilterBuilder::new("Pool", "mainnet")
            .topic(2, &["0xabc"])
            .build();
        assert_eq!(filter.topics, vec![None, None, Some(vec!["0xabc".to_string()])]);
    }

    #[test]
    fn config_builder_resolves_chain_ids() {
        let config = ConfigBuilder::new()
            .network(NetworkBuilder::new("base", 8453).rpc_url("http://node").build())
            .log_filter(
                LogFilterBuilder::new("Token", "base")
                    .address("0xabc")
                    .start_block(100)
                    .end_block(200)
                    .event("0xddf2", "Transfer", "Transfer(address,address,uint256)")
                    .build(),
            )
            .contract("Token", "base", "0xabc")
            .build()
            .unwrap();

        assert_eq!(config.log_filters[0].chain_id, 8453);
        assert_eq!(config.contracts[0].chain_id, 8453);
        assert_eq!(config.log_filters[0].end_block, Some(200));
    }

    #[test]
    fn config_builder_validates() {
        let err = ConfigBuilder::new()
            .network(NetworkBuilder::new("base", 8453).build())
            .build()
            .unwrap_err();
        assert!(matches!(err, IndexerError::Config(msg) if msg.contains("missing RPC URL")));
    }
}
