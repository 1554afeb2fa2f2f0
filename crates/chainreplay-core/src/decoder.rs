//! Log → params decoding.

use serde_json::{json, Value};

use crate::config::{EventMetadata, LogFilter};
use crate::error::IndexerError;
use crate::types::Log;

/// Turns a raw log into the `params` handed to user handlers.
pub trait EventDecoder: Send + Sync {
    fn decode(
        &self,
        filter: &LogFilter,
        event: &EventMetadata,
        log: &Log,
    ) -> Result<Value, IndexerError>;
}

/// Passes the raw topics and data through: `{ "topics": [...], "data": "0x…" }`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawLogDecoder;

impl EventDecoder for RawLogDecoder {
    fn decode(
        &self,
        _filter: &LogFilter,
        _event: &EventMetadata,
        log: &Log,
    ) -> Result<Value, IndexerError> {
        Ok(json!({
            "topics": log.topics,
            "data": log.data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_decoder_passes_through() {
        let log = Log {
            address: "0xc".into(),
            topics: vec!["0xddf2".into(), "0x01".into()],
            data: "0xff".into(),
            block_number: 1,
            block_hash: "0xb".into(),
            transaction_hash: "0xt".into(),
            transaction_index: 0,
            log_index: 0,
        };
        let meta = EventMetadata {
            safe_name: "Transfer".into(),
            signature: "Transfer(address,address,uint256)".into(),
        };
        let filter = LogFilter {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id: 1,
            addresses: vec![],
            topics: vec![],
            start_block: 0,
            end_block: None,
            events: Default::default(),
        };
        let params = RawLogDecoder.decode(&filter, &meta, &log).unwrap();
        assert_eq!(params["data"], "0xff");
        assert_eq!(params["topics"][1], "0x01");
    }
}
