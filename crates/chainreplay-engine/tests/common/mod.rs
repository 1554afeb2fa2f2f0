//! Shared fixtures for the pipeline scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainreplay_core::config::{IndexerConfig, LogFilter, Network, SyncTuning};
use chainreplay_core::decoder::RawLogDecoder;
use chainreplay_core::handler::{handler_fn, HandlerFunctions};
use chainreplay_core::provider::ChainProvider;
use chainreplay_core::schema::{EntityDef, FieldDef, FieldKind, Schema};
use chainreplay_core::types::ChainId;
use chainreplay_engine::Pipeline;
use chainreplay_storage::{MemoryEventStore, MemoryUserStore};
use chainreplay_sync::mock::MockProvider;
use serde_json::json;

/// `(timestamp, chain_id, block_number, log_index)` of a handled event.
pub type Seen = Arc<Mutex<Vec<(u64, ChainId, u64, u32)>>>;

pub fn network(name: &str, chain_id: ChainId, finality_block_count: u64) -> Network {
    Network {
        name: name.into(),
        chain_id,
        rpc_url: format!("http://{name}.test"),
        polling_interval_ms: 10,
        finality_block_count,
    }
}

pub fn schema() -> Schema {
    let field = |name: &str, kind| FieldDef {
        name: name.into(),
        kind,
        optional: false,
    };
    Schema {
        entities: vec![EntityDef {
            name: "Transfer".into(),
            fields: vec![
                field("id", FieldKind::Id),
                field("chain", FieldKind::Int),
                field("block", FieldKind::Int),
            ],
        }],
    }
}

/// Entity id written for a transfer log.
pub fn transfer_id(chain_id: ChainId, block_hash: &str, log_index: u32) -> String {
    format!("{chain_id}-{block_hash}-{log_index}")
}

/// Records every Transfer of `filter` and writes a `Transfer` entity.
pub fn recording(handlers: HandlerFunctions, filter: &str, seen: Seen) -> HandlerFunctions {
    handlers.on_event(
        filter,
        "Transfer",
        handler_fn(move |event, ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push((
                    event.block.timestamp,
                    event.chain_id,
                    event.block.number,
                    event.log.log_index,
                ));
                ctx.entities
                    .create(
                        "Transfer",
                        &transfer_id(event.chain_id, &event.block.hash, event.log.log_index),
                        json!({ "chain": event.chain_id, "block": event.block.number }),
                    )
                    .await?;
                Ok(())
            }
        }),
    )
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub events: Arc<MemoryEventStore>,
    pub users: Arc<MemoryUserStore>,
}

pub fn harness(
    networks: Vec<Network>,
    log_filters: Vec<LogFilter>,
    tuning: SyncTuning,
    providers: Vec<Arc<MockProvider>>,
) -> Harness {
    harness_with(
        IndexerConfig {
            networks,
            log_filters,
            contracts: Vec::new(),
            tuning,
        },
        providers,
    )
}

pub fn harness_with(config: IndexerConfig, providers: Vec<Arc<MockProvider>>) -> Harness {
    let events = Arc::new(MemoryEventStore::new());
    let users = Arc::new(MemoryUserStore::new());
    let providers: HashMap<ChainId, Arc<dyn ChainProvider>> = providers
        .into_iter()
        .map(|p| (p.chain_id(), p as Arc<dyn ChainProvider>))
        .collect();
    let pipeline = Pipeline::new(
        config,
        providers,
        events.clone(),
        users.clone(),
        Arc::new(RawLogDecoder),
    )
    .unwrap();
    Harness {
        pipeline,
        events,
        users,
    }
}

/// Poll `check` every 10 ms for up to 10 s.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
