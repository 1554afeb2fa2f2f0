//! The context handed to user handlers: entity access stamped with the
//! current event timestamp, and cached read-only contract calls.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::ContractConfig;
use crate::error::IndexerError;
use crate::provider::{BlockTag, CallRequest, ChainProvider};
use crate::schema::{EntityInstance, FindManyQuery};
use crate::store::{ContractReadKey, ContractReadResult, EventStore, UserStore};
use crate::types::{ChainId, LogEvent};

/// Shared dependencies from which per-task contexts are built.
#[derive(Clone)]
pub struct HandlerEnv {
    pub user_store: Arc<dyn UserStore>,
    pub event_store: Arc<dyn EventStore>,
    pub providers: Arc<HashMap<ChainId, Arc<dyn ChainProvider>>>,
    pub contracts: Arc<Vec<ContractConfig>>,
}

impl HandlerEnv {
    /// Context for the setup task: writes are stamped 0, contract reads go
    /// to the latest block and bypass the cache.
    pub fn setup_context(&self) -> HandlerContext {
        HandlerContext {
            entities: Entities::new(self.user_store.clone(), 0),
            contracts: self.read_only_contracts(None),
            chain_id: None,
            block_number: None,
            timestamp: 0,
        }
    }

    pub fn event_context(&self, event: &LogEvent) -> HandlerContext {
        HandlerContext {
            entities: Entities::new(self.user_store.clone(), event.block.timestamp),
            contracts: self.read_only_contracts(Some((event.chain_id, event.block.number))),
            chain_id: Some(event.chain_id),
            block_number: Some(event.block.number),
            timestamp: event.block.timestamp,
        }
    }

    fn read_only_contracts(&self, at: Option<(ChainId, u64)>) -> ReadOnlyContracts {
        ReadOnlyContracts {
            providers: self.providers.clone(),
            event_store: self.event_store.clone(),
            contracts: self.contracts.clone(),
            at,
        }
    }
}

#[derive(Clone)]
pub struct HandlerContext {
    pub entities: Entities,
    pub contracts: ReadOnlyContracts,
    /// `None` during setup.
    pub chain_id: Option<ChainId>,
    pub block_number: Option<u64>,
    pub timestamp: u64,
}

// ─── Entities ─────────────────────────────────────────────────────────────────

/// User store facade bound to one event timestamp.
#[derive(Clone)]
pub struct Entities {
    store: Arc<dyn UserStore>,
    timestamp: u64,
}

impl Entities {
    pub fn new(store: Arc<dyn UserStore>, timestamp: u64) -> Self {
        Self { store, timestamp }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub async fn find_unique(&self, model: &str, id: &str) -> Result<Option<EntityInstance>, IndexerError> {
        self.store.find_unique(model, id, Some(self.timestamp)).await
    }

    pub async fn find_many(
        &self,
        model: &str,
        mut query: FindManyQuery,
    ) -> Result<Vec<EntityInstance>, IndexerError> {
        query.check_limits()?;
        query.timestamp.get_or_insert(self.timestamp);
        self.store.find_many(model, &query).await
    }

    pub async fn find_derived(
        &self,
        model: &str,
        id: &str,
        field: &str,
    ) -> Result<Vec<EntityInstance>, IndexerError> {
        self.store
            .find_derived(model, id, field, Some(self.timestamp))
            .await
    }

    pub async fn create(&self, model: &str, id: &str, data: Value) -> Result<EntityInstance, IndexerError> {
        self.store
            .create(model, id, self.timestamp, into_instance(data)?)
            .await
    }

    pub async fn update(&self, model: &str, id: &str, data: Value) -> Result<EntityInstance, IndexerError> {
        self.store
            .update(model, id, self.timestamp, into_instance(data)?)
            .await
    }

    pub async fn upsert(
        &self,
        model: &str,
        id: &str,
        create: Value,
        update: Value,
    ) -> Result<EntityInstance, IndexerError> {
        self.store
            .upsert(model, id, self.timestamp, into_instance(create)?, into_instance(update)?)
            .await
    }

    pub async fn delete(&self, model: &str, id: &str) -> Result<bool, IndexerError> {
        self.store.delete(model, id, self.timestamp).await
    }
}

fn into_instance(data: Value) -> Result<EntityInstance, IndexerError> {
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(EntityInstance::new()),
        other => Err(IndexerError::Other(format!(
            "entity data must be a JSON object, got {other}"
        ))),
    }
}

// ─── ReadOnlyContracts ────────────────────────────────────────────────────────

/// `eth_call` access to configured contracts at the current event's block.
///
/// Reads at a fixed block are memoized in the event store; reads at the
/// latest block (setup, or a contract on another chain) are not.
#[derive(Clone)]
pub struct ReadOnlyContracts {
    providers: Arc<HashMap<ChainId, Arc<dyn ChainProvider>>>,
    event_store: Arc<dyn EventStore>,
    contracts: Arc<Vec<ContractConfig>>,
    at: Option<(ChainId, u64)>,
}

impl ReadOnlyContracts {
    pub async fn call(&self, contract: &str, data: &str) -> Result<String, IndexerError> {
        let config = self
            .contracts
            .iter()
            .find(|c| c.name == contract)
            .ok_or_else(|| IndexerError::Other(format!("unknown contract \"{contract}\"")))?;
        let provider = self.providers.get(&config.chain_id).ok_or_else(|| {
            IndexerError::Config(format!("no provider for chain {}", config.chain_id))
        })?;

        let block_number = match self.at {
            Some((chain_id, number)) if chain_id == config.chain_id => Some(number),
            _ => None,
        };

        let Some(block_number) = block_number else {
            let request = CallRequest {
                to: config.address.clone(),
                data: data.to_string(),
                block: BlockTag::Latest,
            };
            return provider
                .call(&request)
                .await
                .map_err(|e| IndexerError::provider(config.chain_id, e));
        };

        let key = ContractReadKey {
            address: config.address.to_lowercase(),
            block_number,
            chain_id: config.chain_id,
            data: data.to_lowercase(),
        };
        if let Some(cached) = self.event_store.get_contract_read_result(&key).await? {
            return Ok(cached);
        }

        let request = CallRequest {
            to: config.address.clone(),
            data: data.to_string(),
            block: BlockTag::Number(block_number),
        };
        let result = provider
            .call(&request)
            .await
            .map_err(|e| IndexerError::provider(config.chain_id, e))?;
        self.event_store
            .insert_contract_read_result(ContractReadResult {
                key,
                result: result.clone(),
                finalized: false,
            })
            .await?;
        Ok(result)
    }
}
