//! In-memory storage backends.
//!
//! [`MemoryEventStore`] keeps blocks, transactions, logs, cached ranges, and
//! contract reads in RAM. [`MemoryUserStore`] keeps timestamp-versioned
//! entities. Useful for testing and short-lived indexers that don't need
//! persistence.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use chainreplay_core::cached_range::{merge_ranges, starting_range_end, CachedRange};
use chainreplay_core::cursor::EventCursor;
use chainreplay_core::error::IndexerError;
use chainreplay_core::schema::{EntityInstance, FieldKind, FindManyQuery, OrderDirection, Schema};
use chainreplay_core::store::{
    paginate, ContractReadKey, ContractReadResult, EventStore, LogEventQuery, LogFilterRange,
    MergedRange, RawEventPage, StoredLog, UserStore,
};
use chainreplay_core::types::{Block, ChainId, Log, Transaction};

// ─── Event store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Row<T> {
    value: T,
    block_number: u64,
    finalized: bool,
}

#[derive(Default)]
struct EventTables {
    blocks: HashMap<(ChainId, String), Row<Block>>,
    transactions: HashMap<(ChainId, String), Row<Transaction>>,
    logs: BTreeMap<(ChainId, String), Row<Log>>,
    cached_ranges: HashMap<String, Vec<CachedRange>>,
    contract_reads: HashMap<ContractReadKey, Row<String>>,
    deletions: Vec<(ChainId, u64)>,
    /// Page reads left before one fails.
    page_fault: Option<usize>,
}

/// In-memory event store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryEventStore {
    tables: Mutex<EventTables>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_count(&self) -> usize {
        self.tables.lock().unwrap().logs.len()
    }

    pub fn block_count(&self) -> usize {
        self.tables.lock().unwrap().blocks.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables.lock().unwrap().transactions.len()
    }

    /// Stored block with this number on `chain_id`, with its finality flag.
    pub fn block(&self, chain_id: ChainId, number: u64) -> Option<(Block, bool)> {
        self.tables
            .lock()
            .unwrap()
            .blocks
            .iter()
            .find(|((c, _), row)| *c == chain_id && row.block_number == number)
            .map(|(_, row)| (row.value.clone(), row.finalized))
    }

    /// Fail one page read after `successful` more reads go through.
    pub fn fail_page_read_after(&self, successful: usize) {
        self.tables.lock().unwrap().page_fault = Some(successful);
    }

    /// Every `delete_unfinalized_data` call so far, as `(chain_id, from_block)`.
    pub fn deletions(&self) -> Vec<(ChainId, u64)> {
        self.tables.lock().unwrap().deletions.clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn migrate_up(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    async fn migrate_down(&self) -> Result<(), IndexerError> {
        *self.tables.lock().unwrap() = EventTables::default();
        Ok(())
    }

    async fn insert_finalized_logs(&self, chain_id: ChainId, logs: &[Log]) -> Result<(), IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        for log in logs {
            tables.logs.insert(
                (chain_id, log.id()),
                Row {
                    value: log.clone(),
                    block_number: log.block_number,
                    finalized: true,
                },
            );
        }
        Ok(())
    }

    async fn insert_finalized_block(
        &self,
        chain_id: ChainId,
        block: &Block,
        transactions: &[Transaction],
        range: &LogFilterRange,
    ) -> Result<(), IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        tables.blocks.insert(
            (chain_id, block.hash.clone()),
            Row {
                value: block.clone(),
                block_number: block.number,
                finalized: true,
            },
        );
        for tx in transactions {
            tables.transactions.insert(
                (chain_id, tx.hash.clone()),
                Row {
                    value: tx.clone(),
                    block_number: tx.block_number,
                    finalized: true,
                },
            );
        }
        if range.block_number_to_cache_from <= block.number {
            tables
                .cached_ranges
                .entry(range.log_filter_key.clone())
                .or_default()
                .push(CachedRange {
                    filter_key: range.log_filter_key.clone(),
                    start_block: range.block_number_to_cache_from,
                    end_block: block.number,
                    end_block_timestamp: block.timestamp,
                });
        }
        Ok(())
    }

    async fn merge_log_filter_cached_ranges(
        &self,
        log_filter_key: &str,
        start_block: u64,
    ) -> Result<MergedRange, IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        let ranges = tables
            .cached_ranges
            .remove(log_filter_key)
            .unwrap_or_default();
        let merged = merge_ranges(ranges);
        let starting_range_end_timestamp = starting_range_end(&merged, start_block)
            .map_or(0, |r| r.end_block_timestamp);
        tables
            .cached_ranges
            .insert(log_filter_key.to_string(), merged);
        Ok(MergedRange {
            starting_range_end_timestamp,
        })
    }

    async fn get_log_filter_cached_ranges(
        &self,
        log_filter_key: &str,
    ) -> Result<Vec<CachedRange>, IndexerError> {
        let tables = self.tables.lock().unwrap();
        let mut ranges = tables
            .cached_ranges
            .get(log_filter_key)
            .cloned()
            .unwrap_or_default();
        ranges.sort_by_key(|r| r.start_block);
        Ok(ranges)
    }

    async fn insert_unfinalized_block(
        &self,
        chain_id: ChainId,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<(), IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        tables.blocks.insert(
            (chain_id, block.hash.clone()),
            Row {
                value: block.clone(),
                block_number: block.number,
                finalized: false,
            },
        );
        for tx in transactions {
            tables.transactions.insert(
                (chain_id, tx.hash.clone()),
                Row {
                    value: tx.clone(),
                    block_number: tx.block_number,
                    finalized: false,
                },
            );
        }
        for log in logs {
            tables.logs.insert(
                (chain_id, log.id()),
                Row {
                    value: log.clone(),
                    block_number: log.block_number,
                    finalized: false,
                },
            );
        }
        Ok(())
    }

    async fn delete_unfinalized_data(
        &self,
        chain_id: ChainId,
        from_block_number: u64,
    ) -> Result<(), IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        let doomed = |c: &ChainId, finalized: bool, number: u64| {
            *c == chain_id && !finalized && number >= from_block_number
        };
        tables
            .blocks
            .retain(|(c, _), row| !doomed(c, row.finalized, row.block_number));
        tables
            .transactions
            .retain(|(c, _), row| !doomed(c, row.finalized, row.block_number));
        tables
            .logs
            .retain(|(c, _), row| !doomed(c, row.finalized, row.block_number));
        tables
            .contract_reads
            .retain(|key, row| !doomed(&key.chain_id, row.finalized, row.block_number));
        tables.deletions.push((chain_id, from_block_number));
        debug!(chain_id, from_block_number, "deleted unfinalized data");
        Ok(())
    }

    async fn finalize_data(&self, chain_id: ChainId, to_block_number: u64) -> Result<(), IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        let tables = &mut *tables;
        let promote = |c: ChainId, row_number: u64| c == chain_id && row_number <= to_block_number;
        for ((c, _), row) in tables.blocks.iter_mut() {
            if promote(*c, row.block_number) {
                row.finalized = true;
            }
        }
        for ((c, _), row) in tables.transactions.iter_mut() {
            if promote(*c, row.block_number) {
                row.finalized = true;
            }
        }
        for ((c, _), row) in tables.logs.iter_mut() {
            if promote(*c, row.block_number) {
                row.finalized = true;
            }
        }
        for (key, row) in tables.contract_reads.iter_mut() {
            if promote(key.chain_id, row.block_number) {
                row.finalized = true;
            }
        }
        Ok(())
    }

    async fn insert_contract_read_result(&self, result: ContractReadResult) -> Result<(), IndexerError> {
        let block_number = result.key.block_number;
        self.tables.lock().unwrap().contract_reads.insert(
            result.key,
            Row {
                value: result.result,
                block_number,
                finalized: result.finalized,
            },
        );
        Ok(())
    }

    async fn get_contract_read_result(
        &self,
        key: &ContractReadKey,
    ) -> Result<Option<String>, IndexerError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .contract_reads
            .get(key)
            .map(|row| row.value.clone()))
    }

    async fn get_log_events_page(
        &self,
        query: &LogEventQuery,
        after: Option<&EventCursor>,
    ) -> Result<RawEventPage, IndexerError> {
        let mut guard = self.tables.lock().unwrap();
        match guard.page_fault {
            Some(0) => {
                guard.page_fault = None;
                return Err(IndexerError::Storage("page read failed".into()));
            }
            Some(n) => guard.page_fault = Some(n - 1),
            None => {}
        }
        let tables: &EventTables = &guard;
        let rows = tables.logs.iter().filter_map(|((chain_id, _), row)| {
            let log = &row.value;
            let block = tables.blocks.get(&(*chain_id, log.block_hash.clone()))?;
            let tx = tables
                .transactions
                .get(&(*chain_id, log.transaction_hash.clone()))?;
            Some(StoredLog {
                chain_id: *chain_id,
                block: block.value.clone(),
                transaction: tx.value.clone(),
                log: log.clone(),
            })
        });
        Ok(paginate(rows, query, after))
    }
}

// ─── User store ───────────────────────────────────────────────────────────────

/// One version of an entity, visible for timestamps in `[from, to)`.
#[derive(Debug, Clone)]
struct Version {
    data: EntityInstance,
    from: u64,
    to: Option<u64>,
}

impl Version {
    fn visible_at(&self, timestamp: Option<u64>) -> bool {
        match timestamp {
            None => self.to.is_none(),
            Some(t) => self.from <= t && self.to.map_or(true, |to| t < to),
        }
    }
}

#[derive(Default)]
struct UserTables {
    schema: Option<Schema>,
    /// model → id → versions, oldest first
    entities: HashMap<String, BTreeMap<String, Vec<Version>>>,
}

impl UserTables {
    fn model(&self, model: &str) -> Result<&BTreeMap<String, Vec<Version>>, IndexerError> {
        self.entities
            .get(model)
            .ok_or_else(|| IndexerError::Storage(format!("unknown entity \"{model}\"")))
    }

    fn model_mut(&mut self, model: &str) -> Result<&mut BTreeMap<String, Vec<Version>>, IndexerError> {
        self.entities
            .get_mut(model)
            .ok_or_else(|| IndexerError::Storage(format!("unknown entity \"{model}\"")))
    }
}

/// In-memory, timestamp-versioned entity store.
#[derive(Default)]
pub struct MemoryUserStore {
    tables: Mutex<UserTables>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored versions of `model` (live and historical).
    pub fn version_count(&self, model: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .entities
            .get(model)
            .map_or(0, |rows| rows.values().map(Vec::len).sum())
    }

    fn write(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        build: impl FnOnce(Option<&EntityInstance>) -> Result<EntityInstance, IndexerError>,
    ) -> Result<EntityInstance, IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.model_mut(model)?;
        let versions = rows.entry(id.to_string()).or_default();

        if let Some(last) = versions.last() {
            if timestamp < last.from {
                return Err(IndexerError::Storage(format!(
                    "write to {model} \"{id}\" at {timestamp} precedes existing version at {}",
                    last.from
                )));
            }
        }
        let current = versions.last().filter(|v| v.to.is_none()).map(|v| &v.data);
        let mut data = match build(current) {
            Ok(data) => data,
            Err(err) => {
                if versions.is_empty() {
                    rows.remove(id);
                }
                return Err(err);
            }
        };
        data.insert("id".into(), Value::String(id.to_string()));

        match versions.last_mut() {
            Some(last) if last.from == timestamp && last.to.is_none() => last.data = data.clone(),
            Some(last) => {
                if last.to.is_none() {
                    last.to = Some(timestamp);
                }
                versions.push(Version {
                    data: data.clone(),
                    from: timestamp,
                    to: None,
                });
            }
            None => versions.push(Version {
                data: data.clone(),
                from: timestamp,
                to: None,
            }),
        }
        Ok(data)
    }
}

fn merge_into(mut base: EntityInstance, patch: EntityInstance) -> EntityInstance {
    for (k, v) in patch {
        base.insert(k, v);
    }
    base
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn reload(&self, schema: &Schema) -> Result<(), IndexerError> {
        schema.validate()?;
        let mut tables = self.tables.lock().unwrap();
        tables.entities = schema
            .entities
            .iter()
            .map(|e| (e.name.clone(), BTreeMap::new()))
            .collect();
        tables.schema = Some(schema.clone());
        debug!(entities = schema.entities.len(), "user store reloaded");
        Ok(())
    }

    async fn revert(&self, safe_timestamp: u64) -> Result<(), IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        for rows in tables.entities.values_mut() {
            for versions in rows.values_mut() {
                versions.retain(|v| v.from <= safe_timestamp);
                if let Some(last) = versions.last_mut() {
                    if last.to.map_or(false, |to| to > safe_timestamp) {
                        last.to = None;
                    }
                }
            }
            rows.retain(|_, versions| !versions.is_empty());
        }
        debug!(safe_timestamp, "user store reverted");
        Ok(())
    }

    async fn teardown(&self) -> Result<(), IndexerError> {
        *self.tables.lock().unwrap() = UserTables::default();
        Ok(())
    }

    async fn find_unique(
        &self,
        model: &str,
        id: &str,
        timestamp: Option<u64>,
    ) -> Result<Option<EntityInstance>, IndexerError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.model(model)?.get(id).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|v| v.visible_at(timestamp))
                .map(|v| v.data.clone())
        }))
    }

    async fn find_many(
        &self,
        model: &str,
        query: &FindManyQuery,
    ) -> Result<Vec<EntityInstance>, IndexerError> {
        query.check_limits()?;
        let tables = self.tables.lock().unwrap();
        let mut matches: Vec<EntityInstance> = tables
            .model(model)?
            .values()
            .filter_map(|versions| {
                versions
                    .iter()
                    .rev()
                    .find(|v| v.visible_at(query.timestamp))
            })
            .map(|v| v.data.clone())
            .filter(|data| query.matches(data))
            .collect();

        if let Some((field, direction)) = &query.order_by {
            matches.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match direction {
                    OrderDirection::Asc => ord,
                    OrderDirection::Desc => ord.reverse(),
                }
            });
        }
        Ok(matches
            .into_iter()
            .skip(query.skip)
            .take(query.first)
            .collect())
    }

    async fn find_derived(
        &self,
        model: &str,
        id: &str,
        field: &str,
        _timestamp: Option<u64>,
    ) -> Result<Vec<EntityInstance>, IndexerError> {
        let (child, fk) = {
            let tables = self.tables.lock().unwrap();
            let def = tables
                .schema
                .as_ref()
                .and_then(|s| s.entity(model))
                .and_then(|e| e.field(field))
                .ok_or_else(|| IndexerError::Storage(format!("unknown field \"{model}.{field}\"")))?;
            match &def.kind {
                FieldKind::Derived { entity, field } => (entity.clone(), field.clone()),
                _ => {
                    return Err(IndexerError::Storage(format!(
                        "field \"{model}.{field}\" is not derived"
                    )))
                }
            }
        };
        // Children are read at the latest version regardless of the
        // parent's read timestamp.
        let query = FindManyQuery::default()
            .where_eq(&fk, id)
            .first(chainreplay_core::schema::MAX_FIRST);
        self.find_many(&child, &query).await
    }

    async fn create(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        data: EntityInstance,
    ) -> Result<EntityInstance, IndexerError> {
        self.write(model, id, timestamp, |current| match current {
            Some(_) => Err(IndexerError::Storage(format!(
                "{model} with id \"{id}\" already exists"
            ))),
            None => Ok(data),
        })
    }

    async fn update(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        data: EntityInstance,
    ) -> Result<EntityInstance, IndexerError> {
        self.write(model, id, timestamp, |current| match current {
            Some(existing) => Ok(merge_into(existing.clone(), data)),
            None => Err(IndexerError::Storage(format!(
                "{model} with id \"{id}\" not found"
            ))),
        })
    }

    async fn upsert(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        create: EntityInstance,
        update: EntityInstance,
    ) -> Result<EntityInstance, IndexerError> {
        self.write(model, id, timestamp, |current| {
            Ok(match current {
                Some(existing) => merge_into(existing.clone(), update),
                None => create,
            })
        })
    }

    async fn delete(&self, model: &str, id: &str, timestamp: u64) -> Result<bool, IndexerError> {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.model_mut(model)?;
        let Some(versions) = rows.get_mut(id) else {
            return Ok(false);
        };
        match versions.last_mut() {
            Some(last) if last.to.is_none() => {
                if last.from == timestamp {
                    versions.pop();
                    if versions.is_empty() {
                        rows.remove(id);
                    }
                } else {
                    last.to = Some(timestamp);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
