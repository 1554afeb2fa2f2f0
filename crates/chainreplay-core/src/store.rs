//! Store traits: the event store written by the sync services and the
//! versioned user store written by handlers.
//!
//! Both are consumed as trait objects (`Arc<dyn EventStore>`,
//! `Arc<dyn UserStore>`). Implementations are expected to make each call
//! atomic; the pipeline serializes logical operations on top.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cached_range::CachedRange;
use crate::config::LogFilter;
use crate::cursor::EventCursor;
use crate::error::IndexerError;
use crate::schema::{EntityInstance, FindManyQuery, Schema};
use crate::types::{Block, ChainId, Log, Transaction};

// ─── Event store types ────────────────────────────────────────────────────────

/// Cached-range update recorded together with a finalized block: the span
/// `[block_number_to_cache_from, block.number]` is now fully fetched for
/// `log_filter_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilterRange {
    pub log_filter_key: String,
    pub block_number_to_cache_from: u64,
}

/// Result of merging a filter's cached ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRange {
    /// End timestamp of the merged range containing the filter's start
    /// block, 0 when no such range exists yet.
    pub starting_range_end_timestamp: u64,
}

/// Key of a memoized contract read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractReadKey {
    pub address: String,
    pub block_number: u64,
    pub chain_id: ChainId,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractReadResult {
    pub key: ContractReadKey,
    pub result: String,
    pub finalized: bool,
}

/// One filter of a log event query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEventFilter {
    pub filter: LogFilter,
    /// Selectors returned as events. Every selector in `filter.events` is
    /// still counted in page metadata.
    pub include_event_selectors: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEventQuery {
    pub from_timestamp: u64,
    pub to_timestamp: u64,
    pub filters: Vec<LogEventFilter>,
    pub page_size: usize,
}

/// A matched log with its block and transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogEvent {
    pub log_filter_name: String,
    pub chain_id: ChainId,
    pub selector: String,
    pub cursor: EventCursor,
    pub block: Block,
    pub transaction: Transaction,
    pub log: Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCount {
    pub log_filter_name: String,
    pub selector: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    /// Every event with a timestamp at or below this value has been returned
    /// by this page or an earlier one.
    pub page_ends_at_timestamp: u64,
    pub counts: Vec<EventCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEventPage {
    pub events: Vec<RawLogEvent>,
    pub metadata: PageMetadata,
    /// Position to continue from, `None` on the last page.
    pub next_cursor: Option<EventCursor>,
}

/// A stored log joined with its block and transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLog {
    pub chain_id: ChainId,
    pub block: Block,
    pub transaction: Transaction,
    pub log: Log,
}

// ─── EventStore ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn migrate_up(&self) -> Result<(), IndexerError>;

    async fn migrate_down(&self) -> Result<(), IndexerError>;

    /// Idempotent: re-inserting a log with the same id is a no-op.
    async fn insert_finalized_logs(&self, chain_id: ChainId, logs: &[Log]) -> Result<(), IndexerError>;

    /// Insert a finalized block and its transactions, and record
    /// `[range.block_number_to_cache_from, block.number]` as cached.
    async fn insert_finalized_block(
        &self,
        chain_id: ChainId,
        block: &Block,
        transactions: &[Transaction],
        range: &LogFilterRange,
    ) -> Result<(), IndexerError>;

    /// Collapse the filter's cached ranges and report contiguous progress
    /// from `start_block`.
    async fn merge_log_filter_cached_ranges(
        &self,
        log_filter_key: &str,
        start_block: u64,
    ) -> Result<MergedRange, IndexerError>;

    async fn get_log_filter_cached_ranges(
        &self,
        log_filter_key: &str,
    ) -> Result<Vec<CachedRange>, IndexerError>;

    async fn insert_unfinalized_block(
        &self,
        chain_id: ChainId,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<(), IndexerError>;

    /// Delete unfinalized blocks, transactions, logs, and contract reads at
    /// or above `from_block_number`.
    async fn delete_unfinalized_data(
        &self,
        chain_id: ChainId,
        from_block_number: u64,
    ) -> Result<(), IndexerError>;

    /// Mark everything at or below `to_block_number` finalized.
    async fn finalize_data(&self, chain_id: ChainId, to_block_number: u64) -> Result<(), IndexerError>;

    async fn insert_contract_read_result(&self, result: ContractReadResult) -> Result<(), IndexerError>;

    async fn get_contract_read_result(
        &self,
        key: &ContractReadKey,
    ) -> Result<Option<String>, IndexerError>;

    /// One page of matched events strictly after `after`, in cursor order.
    async fn get_log_events_page(
        &self,
        query: &LogEventQuery,
        after: Option<&EventCursor>,
    ) -> Result<RawEventPage, IndexerError>;
}

/// First timestamp a page after `after` may return.
///
/// Pages close on a timestamp boundary, so every event at the cursor's
/// timestamp was delivered with the page that ended there.
pub fn page_start(query: &LogEventQuery, after: Option<&EventCursor>) -> u64 {
    after.map_or(query.from_timestamp, |c| {
        query.from_timestamp.max(c.timestamp.saturating_add(1))
    })
}

/// Where a page closes, given the first events of its window in cursor
/// order. `None` when they fit in one page; otherwise the timestamp of the
/// `page_size`-th event, and the page must carry every event at it.
pub fn page_cut(head: &[RawLogEvent], page_size: usize) -> Option<u64> {
    let page_size = page_size.max(1);
    (head.len() > page_size).then(|| head[page_size - 1].cursor.timestamp)
}

/// Finish a page. `events` must be every included event from the page start
/// up to the cut (or the window end when there is no cut), in cursor order.
pub fn close_page(
    events: Vec<RawLogEvent>,
    cut: Option<u64>,
    query: &LogEventQuery,
    counts: Vec<EventCount>,
) -> RawEventPage {
    let (page_ends_at_timestamp, next_cursor) = match cut {
        Some(timestamp) => (timestamp, events.last().map(|e| e.cursor.clone())),
        None => (query.to_timestamp, None),
    };
    RawEventPage {
        events,
        metadata: PageMetadata {
            page_ends_at_timestamp,
            counts,
        },
        next_cursor,
    }
}

/// Build one page from stored logs.
///
/// Used by stores that filter in memory: `rows` may be any superset of the
/// logs in the query's timestamp window, in any order.
pub fn paginate(
    rows: impl IntoIterator<Item = StoredLog>,
    query: &LogEventQuery,
    after: Option<&EventCursor>,
) -> RawEventPage {
    let start = page_start(query, after);
    let mut matched: Vec<(bool, RawLogEvent)> = Vec::new();
    for row in rows {
        let ts = row.block.timestamp;
        if ts < start || ts > query.to_timestamp {
            continue;
        }
        let Some(selector) = row.log.selector() else {
            continue;
        };
        for f in &query.filters {
            if f.filter.chain_id != row.chain_id || !f.filter.matches(&row.log) {
                continue;
            }
            let Some((known, _)) = f
                .filter
                .events
                .iter()
                .find(|(s, _)| s.eq_ignore_ascii_case(selector))
            else {
                continue;
            };
            let included = f
                .include_event_selectors
                .iter()
                .any(|s| s.eq_ignore_ascii_case(selector));
            matched.push((
                included,
                RawLogEvent {
                    log_filter_name: f.filter.name.clone(),
                    chain_id: row.chain_id,
                    selector: known.clone(),
                    cursor: EventCursor::new(row.chain_id, &row.block, &row.log, &f.filter.name),
                    block: row.block.clone(),
                    transaction: row.transaction.clone(),
                    log: row.log.clone(),
                },
            ));
        }
    }
    matched.sort_by(|a, b| a.1.cursor.cmp(&b.1.cursor));

    let included: Vec<RawLogEvent> = matched
        .iter()
        .filter(|(included, _)| *included)
        .map(|(_, e)| e.clone())
        .collect();
    let cut = page_cut(&included, query.page_size);
    let end = cut.unwrap_or(query.to_timestamp);

    let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
    for (_, e) in matched.iter().filter(|(_, e)| e.cursor.timestamp <= end) {
        *counts
            .entry((e.log_filter_name.clone(), e.selector.clone()))
            .or_default() += 1;
    }
    let counts = counts
        .into_iter()
        .map(|((log_filter_name, selector), count)| EventCount {
            log_filter_name,
            selector,
            count,
        })
        .collect();

    let events = included
        .into_iter()
        .take_while(|e| e.cursor.timestamp <= end)
        .collect();
    close_page(events, cut, query, counts)
}

// ─── UserStore ────────────────────────────────────────────────────────────────

/// Entity store with timestamp-versioned rows.
///
/// A read at timestamp `T` sees the latest write stamped `<= T`.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Drop every table and recreate them for `schema`.
    async fn reload(&self, schema: &Schema) -> Result<(), IndexerError>;

    /// Remove every write stamped after `safe_timestamp`.
    async fn revert(&self, safe_timestamp: u64) -> Result<(), IndexerError>;

    async fn teardown(&self) -> Result<(), IndexerError>;

    async fn find_unique(
        &self,
        model: &str,
        id: &str,
        timestamp: Option<u64>,
    ) -> Result<Option<EntityInstance>, IndexerError>;

    /// Errors with `QueryLimit` when the query exceeds the page bounds.
    async fn find_many(
        &self,
        model: &str,
        query: &FindManyQuery,
    ) -> Result<Vec<EntityInstance>, IndexerError>;

    /// Resolve a derived field of `model` for the entity `id`.
    async fn find_derived(
        &self,
        model: &str,
        id: &str,
        field: &str,
        timestamp: Option<u64>,
    ) -> Result<Vec<EntityInstance>, IndexerError>;

    async fn create(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        data: EntityInstance,
    ) -> Result<EntityInstance, IndexerError>;

    async fn update(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        data: EntityInstance,
    ) -> Result<EntityInstance, IndexerError>;

    async fn upsert(
        &self,
        model: &str,
        id: &str,
        timestamp: u64,
        create: EntityInstance,
        update: EntityInstance,
    ) -> Result<EntityInstance, IndexerError>;

    /// Returns `false` if no live row existed.
    async fn delete(&self, model: &str, id: &str, timestamp: u64) -> Result<bool, IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventMetadata;

    const TRANSFER: &str = "0xddf2";
    const APPROVAL: &str = "0x8c5b";

    fn filter() -> LogFilter {
        let mut events = BTreeMap::new();
        for (selector, name) in [(TRANSFER, "Transfer"), (APPROVAL, "Approval")] {
            events.insert(
                selector.to_string(),
                EventMetadata {
                    safe_name: name.into(),
                    signature: format!("{name}()"),
                },
            );
        }
        LogFilter {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id: 1,
            addresses: vec!["0xtoken".into()],
            topics: vec![],
            start_block: 0,
            end_block: None,
            events,
        }
    }

    fn row(number: u64, log_index: u32, selector: &str) -> StoredLog {
        let block = Block {
            number,
            hash: format!("0xb{number}"),
            parent_hash: format!("0xb{}", number.saturating_sub(1)),
            timestamp: number * 10,
        };
        StoredLog {
            chain_id: 1,
            transaction: Transaction {
                hash: format!("0xt{number}"),
                block_hash: block.hash.clone(),
                block_number: number,
                transaction_index: 0,
                from: "0xf".into(),
                to: Some("0xtoken".into()),
                input: "0x".into(),
                value: "0".into(),
            },
            log: Log {
                address: "0xtoken".into(),
                topics: vec![selector.into()],
                data: "0x".into(),
                block_number: number,
                block_hash: block.hash.clone(),
                transaction_hash: format!("0xt{number}"),
                transaction_index: 0,
                log_index,
            },
            block,
        }
    }

    fn query(page_size: usize) -> LogEventQuery {
        LogEventQuery {
            from_timestamp: 0,
            to_timestamp: 1_000,
            filters: vec![LogEventFilter {
                filter: filter(),
                include_event_selectors: [TRANSFER.to_string()].into(),
            }],
            page_size,
        }
    }

    fn rows() -> Vec<StoredLog> {
        vec![
            row(3, 0, TRANSFER),
            row(1, 1, TRANSFER),
            row(1, 0, APPROVAL),
            row(2, 0, TRANSFER),
            row(2, 1, TRANSFER),
        ]
    }

    #[test]
    fn single_page_is_sorted_and_counts_all_selectors() {
        let page = paginate(rows(), &query(10), None);
        let order: Vec<(u64, u32)> = page
            .events
            .iter()
            .map(|e| (e.block.number, e.log.log_index))
            .collect();
        assert_eq!(order, vec![(1, 1), (2, 0), (2, 1), (3, 0)]);
        assert!(page.next_cursor.is_none());
        assert_eq!(page.metadata.page_ends_at_timestamp, 1_000);

        let approvals = page
            .metadata
            .counts
            .iter()
            .find(|c| c.selector == APPROVAL)
            .unwrap();
        assert_eq!(approvals.count, 1);
    }

    #[test]
    fn full_page_takes_the_rest_of_its_last_timestamp() {
        let q = query(2);
        let first = paginate(rows(), &q, None);
        let order: Vec<(u64, u32)> = first
            .events
            .iter()
            .map(|e| (e.block.number, e.log.log_index))
            .collect();
        // block 2 (ts 20) straddles the size limit and is kept whole
        assert_eq!(order, vec![(1, 1), (2, 0), (2, 1)]);
        assert_eq!(first.metadata.page_ends_at_timestamp, 20);
        let cursor = first.next_cursor.clone().unwrap();
        assert_eq!((cursor.block_number, cursor.log_index), (2, 1));

        let second = paginate(rows(), &q, Some(&cursor));
        let order: Vec<(u64, u32)> = second
            .events
            .iter()
            .map(|e| (e.block.number, e.log.log_index))
            .collect();
        assert_eq!(order, vec![(3, 0)]);
        assert!(second.next_cursor.is_none());
        assert_eq!(second.metadata.page_ends_at_timestamp, 1_000);
    }

    #[test]
    fn page_counts_stop_at_the_cut() {
        let first = paginate(rows(), &query(1), None);
        assert_eq!(first.metadata.page_ends_at_timestamp, 10);
        let counted: Vec<(&str, u64)> = first
            .metadata
            .counts
            .iter()
            .map(|c| (c.selector.as_str(), c.count))
            .collect();
        assert_eq!(counted, vec![(APPROVAL, 1), (TRANSFER, 1)]);
    }

    #[test]
    fn timestamp_window_is_inclusive() {
        let mut q = query(10);
        q.from_timestamp = 20;
        q.to_timestamp = 20;
        let page = paginate(rows(), &q, None);
        assert_eq!(page.events.len(), 2);
        assert!(page.events.iter().all(|e| e.block.number == 2));
    }
}
