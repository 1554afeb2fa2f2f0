//! SQLite event store.
//!
//! Persists blocks, transactions, logs, cached ranges, and contract reads to
//! a single SQLite file. Uses `sqlx` with WAL mode for concurrent read
//! performance. Each trait call runs in its own transaction.
//!
//! # Usage
//! ```rust,no_run
//! use chainreplay_storage::sqlite::SqliteEventStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteEventStore::open("./events.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteEventStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use chainreplay_core::cached_range::{merge_ranges, starting_range_end, CachedRange};
use chainreplay_core::cursor::EventCursor;
use chainreplay_core::error::IndexerError;
use chainreplay_core::config::LogFilter;
use chainreplay_core::store::{
    close_page, page_cut, page_start, ContractReadKey, ContractReadResult, EventCount, EventStore,
    LogEventFilter, LogEventQuery, LogFilterRange, MergedRange, RawEventPage, RawLogEvent, StoredLog,
};
use chainreplay_core::types::{Block, ChainId, Log, Transaction};

fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        chain_id     INTEGER NOT NULL,
        hash         TEXT    NOT NULL,
        number       INTEGER NOT NULL,
        parent_hash  TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        finalized    INTEGER NOT NULL,
        PRIMARY KEY (chain_id, hash)
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        chain_id          INTEGER NOT NULL,
        hash              TEXT    NOT NULL,
        block_hash        TEXT    NOT NULL,
        block_number      INTEGER NOT NULL,
        transaction_index INTEGER NOT NULL,
        from_address      TEXT    NOT NULL,
        to_address        TEXT,
        input             TEXT    NOT NULL,
        value             TEXT    NOT NULL,
        finalized         INTEGER NOT NULL,
        PRIMARY KEY (chain_id, hash)
    );",
    "CREATE TABLE IF NOT EXISTS logs (
        chain_id          INTEGER NOT NULL,
        id                TEXT    NOT NULL,
        address           TEXT    NOT NULL,
        topics            TEXT    NOT NULL,
        data              TEXT    NOT NULL,
        block_number      INTEGER NOT NULL,
        block_hash        TEXT    NOT NULL,
        transaction_hash  TEXT    NOT NULL,
        transaction_index INTEGER NOT NULL,
        log_index         INTEGER NOT NULL,
        finalized         INTEGER NOT NULL,
        PRIMARY KEY (chain_id, id)
    );",
    "CREATE INDEX IF NOT EXISTS idx_logs_block ON logs (chain_id, block_hash);",
    "CREATE INDEX IF NOT EXISTS idx_blocks_timestamp ON blocks (chain_id, timestamp);",
    "CREATE TABLE IF NOT EXISTS log_filter_cached_ranges (
        filter_key          TEXT    NOT NULL,
        start_block         INTEGER NOT NULL,
        end_block           INTEGER NOT NULL,
        end_block_timestamp INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_cached_ranges_key ON log_filter_cached_ranges (filter_key);",
    "CREATE TABLE IF NOT EXISTS contract_read_results (
        address      TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        chain_id     INTEGER NOT NULL,
        data         TEXT    NOT NULL,
        result       TEXT    NOT NULL,
        finalized    INTEGER NOT NULL,
        PRIMARY KEY (address, block_number, chain_id, data)
    );",
];

const TABLES: &[&str] = &[
    "blocks",
    "transactions",
    "logs",
    "log_filter_cached_ranges",
    "contract_read_results",
];

/// SQLite-backed [`EventStore`].
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (or create) a SQLite database at `path` and run migrations.
    ///
    /// The path may be a plain file path (`"./events.db"`) or a full
    /// SQLite URL (`"sqlite:./events.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.migrate_up().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own database, so the pool is
    /// capped at one connection.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.migrate_up().await?;
        Ok(store)
    }

    async fn upsert_block(
        conn: &mut sqlx::SqliteConnection,
        chain_id: ChainId,
        block: &Block,
        finalized: bool,
    ) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO blocks (chain_id, hash, number, parent_hash, timestamp, finalized)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, hash) DO UPDATE SET finalized = MAX(finalized, excluded.finalized)",
        )
        .bind(chain_id as i64)
        .bind(&block.hash)
        .bind(block.number as i64)
        .bind(&block.parent_hash)
        .bind(block.timestamp as i64)
        .bind(finalized)
        .execute(conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_transaction(
        conn: &mut sqlx::SqliteConnection,
        chain_id: ChainId,
        tx: &Transaction,
        finalized: bool,
    ) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO transactions
             (chain_id, hash, block_hash, block_number, transaction_index, from_address, to_address, input, value, finalized)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, hash) DO UPDATE SET finalized = MAX(finalized, excluded.finalized)",
        )
        .bind(chain_id as i64)
        .bind(&tx.hash)
        .bind(&tx.block_hash)
        .bind(tx.block_number as i64)
        .bind(tx.transaction_index as i64)
        .bind(&tx.from)
        .bind(&tx.to)
        .bind(&tx.input)
        .bind(&tx.value)
        .bind(finalized)
        .execute(conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_log(
        conn: &mut sqlx::SqliteConnection,
        chain_id: ChainId,
        log: &Log,
        finalized: bool,
    ) -> Result<(), IndexerError> {
        let topics =
            serde_json::to_string(&log.topics).map_err(|e| IndexerError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO logs
             (chain_id, id, address, topics, data, block_number, block_hash, transaction_hash, transaction_index, log_index, finalized)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, id) DO UPDATE SET finalized = MAX(finalized, excluded.finalized)",
        )
        .bind(chain_id as i64)
        .bind(log.id())
        .bind(&log.address)
        .bind(&topics)
        .bind(&log.data)
        .bind(log.block_number as i64)
        .bind(&log.block_hash)
        .bind(&log.transaction_hash)
        .bind(log.transaction_index as i64)
        .bind(log.log_index as i64)
        .bind(finalized)
        .execute(conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    fn stored_log(row: &SqliteRow) -> Result<StoredLog, IndexerError> {
        let topics: String = row.get("topics");
        let topics: Vec<String> =
            serde_json::from_str(&topics).map_err(|e| IndexerError::Storage(e.to_string()))?;
        let block = Block {
            number: row.get::<i64, _>("b_number") as u64,
            hash: row.get("block_hash"),
            parent_hash: row.get("b_parent_hash"),
            timestamp: row.get::<i64, _>("b_timestamp") as u64,
        };
        Ok(StoredLog {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            transaction: Transaction {
                hash: row.get("transaction_hash"),
                block_hash: row.get("block_hash"),
                block_number: block.number,
                transaction_index: row.get::<i64, _>("t_index") as u32,
                from: row.get("t_from"),
                to: row.get("t_to"),
                input: row.get("t_input"),
                value: row.get("t_value"),
            },
            log: Log {
                address: row.get("address"),
                topics,
                data: row.get("data"),
                block_number: row.get::<i64, _>("block_number") as u64,
                block_hash: row.get("block_hash"),
                transaction_hash: row.get("transaction_hash"),
                transaction_index: row.get::<i64, _>("transaction_index") as u32,
                log_index: row.get::<i64, _>("log_index") as u32,
            },
            block,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn migrate_up(&self) -> Result<(), IndexerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn migrate_down(&self) -> Result<(), IndexerError> {
        for table in TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table};"))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_finalized_logs(&self, chain_id: ChainId, logs: &[Log]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for log in logs {
            Self::upsert_log(&mut tx, chain_id, log, true).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_finalized_block(
        &self,
        chain_id: ChainId,
        block: &Block,
        transactions: &[Transaction],
        range: &LogFilterRange,
    ) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::upsert_block(&mut tx, chain_id, block, true).await?;
        for t in transactions {
            Self::upsert_transaction(&mut tx, chain_id, t, true).await?;
        }
        if range.block_number_to_cache_from <= block.number {
            sqlx::query(
                "INSERT INTO log_filter_cached_ranges (filter_key, start_block, end_block, end_block_timestamp)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&range.log_filter_key)
            .bind(range.block_number_to_cache_from as i64)
            .bind(block.number as i64)
            .bind(block.timestamp as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn merge_log_filter_cached_ranges(
        &self,
        log_filter_key: &str,
        start_block: u64,
    ) -> Result<MergedRange, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            "SELECT start_block, end_block, end_block_timestamp
             FROM log_filter_cached_ranges WHERE filter_key = ?",
        )
        .bind(log_filter_key)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let merged = merge_ranges(
            rows.iter()
                .map(|r| CachedRange {
                    filter_key: log_filter_key.to_string(),
                    start_block: r.get::<i64, _>("start_block") as u64,
                    end_block: r.get::<i64, _>("end_block") as u64,
                    end_block_timestamp: r.get::<i64, _>("end_block_timestamp") as u64,
                })
                .collect(),
        );

        sqlx::query("DELETE FROM log_filter_cached_ranges WHERE filter_key = ?")
            .bind(log_filter_key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for range in &merged {
            sqlx::query(
                "INSERT INTO log_filter_cached_ranges (filter_key, start_block, end_block, end_block_timestamp)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(log_filter_key)
            .bind(range.start_block as i64)
            .bind(range.end_block as i64)
            .bind(range.end_block_timestamp as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(MergedRange {
            starting_range_end_timestamp: starting_range_end(&merged, start_block)
                .map_or(0, |r| r.end_block_timestamp),
        })
    }

    async fn get_log_filter_cached_ranges(
        &self,
        log_filter_key: &str,
    ) -> Result<Vec<CachedRange>, IndexerError> {
        let rows = sqlx::query(
            "SELECT start_block, end_block, end_block_timestamp
             FROM log_filter_cached_ranges WHERE filter_key = ? ORDER BY start_block",
        )
        .bind(log_filter_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| CachedRange {
                filter_key: log_filter_key.to_string(),
                start_block: r.get::<i64, _>("start_block") as u64,
                end_block: r.get::<i64, _>("end_block") as u64,
                end_block_timestamp: r.get::<i64, _>("end_block_timestamp") as u64,
            })
            .collect())
    }

    async fn insert_unfinalized_block(
        &self,
        chain_id: ChainId,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::upsert_block(&mut tx, chain_id, block, false).await?;
        for t in transactions {
            Self::upsert_transaction(&mut tx, chain_id, t, false).await?;
        }
        for log in logs {
            Self::upsert_log(&mut tx, chain_id, log, false).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_unfinalized_data(
        &self,
        chain_id: ChainId,
        from_block_number: u64,
    ) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (table, column) in [
            ("blocks", "number"),
            ("transactions", "block_number"),
            ("logs", "block_number"),
            ("contract_read_results", "block_number"),
        ] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE chain_id = ? AND finalized = 0 AND {column} >= ?"
            ))
            .bind(chain_id as i64)
            .bind(from_block_number as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        debug!(chain_id, from_block_number, "deleted unfinalized data");
        Ok(())
    }

    async fn finalize_data(&self, chain_id: ChainId, to_block_number: u64) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (table, column) in [
            ("blocks", "number"),
            ("transactions", "block_number"),
            ("logs", "block_number"),
            ("contract_read_results", "block_number"),
        ] {
            sqlx::query(&format!(
                "UPDATE {table} SET finalized = 1 WHERE chain_id = ? AND {column} <= ?"
            ))
            .bind(chain_id as i64)
            .bind(to_block_number as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_contract_read_result(&self, result: ContractReadResult) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO contract_read_results
             (address, block_number, chain_id, data, result, finalized)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.key.address)
        .bind(result.key.block_number as i64)
        .bind(result.key.chain_id as i64)
        .bind(&result.key.data)
        .bind(&result.result)
        .bind(result.finalized)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_contract_read_result(
        &self,
        key: &ContractReadKey,
    ) -> Result<Option<String>, IndexerError> {
        let row = sqlx::query(
            "SELECT result FROM contract_read_results
             WHERE address = ? AND block_number = ? AND chain_id = ? AND data = ?",
        )
        .bind(&key.address)
        .bind(key.block_number as i64)
        .bind(key.chain_id as i64)
        .bind(&key.data)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get::<String, _>("result")))
    }

    async fn get_log_events_page(
        &self,
        query: &LogEventQuery,
        after: Option<&EventCursor>,
    ) -> Result<RawEventPage, IndexerError> {
        let from = page_start(query, after);
        let page_size = query.page_size.max(1);

        let head = self
            .matched_events(query, from, query.to_timestamp, Some(page_size + 1))
            .await?;
        let cut = page_cut(&head, page_size);
        let (events, end) = match cut {
            Some(at) => {
                let mut events: Vec<RawLogEvent> =
                    head.into_iter().take_while(|e| e.cursor.timestamp < at).collect();
                events.extend(self.matched_events(query, at, at, None).await?);
                (events, at)
            }
            None => (head, query.to_timestamp),
        };

        let counts = self.matched_counts(query, from, end).await?;
        debug!(from, end, events = events.len(), "read log event page");
        Ok(close_page(events, cut, query, counts))
    }
}

// ─── Event queries ───────────────────────────────────────────────────────────

const EVENT_COLUMNS: &str =
    "l.chain_id, l.address, l.topics, l.data, l.block_number, l.block_hash,
     l.transaction_hash, l.transaction_index, l.log_index,
     b.number AS b_number, b.parent_hash AS b_parent_hash, b.timestamp AS b_timestamp,
     t.transaction_index AS t_index, t.from_address AS t_from, t.to_address AS t_to,
     t.input AS t_input, t.value AS t_value";

const EVENT_JOINS: &str = " FROM logs l
     JOIN blocks b ON b.chain_id = l.chain_id AND b.hash = l.block_hash
     JOIN transactions t ON t.chain_id = l.chain_id AND t.hash = l.transaction_hash";

/// Append the match condition of `filter` restricted to `selectors`.
fn push_filter_match<'s>(
    qb: &mut QueryBuilder<'_, Sqlite>,
    filter: &LogFilter,
    selectors: impl IntoIterator<Item = &'s String>,
) {
    qb.push(" AND l.chain_id = ").push_bind(filter.chain_id as i64);
    qb.push(" AND l.block_number >= ").push_bind(filter.start_block as i64);
    if let Some(end) = filter.end_block {
        qb.push(" AND l.block_number <= ").push_bind(end as i64);
    }
    if !filter.addresses.is_empty() {
        qb.push(" AND lower(l.address) IN (");
        let mut list = qb.separated(", ");
        for address in &filter.addresses {
            list.push_bind(address.to_lowercase());
        }
        list.push_unseparated(")");
    }
    for (position, values) in filter.topics.iter().enumerate() {
        let Some(values) = values else {
            continue;
        };
        qb.push(format!(" AND lower(json_extract(l.topics, '$[{position}]')) IN ("));
        let mut list = qb.separated(", ");
        for value in values {
            list.push_bind(value.to_lowercase());
        }
        list.push_unseparated(")");
    }
    qb.push(" AND lower(json_extract(l.topics, '$[0]')) IN (");
    let mut list = qb.separated(", ");
    for selector in selectors {
        list.push_bind(selector.to_lowercase());
    }
    list.push_unseparated(")");
}

impl SqliteEventStore {
    /// Included events with `from <= timestamp <= to`, in cursor order.
    async fn matched_events(
        &self,
        query: &LogEventQuery,
        from: u64,
        to: u64,
        limit: Option<usize>,
    ) -> Result<Vec<RawLogEvent>, IndexerError> {
        let filters: Vec<&LogEventFilter> = query
            .filters
            .iter()
            .filter(|f| !f.include_event_selectors.is_empty())
            .collect();
        if filters.is_empty() || from > to {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM (");
        for (i, f) in filters.iter().enumerate() {
            if i > 0 {
                qb.push(" UNION ALL ");
            }
            qb.push("SELECT ")
                .push(EVENT_COLUMNS)
                .push(", ")
                .push_bind(f.filter.name.clone())
                .push(" AS filter_name")
                .push(EVENT_JOINS)
                .push(" WHERE b.timestamp >= ")
                .push_bind(from as i64)
                .push(" AND b.timestamp <= ")
                .push_bind(to as i64);
            push_filter_match(&mut qb, &f.filter, &f.include_event_selectors);
        }
        qb.push(") ORDER BY b_timestamp, chain_id, block_number, log_index, filter_name");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(|row| Self::raw_event(row, query)).collect()
    }

    /// Per `(filter, selector)` match counts over `from..=to`, handled or not.
    async fn matched_counts(
        &self,
        query: &LogEventQuery,
        from: u64,
        to: u64,
    ) -> Result<Vec<EventCount>, IndexerError> {
        let filters: Vec<&LogEventFilter> = query
            .filters
            .iter()
            .filter(|f| !f.filter.events.is_empty())
            .collect();
        if filters.is_empty() || from > to {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("");
        for (i, f) in filters.iter().enumerate() {
            if i > 0 {
                qb.push(" UNION ALL ");
            }
            qb.push("SELECT ")
                .push_bind(f.filter.name.clone())
                .push(" AS filter_name, lower(json_extract(l.topics, '$[0]')) AS selector, COUNT(*) AS n")
                .push(EVENT_JOINS)
                .push(" WHERE b.timestamp >= ")
                .push_bind(from as i64)
                .push(" AND b.timestamp <= ")
                .push_bind(to as i64);
            push_filter_match(&mut qb, &f.filter, f.filter.events.keys());
            qb.push(" GROUP BY selector");
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for row in &rows {
            let name: String = row.get("filter_name");
            let selector: String = row.get("selector");
            let Some(filter) = query.filters.iter().find(|f| f.filter.name == name) else {
                continue;
            };
            let Some(known) = filter.filter.events.keys().find(|s| s.eq_ignore_ascii_case(&selector)) else {
                continue;
            };
            *counts.entry((name, known.clone())).or_default() += row.get::<i64, _>("n") as u64;
        }
        Ok(counts
            .into_iter()
            .map(|((log_filter_name, selector), count)| EventCount {
                log_filter_name,
                selector,
                count,
            })
            .collect())
    }

    fn raw_event(row: &SqliteRow, query: &LogEventQuery) -> Result<RawLogEvent, IndexerError> {
        let name: String = row.get("filter_name");
        let stored = Self::stored_log(row)?;
        let filter = query
            .filters
            .iter()
            .find(|f| f.filter.name == name)
            .ok_or_else(|| IndexerError::Storage(format!("unknown log filter {name}")))?;
        let selector = stored
            .log
            .selector()
            .and_then(|s| filter.filter.events.keys().find(|k| k.eq_ignore_ascii_case(s)))
            .cloned()
            .ok_or_else(|| IndexerError::Storage(format!("log without a {name} selector")))?;
        Ok(RawLogEvent {
            cursor: EventCursor::new(stored.chain_id, &stored.block, &stored.log, &name),
            log_filter_name: name,
            chain_id: stored.chain_id,
            selector,
            block: stored.block,
            transaction: stored.transaction,
            log: stored.log,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainreplay_core::config::{EventMetadata, LogFilter};
    use chainreplay_core::store::LogEventFilter;

    fn block(number: u64) -> Block {
        Block {
            number,
            hash: format!("0xb{number}"),
            parent_hash: format!("0xb{}", number - 1),
            timestamp: number * 10,
        }
    }

    fn tx(number: u64) -> Transaction {
        Transaction {
            hash: format!("0xt{number}"),
            block_hash: format!("0xb{number}"),
            block_number: number,
            transaction_index: 0,
            from: "0xf".into(),
            to: None,
            input: "0x".into(),
            value: "0".into(),
        }
    }

    fn log(number: u64, log_index: u32) -> Log {
        Log {
            address: "0xtoken".into(),
            topics: vec!["0xddf2".into()],
            data: "0x".into(),
            block_number: number,
            block_hash: format!("0xb{number}"),
            transaction_hash: format!("0xt{number}"),
            transaction_index: 0,
            log_index,
        }
    }

    fn query() -> LogEventQuery {
        let mut events = std::collections::BTreeMap::new();
        events.insert(
            "0xddf2".to_string(),
            EventMetadata {
                safe_name: "Transfer".into(),
                signature: "Transfer(address,address,uint256)".into(),
            },
        );
        LogEventQuery {
            from_timestamp: 0,
            to_timestamp: 1_000,
            filters: vec![LogEventFilter {
                filter: LogFilter {
                    name: "Token".into(),
                    network: "mainnet".into(),
                    chain_id: 1,
                    addresses: vec!["0xtoken".into()],
                    topics: vec![],
                    start_block: 0,
                    end_block: None,
                    events,
                },
                include_event_selectors: ["0xddf2".to_string()].into(),
            }],
            page_size: 100,
        }
    }

    fn range(from: u64) -> LogFilterRange {
        LogFilterRange {
            log_filter_key: "k".into(),
            block_number_to_cache_from: from,
        }
    }

    #[tokio::test]
    async fn finalized_data_roundtrip_is_idempotent() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        for _ in 0..2 {
            store.insert_finalized_logs(1, &[log(5, 1), log(5, 0)]).await.unwrap();
            store
                .insert_finalized_block(1, &block(5), &[tx(5)], &range(1))
                .await
                .unwrap();
        }
        let merged = store.merge_log_filter_cached_ranges("k", 1).await.unwrap();
        assert_eq!(merged.starting_range_end_timestamp, 50);
        assert_eq!(store.get_log_filter_cached_ranges("k").await.unwrap().len(), 1);

        let page = store.get_log_events_page(&query(), None).await.unwrap();
        let indexes: Vec<u32> = page.events.iter().map(|e| e.log.log_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[tokio::test]
    async fn reorg_deletes_only_unfinalized_rows() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        for n in 10..=12 {
            store
                .insert_unfinalized_block(1, &block(n), &[tx(n)], &[log(n, 0)])
                .await
                .unwrap();
        }
        store.finalize_data(1, 10).await.unwrap();
        store.delete_unfinalized_data(1, 10).await.unwrap();

        let page = store.get_log_events_page(&query(), None).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].block.number, 10);
    }

    #[tokio::test]
    async fn pages_close_on_a_timestamp_boundary() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store
            .insert_unfinalized_block(1, &block(1), &[tx(1)], &[log(1, 0), log(1, 1)])
            .await
            .unwrap();
        let foreign = Log {
            address: "0xother".into(),
            ..log(2, 1)
        };
        let shouting = Log {
            address: "0xTOKEN".into(),
            ..log(2, 0)
        };
        store
            .insert_unfinalized_block(1, &block(2), &[tx(2)], &[shouting, foreign])
            .await
            .unwrap();
        store
            .insert_unfinalized_block(1, &block(3), &[tx(3)], &[log(3, 0)])
            .await
            .unwrap();

        let mut q = query();
        q.page_size = 1;
        let positions = |page: &RawEventPage| -> Vec<(u64, u32)> {
            page.events.iter().map(|e| (e.block.number, e.log.log_index)).collect()
        };

        let first = store.get_log_events_page(&q, None).await.unwrap();
        assert_eq!(positions(&first), vec![(1, 0), (1, 1)]);
        assert_eq!(first.metadata.page_ends_at_timestamp, 10);
        assert_eq!(first.metadata.counts[0].count, 2);

        let second = store
            .get_log_events_page(&q, first.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(positions(&second), vec![(2, 0)]);
        assert_eq!(second.metadata.page_ends_at_timestamp, 20);
        assert_eq!(second.metadata.counts[0].count, 1);

        let third = store
            .get_log_events_page(&q, second.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(positions(&third), vec![(3, 0)]);
        assert!(third.next_cursor.is_none());
        assert_eq!(third.metadata.page_ends_at_timestamp, 1_000);
    }

    #[tokio::test]
    async fn contract_read_cache() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let key = ContractReadKey {
            address: "0xc".into(),
            block_number: 7,
            chain_id: 1,
            data: "0x18160ddd".into(),
        };
        assert!(store.get_contract_read_result(&key).await.unwrap().is_none());
        store
            .insert_contract_read_result(ContractReadResult {
                key: key.clone(),
                result: "0x01".into(),
                finalized: false,
            })
            .await
            .unwrap();
        assert_eq!(
            store.get_contract_read_result(&key).await.unwrap().as_deref(),
            Some("0x01")
        );
    }
}
