//! Historical sync: backfills every log filter of one network from its start
//! block up to the finalized block reported by realtime sync.
//!
//! ```text
//! setup(finalized)                     start()
//!   per filter:                          buffer_unordered(concurrency)
//!     cached ranges ─┐                     ├─ eth_getLogs (windowed)
//!     [start, last] ─┴─ uncached spans     ├─ insert_finalized_logs
//!                       └─ split → tasks   ├─ insert_finalized_block (+ cached range)
//!                                          └─ merge ranges → HistoricalCheckpoint
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;

use chainreplay_core::cached_range::{split_span, uncached_spans};
use chainreplay_core::config::{LogFilter, Network, SyncTuning};
use chainreplay_core::error::IndexerError;
use chainreplay_core::provider::ChainProvider;
use chainreplay_core::signals::{emit, SyncEvent, SyncSender};
use chainreplay_core::store::{EventStore, LogFilterRange};
use chainreplay_core::types::{ChainId, Log};

use crate::fetcher::LogFetcher;

// ─── Plan ─────────────────────────────────────────────────────────────────────

/// One disjoint block span to fetch for one filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTask {
    pub log_filter_name: String,
    pub log_filter_key: String,
    pub from_block: u64,
    pub to_block: u64,
}

/// Backfill extent of one filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterProgress {
    pub log_filter_name: String,
    pub log_filter_key: String,
    pub start_block: u64,
    /// Last block to backfill (the filter's end block, capped by finality).
    pub end_block: u64,
    pub total_blocks: u64,
    pub cached_blocks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub finalized_block_number: u64,
    pub tasks: Vec<SyncTask>,
    /// Filters with something to backfill. Filters starting after the
    /// finalized block are left to realtime sync and do not appear here.
    pub filters: Vec<FilterProgress>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn total_blocks(&self) -> u64 {
        self.filters.iter().map(|f| f.total_blocks).sum()
    }

    pub fn cached_blocks(&self) -> u64 {
        self.filters.iter().map(|f| f.cached_blocks).sum()
    }
}

// ─── Service ──────────────────────────────────────────────────────────────────

/// Backfill service for one network.
pub struct HistoricalSyncService {
    inner: Arc<HistoricalInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct HistoricalInner {
    chain_id: ChainId,
    network: String,
    filters: Vec<LogFilter>,
    store: Arc<dyn EventStore>,
    fetcher: LogFetcher,
    max_block_range: u64,
    concurrency: usize,
    events: SyncSender,
    plan: Mutex<Option<SyncPlan>>,
    shutdown: AtomicBool,
}

impl HistoricalSyncService {
    pub fn new(
        network: &Network,
        filters: Vec<LogFilter>,
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn EventStore>,
        tuning: &SyncTuning,
        events: SyncSender,
    ) -> Self {
        Self {
            inner: Arc::new(HistoricalInner {
                chain_id: network.chain_id,
                network: network.name.clone(),
                filters,
                store,
                fetcher: LogFetcher::new(provider, network.chain_id, tuning),
                max_block_range: tuning.max_block_range.max(1),
                concurrency: tuning.historical_concurrency.max(1),
                events,
                plan: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.inner.chain_id
    }

    /// Diff every filter's `[start_block, last_block]` against its cached
    /// ranges and split what is missing into tasks.
    pub async fn setup(&self, finalized_block_number: u64) -> Result<SyncPlan, IndexerError> {
        let inner = &self.inner;
        let mut plan = SyncPlan {
            finalized_block_number,
            ..Default::default()
        };

        for filter in &inner.filters {
            let last = filter.last_block(finalized_block_number);
            if filter.start_block > last {
                tracing::info!(
                    chain_id = inner.chain_id,
                    log_filter = %filter.name,
                    start_block = filter.start_block,
                    finalized_block_number,
                    "Filter starts after the finalized block, nothing to backfill"
                );
                continue;
            }

            let key = filter.filter_key();
            let cached = inner.store.get_log_filter_cached_ranges(&key).await?;
            let spans = uncached_spans(filter.start_block, last, &cached);
            let total_blocks = last - filter.start_block + 1;
            let uncached_blocks: u64 = spans.iter().map(|(from, to)| to - from + 1).sum();

            for (from, to) in spans {
                for (from_block, to_block) in split_span(from, to, inner.max_block_range) {
                    plan.tasks.push(SyncTask {
                        log_filter_name: filter.name.clone(),
                        log_filter_key: key.clone(),
                        from_block,
                        to_block,
                    });
                }
            }

            tracing::info!(
                chain_id = inner.chain_id,
                log_filter = %filter.name,
                from = filter.start_block,
                to = last,
                total_blocks,
                cached_blocks = total_blocks - uncached_blocks,
                "Historical sync plan"
            );
            plan.filters.push(FilterProgress {
                log_filter_name: filter.name.clone(),
                log_filter_key: key,
                start_block: filter.start_block,
                end_block: last,
                total_blocks,
                cached_blocks: total_blocks - uncached_blocks,
            });
        }

        *inner.plan.lock().unwrap() = Some(plan.clone());
        Ok(plan)
    }

    /// The plan computed by the last [`setup`](Self::setup).
    pub fn plan(&self) -> Option<SyncPlan> {
        self.inner.plan.lock().unwrap().clone()
    }

    /// Spawn the backfill. Emits `HistoricalCheckpoint` as contiguous
    /// progress grows and `SyncComplete` once the plan is drained.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run().await });
        if let Some(previous) = self.handle.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the backfill. Pending tasks are dropped and in-flight ones are
    /// aborted at their next suspension point; store writes are per call, so
    /// no partial block is ever recorded. Idempotent.
    pub async fn kill(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            tracing::debug!(chain_id = self.inner.chain_id, "Historical sync killed");
        }
    }
}

impl HistoricalInner {
    async fn run(self: Arc<Self>) {
        let Some(plan) = self.plan.lock().unwrap().clone() else {
            tracing::warn!(chain_id = self.chain_id, "Historical sync started before setup");
            return;
        };

        tracing::info!(
            chain_id = self.chain_id,
            network = %self.network,
            tasks = plan.tasks.len(),
            total_blocks = plan.total_blocks(),
            cached_blocks = plan.cached_blocks(),
            "Starting historical sync"
        );

        match self.sync(plan).await {
            Ok(true) => {
                tracing::info!(chain_id = self.chain_id, network = %self.network, "Historical sync complete");
                emit(&self.events, SyncEvent::SyncComplete { chain_id: self.chain_id });
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(
                    chain_id = self.chain_id,
                    network = %self.network,
                    error = %err,
                    "Historical sync failed"
                );
                emit(
                    &self.events,
                    SyncEvent::SyncFailed {
                        chain_id: self.chain_id,
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    /// Returns `Ok(false)` when stopped by `kill`.
    async fn sync(&self, plan: SyncPlan) -> Result<bool, IndexerError> {
        let SyncPlan { tasks, filters, .. } = plan;
        let mut remaining: HashMap<String, usize> = HashMap::new();
        for task in &tasks {
            *remaining.entry(task.log_filter_name.clone()).or_default() += 1;
        }

        let mut checkpoint = 0;
        self.advance_checkpoint(&filters, &remaining, &mut checkpoint).await?;

        let mut results = stream::iter(tasks)
            .map(|task| self.run_task(task))
            .buffer_unordered(self.concurrency);

        while let Some(result) = results.next().await {
            let Some(task) = result? else {
                return Ok(false);
            };
            if let Some(count) = remaining.get_mut(&task.log_filter_name) {
                *count -= 1;
            }
            self.advance_checkpoint(&filters, &remaining, &mut checkpoint).await?;
        }

        Ok(!self.shutdown.load(Ordering::SeqCst))
    }

    /// Merge each filter's cached ranges. The network checkpoint is the
    /// smallest contiguous frontier among filters that still have work; once
    /// every filter is drained it is the furthest one, since no filter holds
    /// events past its own end.
    async fn advance_checkpoint(
        &self,
        filters: &[FilterProgress],
        remaining: &HashMap<String, usize>,
        checkpoint: &mut u64,
    ) -> Result<(), IndexerError> {
        let mut pending_frontier: Option<u64> = None;
        let mut drained_frontier: Option<u64> = None;
        for filter in filters {
            let merged = self
                .store
                .merge_log_filter_cached_ranges(&filter.log_filter_key, filter.start_block)
                .await?;
            let ts = merged.starting_range_end_timestamp;
            if remaining.get(&filter.log_filter_name).copied().unwrap_or(0) > 0 {
                pending_frontier = Some(pending_frontier.map_or(ts, |f| f.min(ts)));
            } else {
                drained_frontier = Some(drained_frontier.map_or(ts, |f| f.max(ts)));
            }
        }
        let frontier = pending_frontier.or(drained_frontier);

        if let Some(timestamp) = frontier {
            if timestamp > *checkpoint {
                *checkpoint = timestamp;
                tracing::debug!(chain_id = self.chain_id, timestamp, "Historical checkpoint");
                emit(
                    &self.events,
                    SyncEvent::HistoricalCheckpoint {
                        chain_id: self.chain_id,
                        timestamp,
                    },
                );
            }
        }
        Ok(())
    }

    /// Fetch and store one span. Returns `None` when stopped by `kill`.
    async fn run_task(&self, task: SyncTask) -> Result<Option<SyncTask>, IndexerError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let filter = self
            .filters
            .iter()
            .find(|f| f.name == task.log_filter_name)
            .ok_or_else(|| IndexerError::Other(format!("unknown log filter {}", task.log_filter_name)))?;

        let logs = self
            .fetcher
            .logs_in_range(filter, task.from_block, task.to_block)
            .await?;
        self.store.insert_finalized_logs(self.chain_id, &logs).await?;

        // Every block holding a log, plus the span end so the cached range
        // reaches `to_block` even when the tail is empty.
        let mut numbers: BTreeSet<u64> = logs.iter().map(|l| l.block_number).collect();
        numbers.insert(task.to_block);

        let mut cache_from = task.from_block;
        for number in numbers {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let full = self.fetcher.block_by_number(number).await?;
            let block_logs: Vec<Log> = logs
                .iter()
                .filter(|l| l.block_number == number)
                .cloned()
                .collect();
            let transactions = full.transactions_for(&block_logs);
            self.store
                .insert_finalized_block(
                    self.chain_id,
                    &full.block,
                    &transactions,
                    &LogFilterRange {
                        log_filter_key: task.log_filter_key.clone(),
                        block_number_to_cache_from: cache_from,
                    },
                )
                .await?;
            cache_from = number + 1;
        }

        tracing::debug!(
            chain_id = self.chain_id,
            log_filter = %task.log_filter_name,
            from = task.from_block,
            to = task.to_block,
            logs = logs.len(),
            "Synced historical range"
        );
        Ok(Some(task))
    }
}
