//! Realtime sync: tails one network's head, resolves reorgs, and promotes
//! old blocks to finalized.
//!
//! Each poll tick runs to completion before the next one starts:
//!
//! 1. fetch the latest block; an older or already-seen head is a no-op
//! 2. walk parents of the new head until one matches the local chain
//! 3. if the match is below the local head, drop everything above it
//!    (`delete_unfinalized_data`) and emit `ShallowReorg`
//! 4. ingest the new branch oldest first, emitting `RealtimeCheckpoint`
//! 5. finalize blocks `finality_block_count` behind the head

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use chainreplay_core::config::{LogFilter, Network, SyncTuning};
use chainreplay_core::error::IndexerError;
use chainreplay_core::provider::ChainProvider;
use chainreplay_core::reorg::{dropped_blocks, AncestorSearch, ReorgResolution, SearchStep};
use chainreplay_core::signals::{emit, SyncEvent, SyncSender};
use chainreplay_core::store::EventStore;
use chainreplay_core::tracker::BlockTracker;
use chainreplay_core::types::{Block, BlockWithTransactions, ChainId, Log};

use crate::fetcher::LogFetcher;

/// Returned by [`RealtimeSyncService::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RealtimeSetup {
    pub latest_block_number: u64,
    /// Highest block treated as final at startup. Historical sync backfills
    /// up to here and realtime sync takes over above it.
    pub finalized_block_number: u64,
}

/// What one poll tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The remote head is the local head.
    Unchanged,
    /// The provider returned a head older than ours.
    Behind { remote: u64, local: u64 },
    Extended { blocks: usize },
    Reorged(ReorgResolution),
}

pub struct RealtimeSyncService {
    inner: Arc<RealtimeInner>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct RealtimeInner {
    chain_id: ChainId,
    network: String,
    polling_interval: Duration,
    finality_block_count: u64,
    max_reorg_depth: u64,
    filters: Vec<LogFilter>,
    store: Arc<dyn EventStore>,
    fetcher: LogFetcher,
    tracker: AsyncMutex<BlockTracker>,
    events: SyncSender,
}

impl RealtimeSyncService {
    pub fn new(
        network: &Network,
        filters: Vec<LogFilter>,
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn EventStore>,
        tuning: &SyncTuning,
        events: SyncSender,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RealtimeInner {
                chain_id: network.chain_id,
                network: network.name.clone(),
                polling_interval: Duration::from_millis(network.polling_interval_ms.max(1)),
                finality_block_count: network.finality_block_count,
                max_reorg_depth: tuning.max_reorg_depth,
                filters,
                store,
                fetcher: LogFetcher::new(provider, network.chain_id, tuning),
                tracker: AsyncMutex::new(BlockTracker::new()),
                events,
            }),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.inner.chain_id
    }

    /// Anchor the local chain at `latest - finality_block_count`.
    pub async fn setup(&self) -> Result<RealtimeSetup, IndexerError> {
        let inner = &self.inner;
        let latest = inner.fetcher.latest_block().await?;
        let finalized_number = latest
            .block
            .number
            .saturating_sub(inner.finality_block_count);
        let finalized = if finalized_number == latest.block.number {
            latest.block.clone()
        } else {
            inner.fetcher.block_by_number(finalized_number).await?.block
        };

        tracing::info!(
            chain_id = inner.chain_id,
            network = %inner.network,
            latest = latest.block.number,
            finalized = finalized.number,
            "Realtime sync anchored"
        );

        let timestamp = finalized.timestamp;
        inner.tracker.lock().await.anchor(finalized);
        emit(
            &inner.events,
            SyncEvent::RealtimeCheckpoint {
                chain_id: inner.chain_id,
                timestamp,
            },
        );
        emit(
            &inner.events,
            SyncEvent::FinalityCheckpoint {
                chain_id: inner.chain_id,
                timestamp,
            },
        );

        Ok(RealtimeSetup {
            latest_block_number: latest.block.number,
            finalized_block_number: finalized_number,
        })
    }

    /// Run a single poll tick.
    pub async fn poll_once(&self) -> Result<PollOutcome, IndexerError> {
        self.inner.poll_once().await
    }

    /// Current local head.
    pub async fn head(&self) -> Option<Block> {
        self.inner.tracker.lock().await.head().cloned()
    }

    /// Spawn the poll loop. A fatal error stops the loop and emits `SyncFailed`.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.polling_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        if let Err(err) = inner.poll_once().await {
                            tracing::error!(
                                chain_id = inner.chain_id,
                                network = %inner.network,
                                error = %err,
                                "Realtime sync failed"
                            );
                            emit(&inner.events, SyncEvent::SyncFailed {
                                chain_id: inner.chain_id,
                                error: err.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.handle.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling and wait for the current tick to finish. Idempotent.
    pub async fn kill(&self) {
        self.shutdown.send_replace(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            tracing::debug!(chain_id = self.inner.chain_id, "Realtime sync killed");
        }
    }
}

impl RealtimeInner {
    async fn poll_once(&self) -> Result<PollOutcome, IndexerError> {
        let latest = self.fetcher.latest_block().await?;
        let mut tracker = self.tracker.lock().await;
        let head = tracker
            .head()
            .cloned()
            .ok_or_else(|| IndexerError::Other("realtime sync polled before setup".into()))?;

        if latest.block.number < head.number {
            tracing::trace!(chain_id = self.chain_id, remote = latest.block.number, local = head.number, "Provider behind local head");
            return Ok(PollOutcome::Behind {
                remote: latest.block.number,
                local: head.number,
            });
        }
        if latest.block.number == head.number && latest.block.hash == head.hash {
            return Ok(PollOutcome::Unchanged);
        }

        // Walk back from the remote head until a parent matches the local chain.
        let mut search = AncestorSearch::new(self.max_reorg_depth);
        let mut fetched: HashMap<String, BlockWithTransactions> = HashMap::new();
        let mut current = latest;
        let ancestor = loop {
            let step = search.step(current.block.clone(), &tracker);
            fetched.insert(current.block.hash.clone(), current);
            match step {
                SearchStep::Found { ancestor } => break ancestor,
                SearchStep::NeedParent { hash, .. } => {
                    current = self.fetcher.block_by_hash(&hash).await?;
                }
                SearchStep::Exceeded { searched_to } => {
                    return Err(IndexerError::ReorgDepthExceeded {
                        chain_id: self.chain_id,
                        max_depth: self.max_reorg_depth,
                        searched_to,
                    });
                }
            }
        };
        let branch = search.into_branch();

        let reorg = if ancestor.number < head.number {
            let dropped = dropped_blocks(&tracker, &ancestor);
            self.store
                .delete_unfinalized_data(self.chain_id, ancestor.number + 1)
                .await?;
            tracker.rewind_to(ancestor.number);
            tracing::warn!(
                chain_id = self.chain_id,
                network = %self.network,
                depth = dropped.len(),
                common_ancestor = ancestor.number,
                new_head = branch.last().map_or(ancestor.number, |b| b.number),
                "Chain reorganization detected"
            );
            emit(
                &self.events,
                SyncEvent::ShallowReorg {
                    chain_id: self.chain_id,
                    common_ancestor_timestamp: ancestor.timestamp,
                },
            );
            Some(ReorgResolution {
                common_ancestor: ancestor,
                dropped,
                new_branch: branch.clone(),
            })
        } else {
            None
        };

        let ingested = branch.len();
        for block in branch {
            let full = match fetched.remove(&block.hash) {
                Some(full) => full,
                None => self.fetcher.block_by_hash(&block.hash).await?,
            };
            self.ingest(&mut tracker, full).await?;
        }

        self.finalize(&mut tracker).await?;

        Ok(match reorg {
            Some(resolution) => PollOutcome::Reorged(resolution),
            None => PollOutcome::Extended { blocks: ingested },
        })
    }

    async fn ingest(&self, tracker: &mut BlockTracker, full: BlockWithTransactions) -> Result<(), IndexerError> {
        let block = &full.block;
        let mut logs: Vec<Log> = Vec::new();
        for filter in self.filters.iter().filter(|f| f.contains_block(block.number)) {
            for log in self.fetcher.logs_at_block(filter, &block.hash).await? {
                if !logs.iter().any(|l| l.log_index == log.log_index) {
                    logs.push(log);
                }
            }
        }
        logs.sort_by_key(|l| l.log_index);

        let transactions = full.transactions_for(&logs);
        self.store
            .insert_unfinalized_block(self.chain_id, block, &transactions, &logs)
            .await?;
        tracker.push(block.clone()).map_err(|depth| {
            IndexerError::Other(format!(
                "block {} does not extend the local head (depth {depth})",
                block.number
            ))
        })?;

        tracing::debug!(
            chain_id = self.chain_id,
            block = block.number,
            logs = logs.len(),
            "Ingested realtime block"
        );
        emit(
            &self.events,
            SyncEvent::RealtimeCheckpoint {
                chain_id: self.chain_id,
                timestamp: block.timestamp,
            },
        );
        Ok(())
    }

    async fn finalize(&self, tracker: &mut BlockTracker) -> Result<(), IndexerError> {
        let (Some(head), Some(finalized)) = (tracker.head(), tracker.finalized()) else {
            return Ok(());
        };
        let target = head.number.saturating_sub(self.finality_block_count);
        if target <= finalized.number {
            return Ok(());
        }

        self.store.finalize_data(self.chain_id, target).await?;
        if let Some(anchor) = tracker.finalize_through(target) {
            tracing::debug!(chain_id = self.chain_id, block = anchor.number, "Finalized");
            emit(
                &self.events,
                SyncEvent::FinalityCheckpoint {
                    chain_id: self.chain_id,
                    timestamp: anchor.timestamp,
                },
            );
        }
        Ok(())
    }
}
