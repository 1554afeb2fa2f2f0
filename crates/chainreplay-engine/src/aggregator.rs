//! Event aggregator: merges per-network sync progress into one global
//! checkpoint and serves ordered event pages below it.
//!
//! The aggregator owns the receiving end of the sync channel. Events are
//! applied in arrival order; everything already queued is handled as one
//! batch so that several networks reorging at once produce a single `Reorg`
//! carrying the smallest common-ancestor timestamp.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chainreplay_core::checkpoint::{ChainCheckpoints, CheckpointTable};
use chainreplay_core::config::{IndexerConfig, LogFilter};
use chainreplay_core::decoder::EventDecoder;
use chainreplay_core::pages::LogEventPages;
use chainreplay_core::signals::{AggregatorEvent, Listeners, SyncEvent, SyncReceiver};
use chainreplay_core::store::{EventStore, LogEventFilter, LogEventQuery};
use chainreplay_core::types::ChainId;

struct AggregatorState {
    table: CheckpointTable,
    checkpoint: u64,
    historical_sync_completed_at: Option<u64>,
}

/// Single source of truth for how far it is safe to read.
pub struct EventAggregatorService {
    store: Arc<dyn EventStore>,
    decoder: Arc<dyn EventDecoder>,
    log_filters: Vec<LogFilter>,
    page_size: usize,
    state: Mutex<AggregatorState>,
    listeners: Listeners<AggregatorEvent>,
}

impl EventAggregatorService {
    pub fn new(config: &IndexerConfig, store: Arc<dyn EventStore>, decoder: Arc<dyn EventDecoder>) -> Self {
        Self {
            store,
            decoder,
            log_filters: config.log_filters.clone(),
            page_size: config.tuning.event_page_size.max(1),
            state: Mutex::new(AggregatorState {
                table: CheckpointTable::new(config.networks.iter().map(|n| n.chain_id)),
                checkpoint: 0,
                historical_sync_completed_at: None,
            }),
            listeners: Listeners::new(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<AggregatorEvent> {
        self.listeners.subscribe()
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    /// Global checkpoint: every network has delivered all events at or
    /// below this timestamp.
    pub fn checkpoint(&self) -> u64 {
        self.state.lock().unwrap().checkpoint
    }

    /// Highest historical checkpoint, recorded once every network finished
    /// its backfill.
    pub fn historical_sync_completed_at(&self) -> Option<u64> {
        self.state.lock().unwrap().historical_sync_completed_at
    }

    pub fn chain_checkpoints(&self, chain_id: ChainId) -> Option<ChainCheckpoints> {
        self.state.lock().unwrap().table.get(chain_id).copied()
    }

    // ─── Sync event handlers ──────────────────────────────────────────────────

    pub fn handle_new_historical_checkpoint(&self, chain_id: ChainId, timestamp: u64) {
        self.handle_sync_event(SyncEvent::HistoricalCheckpoint { chain_id, timestamp });
    }

    pub fn handle_historical_sync_complete(&self, chain_id: ChainId) {
        self.handle_sync_event(SyncEvent::SyncComplete { chain_id });
    }

    pub fn handle_new_realtime_checkpoint(&self, chain_id: ChainId, timestamp: u64) {
        self.handle_sync_event(SyncEvent::RealtimeCheckpoint { chain_id, timestamp });
    }

    pub fn handle_new_finality_checkpoint(&self, chain_id: ChainId, timestamp: u64) {
        self.handle_sync_event(SyncEvent::FinalityCheckpoint { chain_id, timestamp });
    }

    /// Lower the network's realtime checkpoint to the ancestor and tell
    /// consumers to roll back.
    pub fn handle_reorg(&self, chain_id: ChainId, common_ancestor_timestamp: u64) {
        self.handle_sync_event(SyncEvent::ShallowReorg {
            chain_id,
            common_ancestor_timestamp,
        });
    }

    pub fn handle_sync_event(&self, event: SyncEvent) {
        self.handle_sync_events(std::iter::once(event));
    }

    /// Apply a batch of sync events, then emit at most one `Reorg` followed
    /// by at most one `NewCheckpoint`.
    pub fn handle_sync_events(&self, events: impl IntoIterator<Item = SyncEvent>) {
        let (reorg, checkpoint, advanced) = {
            let mut state = self.state.lock().unwrap();
            let before = state.checkpoint;
            let mut reorg: Option<u64> = None;
            for event in events {
                if let Some(ancestor) = Self::apply(&mut state, event) {
                    reorg = Some(reorg.map_or(ancestor, |r| r.min(ancestor)));
                }
            }
            (reorg, state.checkpoint, state.checkpoint > before)
        };

        if let Some(common_ancestor_timestamp) = reorg {
            tracing::info!(common_ancestor_timestamp, checkpoint, "Reorg");
            self.listeners.emit(AggregatorEvent::Reorg {
                common_ancestor_timestamp,
            });
        }
        if advanced || (reorg.is_some() && checkpoint > 0) {
            tracing::debug!(checkpoint, "New checkpoint");
            self.listeners
                .emit(AggregatorEvent::NewCheckpoint { timestamp: checkpoint });
        }
    }

    /// Returns the common-ancestor timestamp for a reorg.
    fn apply(state: &mut AggregatorState, event: SyncEvent) -> Option<u64> {
        let mut reorg = None;
        match event {
            SyncEvent::HistoricalCheckpoint { chain_id, timestamp } => {
                let chain = state.table.entry(chain_id);
                chain.historical_checkpoint = chain.historical_checkpoint.max(timestamp);
            }
            SyncEvent::SyncComplete { chain_id } => {
                state.table.entry(chain_id).historical_complete = true;
                tracing::info!(chain_id, "Historical sync complete for network");
                if state.historical_sync_completed_at.is_none() && state.table.all_historical_complete() {
                    let at = state.table.max_historical();
                    state.historical_sync_completed_at = Some(at);
                    tracing::info!(timestamp = at, "Historical sync complete for all networks");
                }
            }
            SyncEvent::RealtimeCheckpoint { chain_id, timestamp } => {
                let chain = state.table.entry(chain_id);
                chain.realtime_checkpoint = chain.realtime_checkpoint.max(timestamp);
            }
            SyncEvent::FinalityCheckpoint { chain_id, timestamp } => {
                let chain = state.table.entry(chain_id);
                chain.finality_checkpoint = chain.finality_checkpoint.max(timestamp);
            }
            SyncEvent::ShallowReorg {
                chain_id,
                common_ancestor_timestamp,
            } => {
                let chain = state.table.entry(chain_id);
                chain.realtime_checkpoint = chain.realtime_checkpoint.min(common_ancestor_timestamp);
                // The only place the global checkpoint may move backwards, and
                // never below the ancestor.
                state.checkpoint = state.checkpoint.min(common_ancestor_timestamp);
                return Some(common_ancestor_timestamp);
            }
            SyncEvent::SyncFailed { chain_id, error } => {
                tracing::error!(chain_id, error = %error, "Network sync stopped");
            }
        }
        let global = state.table.global();
        if global > state.checkpoint {
            state.checkpoint = global;
        }
        reorg
    }

    /// Consume sync events until every sender is gone.
    pub async fn run(&self, mut events: SyncReceiver) {
        while let Some(first) = events.recv().await {
            let mut batch = vec![first];
            while let Ok(event) = events.try_recv() {
                batch.push(event);
            }
            self.handle_sync_events(batch);
        }
        tracing::debug!("Sync channel closed, aggregator stopping");
    }

    // ─── Reads ────────────────────────────────────────────────────────────────

    /// Pages of events with timestamps in `[from_timestamp, to_timestamp]`.
    ///
    /// Only selectors listed in `include_log_filter_events` are returned as
    /// events; page metadata counts every selector of every filter.
    pub fn get_events(
        &self,
        from_timestamp: u64,
        to_timestamp: u64,
        include_log_filter_events: &HashMap<String, BTreeSet<String>>,
    ) -> LogEventPages {
        let filters = self
            .log_filters
            .iter()
            .map(|filter| LogEventFilter {
                filter: filter.clone(),
                include_event_selectors: include_log_filter_events
                    .get(&filter.name)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        LogEventPages::new(
            self.store.clone(),
            self.decoder.clone(),
            LogEventQuery {
                from_timestamp,
                to_timestamp,
                filters,
                page_size: self.page_size,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainreplay_core::config::Network;
    use chainreplay_core::decoder::RawLogDecoder;
    use chainreplay_storage::MemoryEventStore;

    fn network(name: &str, chain_id: ChainId, finality_block_count: u64) -> Network {
        Network {
            name: name.into(),
            chain_id,
            rpc_url: format!("http://{name}"),
            polling_interval_ms: 1_000,
            finality_block_count,
        }
    }

    fn aggregator() -> EventAggregatorService {
        let config = IndexerConfig {
            networks: vec![network("a", 1, 2), network("b", 2, 10)],
            ..Default::default()
        };
        EventAggregatorService::new(
            &config,
            Arc::new(MemoryEventStore::new()),
            Arc::new(RawLogDecoder),
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<AggregatorEvent>) -> Vec<AggregatorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn incomplete_network_bounds_the_checkpoint() {
        let agg = aggregator();
        let mut rx = agg.subscribe();

        agg.handle_new_historical_checkpoint(1, 100);
        agg.handle_historical_sync_complete(1);
        assert_eq!(agg.checkpoint(), 0);

        agg.handle_new_historical_checkpoint(2, 50);
        assert_eq!(agg.checkpoint(), 50);
        assert_eq!(drain(&mut rx), vec![AggregatorEvent::NewCheckpoint { timestamp: 50 }]);

        agg.handle_new_realtime_checkpoint(1, 130);
        agg.handle_historical_sync_complete(2);
        agg.handle_new_realtime_checkpoint(2, 120);
        assert_eq!(agg.checkpoint(), 120);
        assert_eq!(agg.historical_sync_completed_at(), Some(100));
    }

    #[test]
    fn checkpoint_never_decreases_without_reorg() {
        let agg = aggregator();
        for chain in [1, 2] {
            agg.handle_new_historical_checkpoint(chain, 200);
            agg.handle_historical_sync_complete(chain);
        }
        assert_eq!(agg.checkpoint(), 200);
        // A stale historical checkpoint cannot pull it back.
        agg.handle_new_historical_checkpoint(1, 150);
        assert_eq!(agg.checkpoint(), 200);
    }

    #[test]
    fn reorg_lowers_checkpoint_to_ancestor() {
        let agg = aggregator();
        for chain in [1, 2] {
            agg.handle_new_historical_checkpoint(chain, 100);
            agg.handle_historical_sync_complete(chain);
            agg.handle_new_realtime_checkpoint(chain, 160);
        }
        assert_eq!(agg.checkpoint(), 160);
        let mut rx = agg.subscribe();

        agg.handle_reorg(1, 140);
        assert_eq!(agg.checkpoint(), 140);
        assert_eq!(agg.chain_checkpoints(1).unwrap().realtime_checkpoint, 140);
        assert_eq!(
            drain(&mut rx),
            vec![
                AggregatorEvent::Reorg {
                    common_ancestor_timestamp: 140
                },
                AggregatorEvent::NewCheckpoint { timestamp: 140 },
            ]
        );

        agg.handle_new_realtime_checkpoint(1, 170);
        assert_eq!(agg.checkpoint(), 160);
    }

    #[test]
    fn reorg_clamps_checkpoint_to_ancestor_only_when_below() {
        let agg = aggregator();
        // Both networks finished history; neither has a realtime checkpoint yet.
        for chain in [1, 2] {
            agg.handle_new_historical_checkpoint(chain, 200);
            agg.handle_historical_sync_complete(chain);
        }
        assert_eq!(agg.checkpoint(), 200);

        agg.handle_reorg(1, 250);
        assert_eq!(agg.checkpoint(), 200);

        agg.handle_reorg(1, 190);
        assert_eq!(agg.checkpoint(), 190);
    }

    #[test]
    fn batched_reorgs_emit_minimum_ancestor_once() {
        let agg = aggregator();
        for chain in [1, 2] {
            agg.handle_new_historical_checkpoint(chain, 100);
            agg.handle_historical_sync_complete(chain);
            agg.handle_new_realtime_checkpoint(chain, 200);
        }
        let mut rx = agg.subscribe();
        agg.handle_sync_events(vec![
            SyncEvent::ShallowReorg {
                chain_id: 1,
                common_ancestor_timestamp: 180,
            },
            SyncEvent::ShallowReorg {
                chain_id: 2,
                common_ancestor_timestamp: 170,
            },
            SyncEvent::RealtimeCheckpoint {
                chain_id: 1,
                timestamp: 190,
            },
        ]);
        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            AggregatorEvent::Reorg {
                common_ancestor_timestamp: 170
            }
        );
        assert_eq!(events.len(), 2);
        assert_eq!(agg.checkpoint(), 170);
    }

    #[tokio::test]
    async fn run_consumes_channel_until_closed() {
        let agg = Arc::new(aggregator());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = {
            let agg = agg.clone();
            tokio::spawn(async move { agg.run(rx).await })
        };
        for chain in [1, 2] {
            tx.send(SyncEvent::HistoricalCheckpoint { chain_id: chain, timestamp: 42 }).unwrap();
        }
        drop(tx);
        task.await.unwrap();
        assert_eq!(agg.checkpoint(), 42);
    }
}
