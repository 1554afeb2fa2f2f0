//! Pipeline: wires the per-network sync services, the aggregator, and the
//! handler service together and owns their lifecycle.
//!
//! ```text
//!  HistoricalSyncService ─┐
//!                         ├─ SyncEvent ─▶ EventAggregatorService ─ AggregatorEvent ─▶ EventHandlerService
//!  RealtimeSyncService  ──┘                                                            │
//!         (× network)                                                                  └─ HandlerEvent ─▶ readiness
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chainreplay_core::config::IndexerConfig;
use chainreplay_core::context::HandlerEnv;
use chainreplay_core::decoder::EventDecoder;
use chainreplay_core::error::IndexerError;
use chainreplay_core::handler::HandlerFunctions;
use chainreplay_core::provider::ChainProvider;
use chainreplay_core::schema::Schema;
use chainreplay_core::signals::{HandlerEvent, SyncReceiver};
use chainreplay_core::store::{EventStore, UserStore};
use chainreplay_core::types::ChainId;
use chainreplay_core::user_error::UserErrorReporter;
use chainreplay_sync::{HistoricalSyncService, RealtimeSyncService, SyncPlan};

use crate::aggregator::EventAggregatorService;
use crate::handlers::{EventHandlerService, ResetOutcome};

struct NetworkServices {
    name: String,
    historical: HistoricalSyncService,
    realtime: RealtimeSyncService,
}

/// The assembled indexer.
pub struct Pipeline {
    config: IndexerConfig,
    event_store: Arc<dyn EventStore>,
    user_store: Arc<dyn UserStore>,
    networks: Vec<NetworkServices>,
    aggregator: Arc<EventAggregatorService>,
    handlers: Arc<EventHandlerService>,
    sync_events: Mutex<Option<SyncReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    historical_processing_complete: Arc<AtomicBool>,
    killed: AtomicBool,
}

impl Pipeline {
    /// Resolve the config and build every service. Each network needs a
    /// provider keyed by its chain id.
    pub fn new(
        config: IndexerConfig,
        providers: HashMap<ChainId, Arc<dyn ChainProvider>>,
        event_store: Arc<dyn EventStore>,
        user_store: Arc<dyn UserStore>,
        decoder: Arc<dyn EventDecoder>,
    ) -> Result<Self, IndexerError> {
        let config = config.resolve()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut networks = Vec::with_capacity(config.networks.len());
        for network in &config.networks {
            let provider = providers.get(&network.chain_id).cloned().ok_or_else(|| {
                IndexerError::Config(format!(
                    "no provider for network \"{}\" (chain {})",
                    network.name, network.chain_id
                ))
            })?;
            let filters: Vec<_> = config
                .log_filters
                .iter()
                .filter(|f| f.chain_id == network.chain_id)
                .cloned()
                .collect();
            networks.push(NetworkServices {
                name: network.name.clone(),
                historical: HistoricalSyncService::new(
                    network,
                    filters.clone(),
                    provider.clone(),
                    event_store.clone(),
                    &config.tuning,
                    tx.clone(),
                ),
                realtime: RealtimeSyncService::new(
                    network,
                    filters,
                    provider,
                    event_store.clone(),
                    &config.tuning,
                    tx.clone(),
                ),
            });
        }

        let aggregator = Arc::new(EventAggregatorService::new(&config, event_store.clone(), decoder));
        let env = HandlerEnv {
            user_store: user_store.clone(),
            event_store: event_store.clone(),
            providers: Arc::new(providers),
            contracts: Arc::new(config.contracts.clone()),
        };
        let handlers = Arc::new(EventHandlerService::new(
            aggregator.clone(),
            env,
            config.log_filters.clone(),
            UserErrorReporter::new(),
        ));

        Ok(Self {
            config,
            event_store,
            user_store,
            networks,
            aggregator,
            handlers,
            sync_events: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
            historical_processing_complete: Arc::new(AtomicBool::new(false)),
            killed: AtomicBool::new(false),
        })
    }

    /// Migrate the event store, install handlers and schema, then start
    /// every network and the processing loops.
    pub async fn start(&self, handlers: HandlerFunctions, schema: Schema) -> Result<(), IndexerError> {
        let sync_events = self
            .sync_events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| IndexerError::Other("pipeline already started".into()))?;

        self.event_store.migrate_up().await?;
        self.handlers.reset(Some(handlers), Some(schema)).await?;

        // Subscribe before anything can emit.
        let aggregator_events = self.aggregator.subscribe();
        let handler_events = self.handlers.subscribe();
        {
            let mut tasks = self.tasks.lock().unwrap();
            let aggregator = self.aggregator.clone();
            tasks.push(tokio::spawn(async move { aggregator.run(sync_events).await }));
            let handlers = self.handlers.clone();
            tasks.push(tokio::spawn(async move { handlers.run(aggregator_events).await }));
            tasks.push(tokio::spawn(watch_readiness(
                self.aggregator.clone(),
                self.historical_processing_complete.clone(),
                handler_events,
            )));
        }

        for network in &self.networks {
            let realtime = network.realtime.setup().await?;
            let plan = network.historical.setup(realtime.finalized_block_number).await?;
            tracing::info!(
                network = %network.name,
                latest = realtime.latest_block_number,
                finalized = realtime.finalized_block_number,
                tasks = plan.tasks.len(),
                total_blocks = plan.total_blocks(),
                cached_blocks = plan.cached_blocks(),
                "Network ready"
            );
            network.historical.start();
            network.realtime.start();
        }

        // Fully cached networks may already have moved the checkpoint.
        self.handlers.process_events().await?;
        tracing::info!(networks = self.networks.len(), "Pipeline started");
        Ok(())
    }

    /// Hot-swap handlers and/or schema, then reprocess from zero.
    pub async fn reload(
        &self,
        handlers: Option<HandlerFunctions>,
        schema: Option<Schema>,
    ) -> Result<ResetOutcome, IndexerError> {
        let outcome = self.handlers.reset(handlers, schema).await?;
        if outcome == ResetOutcome::Applied {
            self.historical_processing_complete.store(false, Ordering::SeqCst);
            self.handlers.process_events().await?;
        }
        Ok(outcome)
    }

    /// `true` once every network finished its backfill and the handlers
    /// have caught up with it.
    pub fn is_historical_processing_complete(&self) -> bool {
        self.historical_processing_complete.load(Ordering::SeqCst)
            || self
                .aggregator
                .historical_sync_completed_at()
                .map_or(false, |at| self.handlers.watermark() >= at)
    }

    /// Stop everything and tear down the user store. Idempotent.
    pub async fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.aggregator.clear_listeners();
        for network in &self.networks {
            network.historical.kill().await;
            network.realtime.kill().await;
        }
        self.handlers.kill().await;

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        if let Err(err) = self.user_store.teardown().await {
            tracing::warn!(error = %err, "User store teardown failed");
        }
        tracing::info!("Pipeline stopped");
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<EventAggregatorService> {
        &self.aggregator
    }

    pub fn handler_service(&self) -> &Arc<EventHandlerService> {
        &self.handlers
    }

    /// Historical plan per network name, once `start` has run.
    pub fn plans(&self) -> Vec<(String, Option<SyncPlan>)> {
        self.networks
            .iter()
            .map(|n| (n.name.clone(), n.historical.plan()))
            .collect()
    }
}

async fn watch_readiness(
    aggregator: Arc<EventAggregatorService>,
    flag: Arc<AtomicBool>,
    mut events: mpsc::UnboundedReceiver<HandlerEvent>,
) {
    while let Some(HandlerEvent::EventsProcessed { to_timestamp }) = events.recv().await {
        let Some(at) = aggregator.historical_sync_completed_at() else {
            continue;
        };
        if to_timestamp >= at && !flag.swap(true, Ordering::SeqCst) {
            tracing::info!(timestamp = at, "Historical events processed");
        }
    }
}
