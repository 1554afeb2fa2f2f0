//! Event handler service: replays the aggregated event stream through user
//! handlers exactly once, in order, one task at a time.
//!
//! Every state transition (`process_events`, `reset`, `handle_reorg`) runs
//! under one [`GenerationLock`]. `reset` starts a new generation, which
//! turns every waiter from the old one into [`ProcessOutcome::Cancelled`] and
//! makes an in-flight pass stop before its next task.
//!
//! A failing handler faults the service: the rest of the pass is dropped and
//! nothing else is processed until `reset`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use chainreplay_core::config::LogFilter;
use chainreplay_core::context::HandlerEnv;
use chainreplay_core::error::IndexerError;
use chainreplay_core::handler::HandlerFunctions;
use chainreplay_core::lock::{GenerationGuard, GenerationLock};
use chainreplay_core::queue::{HandlerTask, TaskQueue};
use chainreplay_core::schema::Schema;
use chainreplay_core::signals::{AggregatorEvent, HandlerEvent, Listeners};
use chainreplay_core::store::PageMetadata;
use chainreplay_core::user_error::{UserErrorReporter, UserHandlerError, SETUP_LABEL};

use crate::aggregator::EventAggregatorService;

// ─── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Events up to `to_timestamp` were applied.
    Processed { to_timestamp: u64, events: usize },
    /// The watermark already covers the global checkpoint.
    UpToDate,
    /// A previous handler error froze processing until `reset`.
    Frozen,
    /// Handlers or schema have not been provided yet.
    NotReady,
    /// A handler failed during this pass.
    Failed(Arc<UserHandlerError>),
    /// A `reset` or `kill` invalidated this call.
    Cancelled,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgOutcome {
    /// User store writes after `to_timestamp` were reverted.
    Reverted { from_timestamp: u64, to_timestamp: u64 },
    /// Nothing was processed past the ancestor.
    NoOp,
    /// Faulted; the next reset wipes the store anyway.
    Frozen,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Applied,
    /// Still waiting for handlers or schema.
    Pending,
    Cancelled,
}

/// Pipeline health.
#[derive(Debug, Clone)]
pub enum HandlerHealth {
    Running,
    Faulted(Arc<UserHandlerError>),
}

/// Per-handler counters keyed by `"{logFilterName}:{eventName}"` or `"setup"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    /// Every matched log, handled or not.
    pub matched_events: BTreeMap<String, u64>,
    /// Matched logs with a registered handler.
    pub handled_events: BTreeMap<String, u64>,
    /// Tasks that ran to completion.
    pub processed_events: BTreeMap<String, u64>,
    pub has_error: bool,
    pub latest_processed_timestamp: u64,
}

// ─── Service ──────────────────────────────────────────────────────────────────

struct HandlerState {
    handlers: Option<HandlerFunctions>,
    schema: Option<Schema>,
    /// Everything at or below this timestamp has been applied. 0 means
    /// nothing, not even setup.
    watermark: u64,
    health: HandlerHealth,
    stats: HandlerStats,
    killed: bool,
}

enum TaskFailure {
    Cancelled,
    Handler(Arc<UserHandlerError>),
}

pub struct EventHandlerService {
    aggregator: Arc<EventAggregatorService>,
    env: HandlerEnv,
    log_filters: Vec<LogFilter>,
    lock: GenerationLock,
    state: Mutex<HandlerState>,
    reporter: UserErrorReporter,
    listeners: Listeners<HandlerEvent>,
}

impl EventHandlerService {
    pub fn new(
        aggregator: Arc<EventAggregatorService>,
        env: HandlerEnv,
        log_filters: Vec<LogFilter>,
        reporter: UserErrorReporter,
    ) -> Self {
        Self {
            aggregator,
            env,
            log_filters,
            lock: GenerationLock::new(),
            state: Mutex::new(HandlerState {
                handlers: None,
                schema: None,
                watermark: 0,
                health: HandlerHealth::Running,
                stats: HandlerStats::default(),
                killed: false,
            }),
            reporter,
            listeners: Listeners::new(),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<HandlerEvent> {
        self.listeners.subscribe()
    }

    pub fn reporter(&self) -> &UserErrorReporter {
        &self.reporter
    }

    pub fn watermark(&self) -> u64 {
        self.state.lock().unwrap().watermark
    }

    pub fn health(&self) -> HandlerHealth {
        self.state.lock().unwrap().health.clone()
    }

    pub fn stats(&self) -> HandlerStats {
        self.state.lock().unwrap().stats.clone()
    }

    // ─── process_events ───────────────────────────────────────────────────────

    /// Apply every event between the watermark and the global checkpoint.
    pub async fn process_events(&self) -> Result<ProcessOutcome, IndexerError> {
        let guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(cancelled) => {
                tracing::debug!(generation = cancelled.generation, "process_events cancelled");
                return Ok(ProcessOutcome::Cancelled);
            }
        };

        let (handlers, watermark) = {
            let state = self.state.lock().unwrap();
            if state.killed {
                return Ok(ProcessOutcome::Killed);
            }
            if let HandlerHealth::Faulted(_) = state.health {
                return Ok(ProcessOutcome::Frozen);
            }
            let Some(handlers) = state.handlers.clone() else {
                return Ok(ProcessOutcome::NotReady);
            };
            (handlers, state.watermark)
        };

        let to = self.aggregator.checkpoint();
        if watermark >= to {
            return Ok(ProcessOutcome::UpToDate);
        }
        let from = if watermark == 0 { 0 } else { watermark + 1 };
        tracing::debug!(from, to, "Processing events");

        let mut queue = TaskQueue::new();
        if watermark == 0 && handlers.has_setup() {
            queue.push(HandlerTask::Setup);
            if let Err(failure) = self.drain(&guard, &handlers, &mut queue).await {
                return Ok(self.on_failure(failure));
            }
        }

        let include = handlers.include_log_filter_events(&self.log_filters);
        let mut pages = self.aggregator.get_events(from, to, &include);
        let mut processed = 0;
        while let Some(page) = pages.next_page().await? {
            if guard.is_cancelled() {
                return Ok(ProcessOutcome::Cancelled);
            }
            self.record_matched(&handlers, &page.metadata);

            let count = page.events.len();
            queue.extend(page.events.into_iter().map(|e| HandlerTask::Log(Box::new(e))));
            if let Err(failure) = self.drain(&guard, &handlers, &mut queue).await {
                return Ok(self.on_failure(failure));
            }
            if guard.is_cancelled() {
                return Ok(ProcessOutcome::Cancelled);
            }
            processed += count;
            self.advance_watermark(page.metadata.page_ends_at_timestamp);
        }
        if guard.is_cancelled() {
            return Ok(ProcessOutcome::Cancelled);
        }
        self.advance_watermark(to);

        tracing::info!(from, to, events = processed, "Processed events");
        Ok(ProcessOutcome::Processed {
            to_timestamp: to,
            events: processed,
        })
    }

    async fn drain(
        &self,
        guard: &GenerationGuard<'_>,
        handlers: &HandlerFunctions,
        queue: &mut TaskQueue<HandlerTask>,
    ) -> Result<usize, TaskFailure> {
        queue.drain(|task| self.run_task(guard, handlers, task)).await
    }

    async fn run_task(
        &self,
        guard: &GenerationGuard<'_>,
        handlers: &HandlerFunctions,
        task: HandlerTask,
    ) -> Result<(), TaskFailure> {
        if guard.is_cancelled() {
            return Err(TaskFailure::Cancelled);
        }
        match task {
            HandlerTask::Setup => {
                let Some(setup) = handlers.setup() else {
                    return Ok(());
                };
                let ctx = self.env.setup_context();
                setup
                    .setup(&ctx)
                    .await
                    .map_err(|e| TaskFailure::Handler(Arc::new(UserHandlerError::setup(&e))))?;
                self.count_processed(SETUP_LABEL.to_string(), None);
            }
            HandlerTask::Log(event) => {
                let label = event.label();
                if let Some(handler) = handlers.get(&event.log_filter_name, &event.event_name) {
                    let ctx = self.env.event_context(&event);
                    handler.handle(&event, &ctx).await.map_err(|e| {
                        TaskFailure::Handler(Arc::new(UserHandlerError::log_event(&event, &e)))
                    })?;
                }
                self.count_processed(label, Some(event.block.timestamp));
            }
        }
        Ok(())
    }

    fn on_failure(&self, failure: TaskFailure) -> ProcessOutcome {
        match failure {
            TaskFailure::Cancelled => ProcessOutcome::Cancelled,
            TaskFailure::Handler(err) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.health = HandlerHealth::Faulted(err.clone());
                    state.stats.has_error = true;
                }
                tracing::error!(
                    handler = %err.handler,
                    block_number = ?err.block_number,
                    stack = err.stack.as_deref().unwrap_or(""),
                    "{err}"
                );
                self.reporter.report(err.clone());
                ProcessOutcome::Failed(err)
            }
        }
    }

    fn advance_watermark(&self, to_timestamp: u64) {
        let advanced = {
            let mut state = self.state.lock().unwrap();
            if to_timestamp > state.watermark {
                state.watermark = to_timestamp;
                state.stats.latest_processed_timestamp = to_timestamp;
                true
            } else {
                false
            }
        };
        if advanced {
            self.listeners.emit(HandlerEvent::EventsProcessed { to_timestamp });
        }
    }

    fn record_matched(&self, handlers: &HandlerFunctions, metadata: &PageMetadata) {
        let mut state = self.state.lock().unwrap();
        for count in &metadata.counts {
            let Some(filter) = self.log_filters.iter().find(|f| f.name == count.log_filter_name) else {
                continue;
            };
            let Some(event) = filter.event_for_selector(&count.selector) else {
                continue;
            };
            let label = format!("{}:{}", filter.name, event.safe_name);
            *state.stats.matched_events.entry(label.clone()).or_default() += count.count;
            if handlers.is_handled(&filter.name, &event.safe_name) {
                *state.stats.handled_events.entry(label).or_default() += count.count;
            }
        }
    }

    fn count_processed(&self, label: String, timestamp: Option<u64>) {
        let mut state = self.state.lock().unwrap();
        *state.stats.processed_events.entry(label).or_default() += 1;
        if let Some(ts) = timestamp {
            state.stats.latest_processed_timestamp = state.stats.latest_processed_timestamp.max(ts);
        }
    }

    // ─── reset ────────────────────────────────────────────────────────────────

    /// Swap in new handlers and/or schema. Once both are known, cancel any
    /// pending work, rebuild the user store, and rewind to zero. The caller
    /// should follow up with [`process_events`](Self::process_events).
    pub async fn reset(
        &self,
        handlers: Option<HandlerFunctions>,
        schema: Option<Schema>,
    ) -> Result<ResetOutcome, IndexerError> {
        if let Some(handlers) = &handlers {
            handlers.validate(&self.log_filters)?;
        }
        if let Some(schema) = &schema {
            schema.validate()?;
        }

        let schema = {
            let mut state = self.state.lock().unwrap();
            if state.killed {
                return Ok(ResetOutcome::Cancelled);
            }
            if handlers.is_some() {
                state.handlers = handlers;
            }
            if schema.is_some() {
                state.schema = schema;
            }
            match (&state.handlers, &state.schema) {
                (Some(_), Some(schema)) => schema.clone(),
                _ => return Ok(ResetOutcome::Pending),
            }
        };

        let _guard = match self.lock.acquire_fresh().await {
            Ok(guard) => guard,
            Err(_) => return Ok(ResetOutcome::Cancelled),
        };

        self.env.user_store.reload(&schema).await?;
        {
            let mut state = self.state.lock().unwrap();
            state.watermark = 0;
            state.health = HandlerHealth::Running;
            state.stats = HandlerStats::default();
        }
        self.reporter.clear();
        tracing::info!(entities = schema.entities.len(), "Handler service reset");
        Ok(ResetOutcome::Applied)
    }

    // ─── handle_reorg ─────────────────────────────────────────────────────────

    /// Roll the user store back to `common_ancestor_timestamp` if anything
    /// past it was applied.
    pub async fn handle_reorg(&self, common_ancestor_timestamp: u64) -> Result<ReorgOutcome, IndexerError> {
        let _guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(_) => return Ok(ReorgOutcome::Cancelled),
        };

        let watermark = {
            let state = self.state.lock().unwrap();
            if state.killed {
                return Ok(ReorgOutcome::Cancelled);
            }
            if let HandlerHealth::Faulted(_) = state.health {
                return Ok(ReorgOutcome::Frozen);
            }
            state.watermark
        };
        if watermark <= common_ancestor_timestamp {
            tracing::debug!(watermark, common_ancestor_timestamp, "Reorg above watermark, nothing to revert");
            return Ok(ReorgOutcome::NoOp);
        }

        self.env.user_store.revert(common_ancestor_timestamp).await?;
        {
            let mut state = self.state.lock().unwrap();
            state.watermark = common_ancestor_timestamp;
            state.stats.latest_processed_timestamp = common_ancestor_timestamp;
        }
        tracing::info!(
            from = watermark,
            to = common_ancestor_timestamp,
            "Reverted user store after reorg"
        );
        Ok(ReorgOutcome::Reverted {
            from_timestamp: watermark,
            to_timestamp: common_ancestor_timestamp,
        })
    }

    // ─── lifecycle ────────────────────────────────────────────────────────────

    /// Stop processing for good and wait for an in-flight pass to notice.
    /// Idempotent.
    pub async fn kill(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.killed {
                return;
            }
            state.killed = true;
        }
        self.lock.cancel();
        let _ = self.lock.acquire().await;
        self.listeners.clear();
        tracing::debug!("Handler service killed");
    }

    /// React to aggregator events until the channel closes or the service is
    /// killed.
    pub async fn run(&self, mut events: UnboundedReceiver<AggregatorEvent>) {
        while let Some(event) = events.recv().await {
            if let AggregatorEvent::Reorg {
                common_ancestor_timestamp,
            } = event
            {
                if let Err(err) = self.handle_reorg(common_ancestor_timestamp).await {
                    tracing::error!(error = %err, "Reorg rollback failed");
                }
            }
            match self.process_events().await {
                Ok(ProcessOutcome::Killed) => break,
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "Event processing failed"),
            }
        }
    }
}
