//! chainreplay-core — foundation for the multi-chain event replay pipeline.
//!
//! # Architecture
//!
//! ```text
//! HistoricalSyncService ─┐                         (per network)
//! RealtimeSyncService  ──┴─ SyncEvent ─→ EventAggregatorService
//!                                              │  global checkpoint
//!                                              ▼
//!                         EventStore ─→ LogEventPages ─→ EventHandlerService ─→ UserStore
//! ```
//!
//! This crate holds what every stage shares:
//! - data model ([`types`], [`config`]) and error taxonomy ([`error`])
//! - sync algebra: [`cached_range`], [`tracker`], [`reorg`], [`retry`]
//! - ordering: [`cursor`], [`checkpoint`], [`pages`]
//! - handler plumbing: [`handler`], [`context`], [`lock`], [`queue`], [`user_error`]
//! - collaborator contracts: [`store`], [`provider`], [`decoder`], [`schema`]

pub mod cached_range;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod handler;
pub mod lock;
pub mod pages;
pub mod provider;
pub mod queue;
pub mod reorg;
pub mod retry;
pub mod schema;
pub mod signals;
pub mod store;
pub mod tracker;
pub mod types;
pub mod user_error;

pub use cached_range::CachedRange;
pub use checkpoint::{ChainCheckpoints, CheckpointTable};
pub use config::{ContractConfig, EventMetadata, IndexerConfig, LogFilter, Network, SyncTuning};
pub use context::{Entities, HandlerContext, HandlerEnv, ReadOnlyContracts};
pub use cursor::EventCursor;
pub use decoder::{EventDecoder, RawLogDecoder};
pub use error::{Cancelled, IndexerError, ProviderError};
pub use handler::{handler_fn, setup_fn, HandlerFunctions, LogEventHandler, SetupHandler};
pub use lock::{GenerationGuard, GenerationLock};
pub use pages::{EventPage, LogEventPages};
pub use provider::{BlockTag, CallRequest, ChainProvider, LogRange, LogRequest};
pub use queue::{HandlerTask, TaskQueue};
pub use reorg::{AncestorSearch, ReorgResolution, SearchStep};
pub use retry::{RetryConfig, RetryPolicy};
pub use schema::{EntityInstance, FindManyQuery, Schema};
pub use signals::{AggregatorEvent, HandlerEvent, Listeners, SyncEvent};
pub use store::{EventStore, UserStore};
pub use tracker::BlockTracker;
pub use types::{Block, BlockWithTransactions, ChainId, Log, LogEvent, Transaction};
pub use user_error::{UserErrorReporter, UserHandlerError};
