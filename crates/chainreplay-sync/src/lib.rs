//! chainreplay-sync — per-network historical backfill and realtime tailing.
//!
//! Both services write into an [`EventStore`](chainreplay_core::EventStore)
//! and report progress as [`SyncEvent`](chainreplay_core::SyncEvent)s on a
//! channel owned by the aggregator.

pub mod builder;
pub mod fetcher;
pub mod historical;
pub mod realtime;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use builder::{ConfigBuilder, LogFilterBuilder, NetworkBuilder};
pub use fetcher::LogFetcher;
pub use historical::{FilterProgress, HistoricalSyncService, SyncPlan, SyncTask};
pub use realtime::{PollOutcome, RealtimeSetup, RealtimeSyncService};
