//! chainreplay-storage: pluggable store backends for ChainReplay.
//!
//! Backends:
//! - [`memory`]: in-memory event store and versioned user store (dev/testing, no persistence)
//! - `sqlite`: SQLite event store via `sqlx` (embedded, single-file persistence)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryEventStore, MemoryUserStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;
