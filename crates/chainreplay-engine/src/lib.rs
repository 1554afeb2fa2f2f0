//! chainreplay-engine — turns per-network sync progress into one ordered
//! replay through user handlers.
//!
//! - [`EventAggregatorService`] folds sync events into a global checkpoint
//!   and serves event pages below it.
//! - [`EventHandlerService`] applies those pages to the user store, one task
//!   at a time, and rolls back on reorgs.
//! - [`Pipeline`] builds both plus every network's sync services and owns
//!   their lifecycle.

pub mod aggregator;
pub mod handlers;
pub mod pipeline;

pub use aggregator::EventAggregatorService;
pub use handlers::{
    EventHandlerService, HandlerHealth, HandlerStats, ProcessOutcome, ReorgOutcome, ResetOutcome,
};
pub use pipeline::Pipeline;
