//! Typed signals exchanged between pipeline components.
//!
//! Sync services push [`SyncEvent`]s into a single channel owned by the
//! aggregator. The aggregator and the handler service fan their own events
//! out to any number of subscribers through [`Listeners`].

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::types::ChainId;

/// Per-network progress reported by the sync services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    HistoricalCheckpoint { chain_id: ChainId, timestamp: u64 },
    SyncComplete { chain_id: ChainId },
    RealtimeCheckpoint { chain_id: ChainId, timestamp: u64 },
    FinalityCheckpoint { chain_id: ChainId, timestamp: u64 },
    ShallowReorg { chain_id: ChainId, common_ancestor_timestamp: u64 },
    /// The network's pipeline stopped on a fatal error.
    SyncFailed { chain_id: ChainId, error: String },
}

impl SyncEvent {
    pub fn chain_id(&self) -> ChainId {
        match self {
            Self::HistoricalCheckpoint { chain_id, .. }
            | Self::SyncComplete { chain_id }
            | Self::RealtimeCheckpoint { chain_id, .. }
            | Self::FinalityCheckpoint { chain_id, .. }
            | Self::ShallowReorg { chain_id, .. }
            | Self::SyncFailed { chain_id, .. } => *chain_id,
        }
    }
}

pub type SyncSender = mpsc::UnboundedSender<SyncEvent>;
pub type SyncReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Emitted by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorEvent {
    NewCheckpoint { timestamp: u64 },
    Reorg { common_ancestor_timestamp: u64 },
}

/// Emitted by the handler service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerEvent {
    EventsProcessed { to_timestamp: u64 },
}

/// Send a sync event, ignoring a closed channel (the aggregator is gone).
pub fn emit(tx: &SyncSender, event: SyncEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("sync event dropped, receiver closed");
    }
}

/// A set of subscribers, each with its own unbounded channel.
#[derive(Debug)]
pub struct Listeners<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Listeners<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber; closed ones are dropped.
    pub fn emit(&self, event: T) {
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn clear(&self) {
        self.senders.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_fan_out_and_prune_closed() {
        let listeners = Listeners::new();
        let mut a = listeners.subscribe();
        let b = listeners.subscribe();
        drop(b);

        listeners.emit(HandlerEvent::EventsProcessed { to_timestamp: 5 });
        assert_eq!(
            a.try_recv().unwrap(),
            HandlerEvent::EventsProcessed { to_timestamp: 5 }
        );
        assert_eq!(listeners.len(), 1);

        listeners.clear();
        assert!(listeners.is_empty());
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn sync_event_chain_id() {
        let ev = SyncEvent::ShallowReorg {
            chain_id: 5,
            common_ancestor_timestamp: 1,
        };
        assert_eq!(ev.chain_id(), 5);
    }
}
