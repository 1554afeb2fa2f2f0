//! Pull-based page iterator over matched log events.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LogFilter;
use crate::cursor::EventCursor;
use crate::decoder::EventDecoder;
use crate::error::IndexerError;
use crate::store::{EventStore, LogEventQuery, PageMetadata, RawLogEvent};
use crate::types::LogEvent;

/// A decoded page of events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<LogEvent>,
    pub metadata: PageMetadata,
}

/// Produces pages on demand, one store query per [`next_page`] call.
///
/// Finite and single-use: once `None` is returned the iterator is exhausted.
///
/// [`next_page`]: LogEventPages::next_page
pub struct LogEventPages {
    store: Arc<dyn EventStore>,
    decoder: Arc<dyn EventDecoder>,
    query: LogEventQuery,
    filters: HashMap<String, LogFilter>,
    cursor: Option<EventCursor>,
    done: bool,
}

impl LogEventPages {
    pub fn new(store: Arc<dyn EventStore>, decoder: Arc<dyn EventDecoder>, query: LogEventQuery) -> Self {
        let filters = query
            .filters
            .iter()
            .map(|f| (f.filter.name.clone(), f.filter.clone()))
            .collect();
        let done = query.from_timestamp > query.to_timestamp || query.filters.is_empty();
        Self {
            store,
            decoder,
            query,
            filters,
            cursor: None,
            done,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<EventPage>, IndexerError> {
        if self.done {
            return Ok(None);
        }
        let raw = self
            .store
            .get_log_events_page(&self.query, self.cursor.as_ref())
            .await?;

        let events = raw
            .events
            .into_iter()
            .map(|e| self.decode(e))
            .collect::<Result<Vec<_>, _>>()?;

        self.cursor = raw.next_cursor;
        self.done = self.cursor.is_none();
        Ok(Some(EventPage {
            events,
            metadata: raw.metadata,
        }))
    }

    fn decode(&self, raw: RawLogEvent) -> Result<LogEvent, IndexerError> {
        let filter = self.filters.get(&raw.log_filter_name).ok_or_else(|| {
            IndexerError::Decode(format!("unknown log filter \"{}\"", raw.log_filter_name))
        })?;
        let meta = filter.event_for_selector(&raw.selector).ok_or_else(|| {
            IndexerError::Decode(format!(
                "log filter \"{}\" has no event with selector {}",
                filter.name, raw.selector
            ))
        })?;
        let params = self.decoder.decode(filter, meta, &raw.log)?;
        Ok(LogEvent {
            log_filter_name: raw.log_filter_name,
            chain_id: raw.chain_id,
            event_name: meta.safe_name.clone(),
            selector: raw.selector,
            block: raw.block,
            transaction: raw.transaction,
            log: raw.log,
            params,
        })
    }
}
