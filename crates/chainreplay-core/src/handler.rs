//! User handler traits + registry.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LogFilter;
use crate::context::HandlerContext;
use crate::error::IndexerError;
use crate::types::LogEvent;

/// Handler for one `(logFilterName, eventName)` pair.
#[async_trait]
pub trait LogEventHandler: Send + Sync {
    async fn handle(&self, event: &LogEvent, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Runs once before the first event of every (re)start from zero.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    async fn setup(&self, ctx: &HandlerContext) -> anyhow::Result<()>;
}

// ─── Closure adapters ─────────────────────────────────────────────────────────

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> LogEventHandler for FnHandler<F>
where
    F: Fn(LogEvent, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &LogEvent, ctx: &HandlerContext) -> anyhow::Result<()> {
        (self.0)(event.clone(), ctx.clone()).await
    }
}

pub struct FnSetup<F>(F);

#[async_trait]
impl<F, Fut> SetupHandler for FnSetup<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn setup(&self, ctx: &HandlerContext) -> anyhow::Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a [`LogEventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn LogEventHandler>
where
    F: Fn(LogEvent, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap an async closure as a [`SetupHandler`].
pub fn setup_fn<F, Fut>(f: F) -> Arc<dyn SetupHandler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSetup(f))
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// The full set of user handlers. Swapped wholesale on reset.
#[derive(Clone, Default)]
pub struct HandlerFunctions {
    setup: Option<Arc<dyn SetupHandler>>,
    /// logFilterName → safe event name → handler
    events: HashMap<String, HashMap<String, Arc<dyn LogEventHandler>>>,
}

impl HandlerFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_setup(mut self, handler: Arc<dyn SetupHandler>) -> Self {
        self.setup = Some(handler);
        self
    }

    pub fn on_event(mut self, log_filter: &str, event_name: &str, handler: Arc<dyn LogEventHandler>) -> Self {
        self.events
            .entry(log_filter.to_string())
            .or_default()
            .insert(event_name.to_string(), handler);
        self
    }

    pub fn setup(&self) -> Option<&Arc<dyn SetupHandler>> {
        self.setup.as_ref()
    }

    pub fn has_setup(&self) -> bool {
        self.setup.is_some()
    }

    pub fn get(&self, log_filter: &str, event_name: &str) -> Option<&Arc<dyn LogEventHandler>> {
        self.events.get(log_filter)?.get(event_name)
    }

    pub fn is_handled(&self, log_filter: &str, event_name: &str) -> bool {
        self.get(log_filter, event_name).is_some()
    }

    /// Selectors with a registered handler, per filter name.
    pub fn include_log_filter_events(&self, filters: &[LogFilter]) -> HashMap<String, BTreeSet<String>> {
        filters
            .iter()
            .map(|f| {
                let selectors = f
                    .events
                    .iter()
                    .filter(|(_, meta)| self.is_handled(&f.name, &meta.safe_name))
                    .map(|(selector, _)| selector.clone())
                    .collect();
                (f.name.clone(), selectors)
            })
            .collect()
    }

    /// Every registered handler must name a known filter and event.
    pub fn validate(&self, filters: &[LogFilter]) -> Result<(), IndexerError> {
        for (filter_name, events) in &self.events {
            let filter = filters.iter().find(|f| &f.name == filter_name).ok_or_else(|| {
                IndexerError::Config(format!("handler registered for unknown log filter \"{filter_name}\""))
            })?;
            for event_name in events.keys() {
                if filter.selector_for_name(event_name).is_none() {
                    return Err(IndexerError::Config(format!(
                        "handler registered for unknown event \"{filter_name}:{event_name}\""
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut labels: Vec<String> = self
            .events
            .iter()
            .flat_map(|(filter, events)| events.keys().map(move |e| format!("{filter}:{e}")))
            .collect();
        labels.sort();
        f.debug_struct("HandlerFunctions")
            .field("setup", &self.setup.is_some())
            .field("events", &labels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventMetadata;
    use std::collections::BTreeMap;

    fn filter() -> LogFilter {
        let mut events = BTreeMap::new();
        events.insert(
            "0xddf2".to_string(),
            EventMetadata {
                safe_name: "Transfer".into(),
                signature: "Transfer(address,address,uint256)".into(),
            },
        );
        events.insert(
            "0x8c5b".to_string(),
            EventMetadata {
                safe_name: "Approval".into(),
                signature: "Approval(address,address,uint256)".into(),
            },
        );
        LogFilter {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id: 1,
            addresses: vec![],
            topics: vec![],
            start_block: 0,
            end_block: None,
            events,
        }
    }

    #[test]
    fn include_only_handled_selectors() {
        let handlers = HandlerFunctions::new()
            .on_event("Token", "Transfer", handler_fn(|_e, _c| async { Ok(()) }));
        let include = handlers.include_log_filter_events(&[filter()]);
        assert_eq!(include["Token"], BTreeSet::from(["0xddf2".to_string()]));
        assert!(!handlers.has_setup());
        assert!(handlers.is_handled("Token", "Transfer"));
        assert!(!handlers.is_handled("Token", "Approval"));
    }

    #[test]
    fn validate_rejects_unknown_event() {
        let handlers = HandlerFunctions::new()
            .on_event("Token", "Mint", handler_fn(|_e, _c| async { Ok(()) }));
        assert!(matches!(
            handlers.validate(&[filter()]),
            Err(IndexerError::Config(msg)) if msg.contains("Token:Mint")
        ));

        let handlers = HandlerFunctions::new()
            .on_event("Pool", "Swap", handler_fn(|_e, _c| async { Ok(()) }));
        assert!(handlers.validate(&[filter()]).is_err());
    }
}
