//! Block and log fetcher.
//!
//! Wraps a [`ChainProvider`] with the retry policy and the `eth_getLogs`
//! window logic used by both sync services: ranges are split into windows of
//! at most `max_block_range` blocks, and a window the node refuses as too
//! large is halved until it fits or reaches `min_block_range`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chainreplay_core::config::{LogFilter, SyncTuning};
use chainreplay_core::error::{IndexerError, ProviderError};
use chainreplay_core::provider::{BlockTag, ChainProvider, LogRange, LogRequest};
use chainreplay_core::retry::RetryPolicy;
use chainreplay_core::types::{BlockWithTransactions, ChainId, Log};

/// Retrying fetcher bound to one network.
#[derive(Clone)]
pub struct LogFetcher {
    provider: Arc<dyn ChainProvider>,
    chain_id: ChainId,
    retry: RetryPolicy,
    max_block_range: u64,
    min_block_range: u64,
}

impl LogFetcher {
    pub fn new(provider: Arc<dyn ChainProvider>, chain_id: ChainId, tuning: &SyncTuning) -> Self {
        Self {
            provider,
            chain_id,
            retry: RetryPolicy::new(tuning.retry.clone()),
            max_block_range: tuning.max_block_range.max(1),
            min_block_range: tuning.min_block_range.max(1),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn fail(&self, err: ProviderError) -> IndexerError {
        IndexerError::provider(self.chain_id, err)
    }

    pub async fn latest_block(&self) -> Result<BlockWithTransactions, IndexerError> {
        self.retry
            .run("eth_getBlockByNumber(latest)", || {
                self.provider.block_by_number(BlockTag::Latest)
            })
            .await
            .map_err(|e| self.fail(e))
    }

    pub async fn block_by_number(&self, number: u64) -> Result<BlockWithTransactions, IndexerError> {
        self.retry
            .run("eth_getBlockByNumber", || {
                self.provider.block_by_number(BlockTag::Number(number))
            })
            .await
            .map_err(|e| self.fail(e))
    }

    pub async fn block_by_hash(&self, hash: &str) -> Result<BlockWithTransactions, IndexerError> {
        self.retry
            .run("eth_getBlockByHash", || self.provider.block_by_hash(hash))
            .await
            .map_err(|e| self.fail(e))
    }

    /// Logs of a single block matching `filter`, ordered by log index.
    pub async fn logs_at_block(&self, filter: &LogFilter, hash: &str) -> Result<Vec<Log>, IndexerError> {
        let request = LogRequest::for_filter(filter, LogRange::BlockHash(hash.to_string()));
        let logs = self
            .retry
            .run("eth_getLogs(blockHash)", || self.provider.logs(&request))
            .await
            .map_err(|e| self.fail(e))?;
        Ok(normalize(filter, logs))
    }

    /// All logs matching `filter` in `[from, to]`, ordered by
    /// `(block_number, log_index)` and deduplicated.
    pub async fn logs_in_range(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, IndexerError> {
        let mut logs = Vec::new();
        let mut window = self.max_block_range;
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(window - 1).min(to);
            let request = LogRequest::for_filter(filter, LogRange::Blocks { from: start, to: end });
            match self
                .retry
                .run("eth_getLogs", || self.provider.logs(&request))
                .await
            {
                Ok(chunk) => {
                    logs.extend(chunk);
                    if end == u64::MAX {
                        break;
                    }
                    start = end + 1;
                }
                Err(err) if err.is_result_limit() && window > self.min_block_range => {
                    window = (window / 2).max(self.min_block_range);
                    tracing::debug!(
                        chain_id = self.chain_id,
                        from = start,
                        window,
                        error = %err,
                        "Shrinking eth_getLogs window"
                    );
                }
                Err(err) => return Err(self.fail(err)),
            }
        }
        Ok(normalize(filter, logs))
    }
}

/// Drop logs the filter does not actually match, dedupe by id, and sort.
fn normalize(filter: &LogFilter, logs: Vec<Log>) -> Vec<Log> {
    let unique: BTreeMap<(u64, u32, String), Log> = logs
        .into_iter()
        .filter(|l| filter.matches(l))
        .map(|l| ((l.block_number, l.log_index, l.block_hash.clone()), l))
        .collect();
    unique.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockProvider};
    use chainreplay_core::retry::RetryConfig;

    fn tuning(max_block_range: u64) -> SyncTuning {
        SyncTuning {
            max_block_range,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    fn provider_with_logs() -> Arc<MockProvider> {
        let provider = Arc::new(MockProvider::new());
        provider.extend_canonical("a", 0, 40, |n| {
            if n % 5 == 0 {
                vec![0, 1]
            } else {
                vec![]
            }
        });
        provider
    }

    #[tokio::test]
    async fn windows_cover_the_range_in_order() {
        let provider = provider_with_logs();
        let fetcher = LogFetcher::new(provider.clone(), 1, &tuning(7));
        let logs = fetcher
            .logs_in_range(&mock::token_filter(0), 3, 32)
            .await
            .unwrap();
        let blocks: Vec<u64> = logs.iter().map(|l| l.block_number).collect();
        assert_eq!(blocks, vec![5, 5, 10, 10, 15, 15, 20, 20, 25, 25, 30, 30]);
        assert_eq!(provider.log_calls(), 5);
    }

    #[tokio::test]
    async fn window_halves_on_result_limit() {
        let provider = provider_with_logs();
        provider.set_max_log_range(4);
        let fetcher = LogFetcher::new(provider.clone(), 1, &tuning(16));
        let logs = fetcher
            .logs_in_range(&mock::token_filter(0), 0, 15)
            .await
            .unwrap();
        assert_eq!(logs.len(), 8);
    }

    #[tokio::test]
    async fn result_limit_at_minimum_window_is_fatal() {
        let provider = provider_with_logs();
        provider.set_max_log_range(0);
        let fetcher = LogFetcher::new(provider, 1, &tuning(4));
        let err = fetcher
            .logs_in_range(&mock::token_filter(0), 0, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Provider { chain_id: 1, .. }));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = provider_with_logs();
        provider.fail_next(ProviderError::Transport("connection reset".into()), 2);
        let fetcher = LogFetcher::new(provider, 1, &tuning(100));
        let logs = fetcher
            .logs_in_range(&mock::token_filter(0), 0, 10)
            .await
            .unwrap();
        assert_eq!(logs.len(), 6);
    }
}
