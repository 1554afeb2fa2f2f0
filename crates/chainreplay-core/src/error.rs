//! Error types for the chainreplay pipeline.

use std::sync::Arc;

use thiserror::Error;

use crate::types::ChainId;
use crate::user_error::UserHandlerError;

/// Errors that can occur while syncing, aggregating, or replaying events.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider error on chain {chain_id}: {source}")]
    Provider {
        chain_id: ChainId,
        #[source]
        source: ProviderError,
    },

    #[error("Unresolvable reorg on chain {chain_id}: no common ancestor within {max_depth} blocks (searched back to block {searched_to})")]
    ReorgDepthExceeded {
        chain_id: ChainId,
        max_depth: u64,
        searched_to: u64,
    },

    #[error("{0}")]
    UserHandler(Arc<UserHandlerError>),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    QueryLimit(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub fn provider(chain_id: ChainId, source: ProviderError) -> Self {
        Self::Provider { chain_id, source }
    }

    /// Returns `true` if the error stops the pipeline of a single network.
    pub fn is_network_fatal(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::ReorgDepthExceeded { .. })
    }
}

/// Errors returned by a [`ChainProvider`](crate::provider::ChainProvider).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection refused, reset, DNS failure and similar.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited")]
    RateLimited,

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node refused to answer because the result set or block range was too large.
    #[error("too many results: {0}")]
    TooManyResults(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Returns `true` if the error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited | Self::Timeout { .. } => true,
            Self::Rpc { code, message } => {
                // -32005 is the de-facto "limit exceeded" code, -32603 an internal node hiccup
                (*code == -32603 || *code == -32005) && !Self::is_result_limit_message(message)
            }
            Self::Other(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("connection") || msg.contains("timeout") || msg.contains("timed out")
            }
            Self::TooManyResults(_) | Self::NotFound(_) => false,
        }
    }

    /// Returns `true` if the request should be repeated over a smaller block window.
    pub fn is_result_limit(&self) -> bool {
        match self {
            Self::TooManyResults(_) => true,
            Self::Rpc { message, .. } | Self::Other(message) => {
                Self::is_result_limit_message(message)
            }
            _ => false,
        }
    }

    fn is_result_limit_message(msg: &str) -> bool {
        let msg = msg.to_lowercase();
        msg.contains("more than 10000 results")
            || msg.contains("query returned more than")
            || msg.contains("block range too large")
            || msg.contains("block range is too wide")
            || msg.contains("response size exceeded")
            || msg.contains("log response size exceeded")
            || msg.contains("exceed maximum block range")
    }
}

/// Returned when a lock acquisition (or the operation holding it) was
/// invalidated by a newer lock generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled: lock generation {generation} was invalidated")]
pub struct Cancelled {
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ProviderError::Transport("connection reset".into()).is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Timeout { ms: 500 }.is_retryable());
        assert!(!ProviderError::NotFound("0xabc".into()).is_retryable());
    }

    #[test]
    fn result_limit_detected_from_message() {
        let err = ProviderError::Rpc {
            code: -32005,
            message: "query returned more than 10000 results".into(),
        };
        assert!(err.is_result_limit());
        assert!(!err.is_retryable());

        let err = ProviderError::Other("Log response size exceeded".into());
        assert!(err.is_result_limit());
    }

    #[test]
    fn network_fatal_classification() {
        let err = IndexerError::provider(1, ProviderError::RateLimited);
        assert!(err.is_network_fatal());
        assert!(!IndexerError::Storage("disk".into()).is_network_fatal());
    }
}
