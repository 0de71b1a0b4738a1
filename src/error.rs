//! Error taxonomy for the sync pipeline.
//!
//! Item-level dispatch converts `ApiError` values into per-item outcomes;
//! only `TokenLimitExceeded` changes run semantics (the circuit breaker in
//! `sync::dispatch`). `ConfigError` is pre-run only and always fatal.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the CLF and Shopify clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The CLF token-issuance quota for this run is exhausted.
    #[error("token generation limit exceeded")]
    TokenLimitExceeded,

    /// Authentication failed and a single refresh did not help.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The API asked us to slow down (HTTP 429).
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Transport-level failure (connect, timeout, I/O).
    #[error("network error: {0}")]
    Network(String),

    /// A response could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The mutation target does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ApiError {
    /// Recoverable errors are retried with backoff; everything else fails
    /// the item immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::Network(_)
        )
    }
}

/// Credentials-file problems, detected before any network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read credentials file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse credentials file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required credential field: {0}")]
    MissingField(&'static str),
}
