//! Error taxonomy for the cache engine.
//!
//! None of these reach the client: lookups degrade to a miss and the flush
//! boundary logs and swallows them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("cache store operation `{op}` timed out")]
    StoreTimeout { op: &'static str },
    #[error("content-version ledger write failed: {0}")]
    LedgerWrite(String),
    #[error("circular table dependency: {}", path.join("/"))]
    CircularDependency { path: Vec<String> },
}

impl CacheError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(err.to_string())
    }

    pub fn ledger(err: impl std::fmt::Display) -> Self {
        Self::LedgerWrite(err.to_string())
    }
}
