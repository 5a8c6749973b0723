//! Replication cache error types.

use record_store::RecordStoreError;
use thiserror::Error;

/// Errors that can occur on the cached read path.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The change feed or the updater is misconfigured or unreachable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The batched fallback statement failed.
    #[error("Query execution error: {source} [statement: {statement}] [query: {query}]")]
    QueryExecution {
        statement: String,
        query: String,
        source: RecordStoreError,
    },

    /// The change feed delivered something unusable or dropped its connection.
    #[error("Change feed error: {0}")]
    Feed(String),

    /// An error from the non-cached read path.
    #[error("Record store error: {0}")]
    Store(#[from] RecordStoreError),
}

/// Result type for replication cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
