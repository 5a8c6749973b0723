use thiserror::Error;

/// Errors that can occur when reading from the record store.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The predicate cannot be translated for this database.
    #[error("Unsupported predicate: {0}")]
    UnsupportedPredicate(String),
}

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, RecordStoreError>;
