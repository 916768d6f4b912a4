use convo_shared::Key;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored document could not be encoded or decoded.
    #[error("Document error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A lookup by key found nothing.
    #[error("Record not found: {0}")]
    NotFound(Key),

    /// An entity read by the transaction changed before commit. Retryable.
    #[error("Transaction conflict on {0}")]
    Conflict(Key),

    /// The request context was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The request context ran past its deadline.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A uniqueness convention was broken (e.g. two users share an e-mail).
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Commit or rollback without an open transaction.
    #[error("No transaction in progress")]
    NoTransaction,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The blocking worker running a query failed.
    #[error("Background task failed: {0}")]
    Background(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
