use thiserror::Error;

/// Errors from key-value backend operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// Optimistic commit failure: something this transaction read was
    /// modified by a concurrent commit. Callers may retry with a fresh
    /// transaction.
    #[error("transaction conflict")]
    Conflict,

    /// The transaction was already committed or discarded.
    #[error("transaction is closed")]
    TxnClosed,

    /// Write attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// I/O error from the underlying storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience type alias for backend operations.
pub type KvResult<T> = std::result::Result<T, KvError>;
