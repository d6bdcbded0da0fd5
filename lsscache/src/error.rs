use std::sync::PoisonError;
use thiserror::Error;

/// Coarse classification callers branch on. Storage engine and codec failures
/// count as database errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Database,
    Transaction,
    Runtime,
    NotFound,
}

#[derive(Debug, Error)]
pub enum CacheError {

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Transaction(_) => ErrorKind::Transaction,
            CacheError::Runtime(_) => ErrorKind::Runtime,
            CacheError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Database,
        }
    }

    pub fn database(msg: impl Into<String>) -> Self {
        CacheError::Database(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        CacheError::Transaction(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        CacheError::Runtime(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CacheError::NotFound(msg.into())
    }
}

impl<T> From<PoisonError<T>> for CacheError {
    fn from(e: PoisonError<T>) -> Self {
        CacheError::Transaction(format!("poisoned transaction registry: {}", e))
    }
}
