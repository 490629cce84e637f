//! Storage error types

use thiserror::Error;

/// Storage error type
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema verification failed: {0}")]
    Schema(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Row not found: {0}")]
    NotFound(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
