//! Core error types.
//!
//! [`IngestError`] is the client-facing failure taxonomy for signed
//! submissions; its variants map directly onto HTTP statuses at the edge.
//! [`CoreError`] wraps the infrastructure errors background services
//! propagate internally.

use thiserror::Error;

/// Rejection reasons for signed client submissions
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("rejected-signature: {0}")]
    Signature(String),

    #[error("rejected-stale-or-replay: {0}")]
    StaleOrReplay(String),

    #[error("rejected-bounds: {0}")]
    Bounds(String),

    #[error("rejected-unregistered: {0}")]
    Unregistered(String),

    #[error("internal-persist-failure: {0}")]
    Internal(String),
}

impl IngestError {
    /// Stable error code surfaced to the caller
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Signature(_) => "rejected-signature",
            IngestError::StaleOrReplay(_) => "rejected-stale-or-replay",
            IngestError::Bounds(_) => "rejected-bounds",
            IngestError::Unregistered(_) => "rejected-unregistered",
            IngestError::Internal(_) => "internal-persist-failure",
        }
    }

    /// Whether the failure is the server's fault (5xx)
    pub fn is_internal(&self) -> bool {
        matches!(self, IngestError::Internal(_))
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] synapse_storage::StorageError),

    #[error("Chain error: {0}")]
    Chain(#[from] synapse_chain::ChainError),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
