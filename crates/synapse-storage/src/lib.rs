//! Synapse oracle persistence layer
//!
//! PostgreSQL-backed store for agents, nodes, epoch metrics, proofs,
//! contributions, challenges and pipeline assignments. The store is the
//! restart-recovery source of truth; everything held in memory elsewhere
//! is rehydrated from here at boot.

pub mod error;
pub mod models;
pub mod store;

pub use error::{Result, StorageError};
pub use store::Store;
