//! Synapse oracle chain access
//!
//! Typed contract bindings, precompile codecs and the [`ChainClient`] seam
//! the rest of the oracle is written against.

pub mod client;
pub mod contracts;
pub mod error;
pub mod precompiles;

pub use client::{
    canonical_address, parse_address, AgentMeta, ChainClient, ChallengeCreatedEvent,
    ChallengeInfo, ChallengeSolvedEvent, ContributionReport, EvmChain, OnChainAgent,
    OnChainContribution,
};
pub use error::{ChainError, Result};

// Re-export the ethers types that cross crate boundaries so downstream
// crates don't need a direct ethers dependency for plain data.
pub use ethers::types::{Address, H256, U256};
