//! Synapse oracle core.
//!
//! The subsystems with real invariants: authenticated cumulative-counter
//! telemetry, proof plausibility, epoch scoring, exactly-once contribution
//! reporting, epoch distribution, chain watching and liveness monitoring.

pub mod challenges;
pub mod distributor;
pub mod error;
pub mod ingest;
pub mod monitor;
pub mod proofs;
pub mod replay;
pub mod reporter;
pub mod scoring;
pub mod sigs;
pub mod watcher;

pub use challenges::ChallengeService;
pub use distributor::EpochDistributor;
pub use error::{CoreError, IngestError, Result};
pub use ingest::{IngestOutcome, TelemetryIngestor, TelemetryReport};
pub use monitor::NodeMonitor;
pub use proofs::{ProofStore, ProofSubmission};
pub use replay::{EndpointFamily, ReplayGuard};
pub use reporter::ContributionReporter;
pub use scoring::{AgentScore, EpochScorer, TaskRecord};
pub use watcher::ChainWatcher;
