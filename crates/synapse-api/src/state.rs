//! Shared handler state.

use std::sync::Arc;
use synapse_chain::ChainClient;
use synapse_core::{EpochScorer, ProofStore, ReplayGuard, TelemetryIngestor};
use synapse_pipeline::{Allocator, ClusterManager, TopologyBus};
use synapse_storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub chain: Arc<dyn ChainClient>,
    pub ingestor: Arc<TelemetryIngestor>,
    pub scorer: Arc<EpochScorer>,
    pub proofs: Arc<ProofStore>,
    pub allocator: Arc<Allocator>,
    pub clusters: Arc<ClusterManager>,
    pub replay: Arc<ReplayGuard>,
    pub bus: TopologyBus,
}
