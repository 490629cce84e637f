//! Database models for oracle state
//!
//! All addresses are stored as lowercase 0x-prefixed hex. Token amounts that
//! can exceed 64 bits (stake, rewards) are stored as decimal strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Agent status as tracked on-chain and mirrored locally
pub mod agent_status {
    pub const INACTIVE: &str = "inactive";
    pub const ACTIVE: &str = "active";
    pub const SLASHED: &str = "slashed";
}

/// Pipeline node modes
pub mod node_mode {
    pub const STANDALONE: &str = "standalone";
    pub const COORDINATOR: &str = "coordinator";
    pub const RPC_SERVER: &str = "rpc-server";
}

/// On-chain registered agent mirrored into the local store
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRow {
    pub address: String,
    pub registered_at: i64,
    pub last_heartbeat: i64,
    pub status: String,
    pub stake: String,
    pub node_id: Option<String>,
    pub metadata: Option<String>,
    #[sqlx(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Network-reachable presence of an agent
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeRow {
    pub address: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub status: String,
    pub score: f64,
    pub last_heartbeat: i64,
    pub last_metric_report: i64,
    pub registration_signature: Option<String>,
    pub benchmark_tok_per_sec: f64,
    pub lan_ip: Option<String>,
    pub can_distribute: bool,
    #[sqlx(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-epoch accumulated telemetry, unique per `(address, epoch)`.
///
/// `tokens_processed` / `request_count` are monotonic sums of deltas derived
/// from the agent's cumulative counters. `last_raw_tokens` /
/// `last_raw_requests` hold the agent's most recent *reported* cumulative
/// values so a restart never re-applies an already-counted range.
/// `last_updated` is the client timestamp of the last accepted report and
/// re-seeds the replay guard after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EpochMetricsRow {
    pub address: String,
    pub epoch: i64,
    pub tokens_processed: i64,
    pub request_count: i64,
    pub avg_latency_ms: f64,
    pub uptime_seconds: i64,
    pub last_raw_tokens: i64,
    pub last_raw_requests: i64,
    pub last_updated: i64,
}

impl EpochMetricsRow {
    pub fn empty(address: &str, epoch: i64) -> Self {
        Self {
            address: address.to_string(),
            epoch,
            tokens_processed: 0,
            request_count: 0,
            avg_latency_ms: 0.0,
            uptime_seconds: 0,
            last_raw_tokens: 0,
            last_raw_requests: 0,
            last_updated: 0,
        }
    }
}

/// Stored inference proof. `verified` reflects the save-time plausibility
/// check only; a later on-chain verifier may flip it via `mark_verified`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProofRow {
    pub id: String,
    pub address: String,
    pub epoch: i64,
    pub model_hash: String,
    pub input_hash: String,
    pub output_hash: String,
    pub token_count: i64,
    pub verified: bool,
    pub verification_tx_hash: Option<String>,
    pub created_at: i64,
    pub verified_at: Option<i64>,
}

/// Contribution snapshot published on-chain, one row per `(address, epoch)`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContributionRow {
    pub address: String,
    pub epoch: i64,
    pub task_count: i64,
    pub uptime_seconds: i64,
    pub response_score: i64,
    pub processed_tokens: i64,
    pub avg_latency_inv: i64,
    pub last_updated: i64,
}

/// Epoch bookkeeping row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EpochRow {
    pub number: i64,
    pub reward: String,
    pub agent_count: i32,
    pub distributed: bool,
    pub synced_at: i64,
}

/// On-chain challenge mirrored locally
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChallengeRow {
    pub id: String,
    pub difficulty: i32,
    pub seed: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub solved: bool,
    pub solver: Option<String>,
    pub reward_bonus: String,
}

/// Per-model pipeline assignment, unique per `(node_address, model_name)`.
///
/// Invariant per model: the `[layer_start, layer_end)` spans of all rows
/// sharing a `cluster_id` (or the single standalone row) cover
/// `[0, total_layers)` with no overlap.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssignmentRow {
    pub node_address: String,
    pub model_name: String,
    pub layer_start: i32,
    pub layer_end: i32,
    pub total_layers: i32,
    pub grpc_endpoint: String,
    pub http_endpoint: String,
    pub ram_mb: i64,
    pub device: String,
    pub vram_mb: i64,
    pub benchmark_tok_per_sec: f64,
    pub ready: bool,
    pub pipeline_order: i32,
    pub node_mode: String,
    pub cluster_id: Option<String>,
    pub rpc_port: i32,
    pub lan_ip: Option<String>,
    pub updated_at: i64,
}

/// Aggregated network snapshot refreshed by the monitor tick
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NetworkStatsRow {
    pub id: i32,
    pub epoch: i64,
    pub total_agents: i64,
    pub active_nodes: i64,
    pub tokens_processed: i64,
    pub verified_proofs: i64,
    pub updated_at: i64,
}

/// Leaderboard entry joined from contributions and node scores
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LeaderboardRow {
    pub address: String,
    pub epoch: i64,
    pub task_count: i64,
    pub processed_tokens: i64,
    pub response_score: i64,
    pub score: f64,
}
