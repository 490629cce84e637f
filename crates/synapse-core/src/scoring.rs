//! Epoch scorer.
//!
//! Composes in-memory task records, agent-reported uptime, persisted
//! metrics and verified proofs into the per-agent contribution tuple the
//! reporter publishes. The weight vector is the live production set and is
//! surfaced verbatim at `/api/formula`.

use crate::error::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use synapse_storage::Store;
use tracing::warn;

pub const TASK_WEIGHT: u32 = 50;
pub const UPTIME_WEIGHT: u32 = 30;
pub const RESPONSE_WEIGHT: u32 = 20;
/// Applied to uptime/response when an agent did no real work this epoch,
/// so a node that is merely online cannot harvest uptime reward.
pub const IDLE_MULTIPLIER: f64 = 0.1;

const UPTIME_NORM_SECS: f64 = 3600.0;
const TASK_NORM: f64 = 100.0;
const LATENCY_INV_CEILING: f64 = 10_000.0;

/// One solved challenge attributed to an agent
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub challenge_id: String,
    pub solved_at: i64,
    pub solve_time_secs: u64,
}

/// Contribution tuple plus the composite scalar
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentScore {
    pub address: String,
    pub task_count: u64,
    pub uptime_seconds: u64,
    pub response_score: u64,
    pub processed_tokens: u64,
    pub avg_latency_inv: u64,
    pub total: f64,
}

/// Serialized shape of the `/api/formula` endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaDescriptor {
    pub task_weight: u32,
    pub uptime_weight: u32,
    pub response_weight: u32,
    pub idle_multiplier: f64,
    pub uptime_norm_seconds: u32,
    pub task_norm: u32,
    pub description: &'static str,
}

pub fn formula() -> FormulaDescriptor {
    FormulaDescriptor {
        task_weight: TASK_WEIGHT,
        uptime_weight: UPTIME_WEIGHT,
        response_weight: RESPONSE_WEIGHT,
        idle_multiplier: IDLE_MULTIPLIER,
        uptime_norm_seconds: UPTIME_NORM_SECS as u32,
        task_norm: TASK_NORM as u32,
        description:
            "score = (taskN*50 + uptimeN*30*idle + responseN*20*idle) / 100; \
             idle = 0.1 unless tasks or tokens were produced this epoch",
    }
}

/// Response quality from solve times: 0 with no tasks, else
/// `floor(clamp(100 - avgSolveTime/10, 0, 100))`
pub fn response_score(records: &[TaskRecord]) -> u64 {
    if records.is_empty() {
        return 0;
    }
    let avg_solve: f64 = records
        .iter()
        .map(|r| r.solve_time_secs as f64)
        .sum::<f64>()
        / records.len() as f64;
    (100.0 - avg_solve / 10.0).clamp(0.0, 100.0).floor() as u64
}

/// Inverse-latency component: `floor(max(0, 10000 - avgLatencyMs))`
pub fn latency_inverse(avg_latency_ms: f64) -> u64 {
    (LATENCY_INV_CEILING - avg_latency_ms).max(0.0).floor() as u64
}

/// Weighted, normalized composite scalar
pub fn composite_score(
    task_count: u64,
    uptime_seconds: u64,
    response: u64,
    processed_tokens: u64,
) -> f64 {
    let task_n = (task_count as f64 / TASK_NORM * 100.0).min(100.0);
    let uptime_n = (uptime_seconds as f64 / UPTIME_NORM_SECS * 100.0).min(100.0);
    let response_n = (response as f64).min(100.0);
    let idle = if task_count > 0 || processed_tokens > 0 {
        1.0
    } else {
        IDLE_MULTIPLIER
    };

    (task_n * TASK_WEIGHT as f64
        + uptime_n * UPTIME_WEIGHT as f64 * idle
        + response_n * RESPONSE_WEIGHT as f64 * idle)
        / 100.0
}

/// Per-epoch scoring state
pub struct EpochScorer {
    store: Arc<Store>,
    tasks: DashMap<String, Vec<TaskRecord>>,
    uptime: DashMap<String, u64>,
}

impl EpochScorer {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            tasks: DashMap::new(),
            uptime: DashMap::new(),
        }
    }

    /// Append a solved challenge to the agent's epoch task log
    pub fn record_task(&self, address: &str, record: TaskRecord) {
        self.tasks
            .entry(address.to_lowercase())
            .or_default()
            .push(record);
    }

    /// Latest agent-reported uptime, maintained by the ingestor
    pub fn record_uptime(&self, address: &str, seconds: u64) {
        self.uptime.insert(address.to_lowercase(), seconds);
    }

    pub fn task_count(&self, address: &str) -> u64 {
        self.tasks
            .get(&address.to_lowercase())
            .map(|r| r.len() as u64)
            .unwrap_or(0)
    }

    /// Compose the full score for one agent in one epoch
    pub async fn compute(&self, address: &str, epoch: i64) -> Result<AgentScore> {
        let address = address.to_lowercase();

        let metrics = self.store.get_epoch_metrics(&address, epoch).await?;
        let (metric_tokens, avg_latency_ms) = metrics
            .map(|m| (m.tokens_processed, m.avg_latency_ms))
            .unwrap_or((0, 0.0));

        let verified_tokens = self.store.verified_token_count(&address, epoch).await?;

        let (task_count, response) = match self.tasks.get(&address) {
            Some(records) => (records.len() as u64, response_score(&records)),
            None => (0, 0),
        };
        let uptime = self.uptime.get(&address).map(|u| *u).unwrap_or(0);

        // Trust the stronger token signal when available
        let processed_tokens = metric_tokens.max(verified_tokens).max(0) as u64;
        let total = composite_score(task_count, uptime, response, processed_tokens);

        // Derived display cache, never a source of truth
        if let Err(e) = self.store.set_node_score(&address, total).await {
            warn!(address = %address, "score cache update failed: {e}");
        }

        Ok(AgentScore {
            address,
            task_count,
            uptime_seconds: uptime,
            response_score: response,
            processed_tokens,
            avg_latency_inv: latency_inverse(avg_latency_ms),
            total,
        })
    }

    /// Reset epoch accumulators. Called by the reporter only after every
    /// agent in the batch was reported successfully.
    pub fn reset_epoch_accumulators(&self) {
        self.tasks.clear();
        self.uptime.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(solve_time_secs: u64) -> TaskRecord {
        TaskRecord {
            challenge_id: "0x01".to_string(),
            solved_at: 0,
            solve_time_secs,
        }
    }

    #[test]
    fn no_tasks_means_zero_response_score() {
        assert_eq!(response_score(&[]), 0);
    }

    #[test]
    fn fast_solves_score_high() {
        // avg 50s -> 100 - 5 = 95
        assert_eq!(response_score(&[task(40), task(60)]), 95);
    }

    #[test]
    fn slow_solves_clamp_to_zero() {
        assert_eq!(response_score(&[task(100_000)]), 0);
    }

    #[test]
    fn latency_inverse_floors_at_zero() {
        assert_eq!(latency_inverse(0.0), 10_000);
        assert_eq!(latency_inverse(250.5), 9_749);
        assert_eq!(latency_inverse(20_000.0), 0);
    }

    #[test]
    fn idle_agent_gets_dampened_uptime() {
        // Online a full hour but produced nothing
        let idle = composite_score(0, 3600, 0, 0);
        let working = composite_score(0, 3600, 0, 1);
        assert!((idle - 3.0).abs() < 1e-9); // 100*30*0.1 / 100
        assert!((working - 30.0).abs() < 1e-9);
    }

    #[test]
    fn components_saturate_at_their_norms() {
        // 1000 tasks, 10h uptime, perfect response
        let score = composite_score(1000, 36_000, 100, 1_000_000);
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_blend_matches_published_formula() {
        // 50 tasks, half-hour uptime, response 80, active
        let score = composite_score(50, 1800, 80, 10_000);
        // (50*50 + 50*30 + 80*20) / 100 = 56
        assert!((score - 56.0).abs() < 1e-9);
    }

    #[test]
    fn formula_descriptor_exposes_live_weights() {
        let f = formula();
        assert_eq!(
            (f.task_weight, f.uptime_weight, f.response_weight),
            (50, 30, 20)
        );
        assert!((f.idle_multiplier - 0.1).abs() < 1e-12);
    }
}
