//! Telemetry ingestor.
//!
//! Agents report cumulative counters; the ingestor authenticates each
//! report, converts the counters to deltas and accumulates them into the
//! `(address, epoch)` metrics row. The raw reported values are snapshotted
//! alongside the accumulated sums: seeding the delta base from the
//! accumulated totals after a restart would re-add the whole counter when
//! an agent happens to reset at the wrong moment.

use crate::error::IngestError;
use crate::proofs::{ProofStore, ProofSubmission};
use crate::replay::{EndpointFamily, ReplayGuard};
use crate::scoring::EpochScorer;
use crate::sigs;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use synapse_chain::{parse_address, ChainClient};
use synapse_storage::models::{agent_status, EpochMetricsRow, NodeRow};
use synapse_storage::Store;
use tracing::{debug, info, warn};

/// Reports older or newer than this are rejected outright
pub const FRESHNESS_WINDOW_SECS: i64 = 60;
/// Anti-abuse ceiling on a single report's cumulative token counter
pub const MAX_TOKENS_PER_REPORT: u64 = 1_000_000_000;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Signed telemetry envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub address: String,
    pub tokens_processed: u64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    pub request_count: u64,
    #[serde(default)]
    pub uptime_seconds: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub proofs: Option<Vec<ProofSubmission>>,
}

/// Result of an accepted report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub should_reset: bool,
    pub token_delta: i64,
    pub request_delta: i64,
    pub epoch: i64,
}

pub fn freshness_ok(now: i64, timestamp: i64) -> bool {
    (now - timestamp).abs() <= FRESHNESS_WINDOW_SECS
}

/// Fold one report's raw counters into the epoch row.
///
/// A raw value below its snapshot means the agent restarted and its
/// counters started over; the whole reported value is then the delta. A
/// reset is detected on either counter and applied to both, since the
/// counters live and die together on the agent.
///
/// Returns `(token_delta, request_delta)`.
pub fn accumulate_report(
    row: &mut EpochMetricsRow,
    raw_tokens: i64,
    raw_requests: i64,
    report_latency_ms: f64,
    uptime_seconds: i64,
    timestamp: i64,
) -> (i64, i64) {
    let reset = raw_tokens < row.last_raw_tokens || raw_requests < row.last_raw_requests;
    let token_delta = if reset {
        raw_tokens
    } else {
        raw_tokens - row.last_raw_tokens
    };
    let request_delta = if reset {
        raw_requests
    } else {
        raw_requests - row.last_raw_requests
    };

    row.tokens_processed += token_delta;

    let prev_requests = row.request_count;
    row.request_count += request_delta;
    if request_delta > 0 {
        let total = prev_requests + request_delta;
        row.avg_latency_ms = (row.avg_latency_ms * prev_requests as f64
            + report_latency_ms * request_delta as f64)
            / total as f64;
    }

    // Uptime is agent-authoritative
    row.uptime_seconds = uptime_seconds;
    row.last_raw_tokens = raw_tokens;
    row.last_raw_requests = raw_requests;
    row.last_updated = timestamp;

    (token_delta, request_delta)
}

/// Telemetry ingestion service
pub struct TelemetryIngestor {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<EpochScorer>,
    proofs: Arc<ProofStore>,
    replay: Arc<ReplayGuard>,
    /// Carry-over raw counters per address, so the first report of a new
    /// epoch is deltad against the previous epoch's snapshot instead of
    /// being counted in full.
    raw_counters: DashMap<String, (i64, i64)>,
    /// Per-address serialization of the check-accumulate-persist section
    address_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// When set, a matching `X-Oracle-Key` bypasses the signature check
    api_key: Option<String>,
}

impl TelemetryIngestor {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        scorer: Arc<EpochScorer>,
        proofs: Arc<ProofStore>,
        replay: Arc<ReplayGuard>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            store,
            chain,
            scorer,
            proofs,
            replay,
            raw_counters: DashMap::new(),
            address_locks: DashMap::new(),
            api_key,
        }
    }

    /// Rehydrate the replay cursors and raw-counter snapshots from the
    /// latest persisted metrics row per address.
    pub async fn bootstrap(&self) -> Result<(), IngestError> {
        let rows = self
            .store
            .latest_metrics_per_address()
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;

        for row in &rows {
            self.replay
                .seed(EndpointFamily::Metrics, &row.address, row.last_updated);
            self.raw_counters.insert(
                row.address.clone(),
                (row.last_raw_tokens, row.last_raw_requests),
            );
        }

        info!(addresses = rows.len(), "telemetry guards rehydrated");
        Ok(())
    }

    /// Validate and persist one telemetry report.
    ///
    /// No in-memory guard advances unless the persist succeeded, so a
    /// failed write never burns the client's timestamp.
    pub async fn handle_report(
        &self,
        report: &TelemetryReport,
        presented_key: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let address = report.address.to_lowercase();
        let agent = parse_address(&address)
            .map_err(|e| IngestError::Signature(e.to_string()))?;

        let key_ok =
            matches!((&self.api_key, presented_key), (Some(k), Some(p)) if k.as_str() == p);
        if !key_ok {
            let message = sigs::canonical_metrics_message(
                &address,
                report.tokens_processed,
                report.timestamp,
            );
            sigs::verify_signed(&message, &report.signature, &address)
                .map_err(IngestError::Signature)?;
        }

        // Two concurrent reports for one address must not interleave
        // between the replay check and the persisted row update
        let address_lock = self
            .address_locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serialized = address_lock.lock().await;

        let now = unix_now();
        if !freshness_ok(now, report.timestamp) {
            return Err(IngestError::StaleOrReplay(format!(
                "timestamp {} outside ±{}s window",
                report.timestamp, FRESHNESS_WINDOW_SECS
            )));
        }
        if !self
            .replay
            .is_fresh(EndpointFamily::Metrics, &address, report.timestamp)
        {
            return Err(IngestError::StaleOrReplay(format!(
                "timestamp {} not newer than accepted cursor",
                report.timestamp
            )));
        }

        if report.tokens_processed > MAX_TOKENS_PER_REPORT {
            return Err(IngestError::Bounds(format!(
                "tokensProcessed {} exceeds {}",
                report.tokens_processed, MAX_TOKENS_PER_REPORT
            )));
        }

        let registered = self
            .chain
            .is_agent_account(agent)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;
        if !registered {
            return Err(IngestError::Unregistered(address.clone()));
        }

        let epoch = self
            .chain
            .current_epoch()
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))? as i64;

        let existing = self
            .store
            .get_epoch_metrics(&address, epoch)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;

        let should_reset = existing.is_none();
        let mut row = existing.unwrap_or_else(|| {
            let mut fresh = EpochMetricsRow::empty(&address, epoch);
            // First row of the epoch: delta against the carried-over
            // snapshot from the previous epoch, not against zero
            if let Some(raw) = self.raw_counters.get(&address) {
                fresh.last_raw_tokens = raw.0;
                fresh.last_raw_requests = raw.1;
            }
            fresh
        });

        let (token_delta, request_delta) = accumulate_report(
            &mut row,
            report.tokens_processed as i64,
            report.request_count as i64,
            report.avg_latency_ms,
            report.uptime_seconds as i64,
            report.timestamp,
        );

        self.store
            .save_epoch_metrics(&row)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;

        // Persist succeeded: guards may advance now
        self.replay
            .advance(EndpointFamily::Metrics, &address, report.timestamp);
        self.raw_counters.insert(
            address.clone(),
            (row.last_raw_tokens, row.last_raw_requests),
        );
        self.scorer.record_uptime(&address, report.uptime_seconds);

        self.apply_side_effects(&address, now).await;
        self.forward_proofs(&address, epoch, report.proofs.as_deref(), now)
            .await;

        debug!(
            address = %address,
            epoch,
            token_delta,
            request_delta,
            "telemetry accepted"
        );

        Ok(IngestOutcome {
            should_reset,
            token_delta,
            request_delta,
            epoch,
        })
    }

    /// Heartbeat bookkeeping after an accepted report. Failures here are
    /// logged and swallowed: the report itself is already durable.
    async fn apply_side_effects(&self, address: &str, now: i64) {
        match self.store.get_node(address).await {
            Ok(Some(_)) => {
                if let Err(e) = self.store.touch_node(address, now, now).await {
                    warn!(address, "node heartbeat update failed: {e}");
                }
            }
            Ok(None) => {
                // First verified metrics report auto-registers the node
                let node = NodeRow {
                    address: address.to_string(),
                    endpoint: String::new(),
                    capabilities: Vec::new(),
                    status: agent_status::ACTIVE.to_string(),
                    score: 0.0,
                    last_heartbeat: now,
                    last_metric_report: now,
                    registration_signature: None,
                    benchmark_tok_per_sec: 0.0,
                    lan_ip: None,
                    can_distribute: false,
                    updated_at: None,
                };
                if let Err(e) = self.store.upsert_node(&node).await {
                    warn!(address, "node auto-registration failed: {e}");
                }
            }
            Err(e) => warn!(address, "node lookup failed: {e}"),
        }

        if let Err(e) = self.store.touch_agent_heartbeat(address, now).await {
            warn!(address, "agent heartbeat update failed: {e}");
        }
        // The unified heartbeat also keeps this node's pipeline
        // assignments out of the stale sweep
        if let Err(e) = self.store.touch_assignments_for_node(address, now).await {
            warn!(address, "assignment heartbeat update failed: {e}");
        }
    }

    /// Proofs are auxiliary signal; a failed save never fails the report
    async fn forward_proofs(
        &self,
        address: &str,
        epoch: i64,
        proofs: Option<&[ProofSubmission]>,
        now: i64,
    ) {
        let Some(proofs) = proofs else { return };
        for proof in proofs {
            if let Err(e) = self.proofs.submit(address, epoch, proof, now).await {
                warn!(address, epoch, "proof save failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_row() -> EpochMetricsRow {
        EpochMetricsRow::empty("0xaa01", 41)
    }

    #[test]
    fn cumulative_counters_accumulate_as_deltas() {
        let mut row = report_row();

        // Three reports with cumulative (t=100, r=1), (t=300, r=3), (t=250, r=4)
        let (t1, r1) = accumulate_report(&mut row, 100, 1, 50.0, 600, 1000);
        assert_eq!((t1, r1), (100, 1));

        let (t2, r2) = accumulate_report(&mut row, 300, 3, 50.0, 630, 1030);
        assert_eq!((t2, r2), (200, 2));

        // Third report's token counter went backwards: agent restarted
        let (t3, r3) = accumulate_report(&mut row, 250, 4, 50.0, 660, 1060);
        assert_eq!((t3, r3), (250, 4));

        assert_eq!(row.tokens_processed, 550);
        assert_eq!(row.request_count, 7);
        assert_eq!(row.last_raw_tokens, 250);
        assert_eq!(row.last_raw_requests, 4);
        assert_eq!(row.last_updated, 1060);
    }

    #[test]
    fn restart_rehydration_reproduces_the_same_tallies() {
        // Run reports 1 and 2, "restart" by rebuilding the row from its
        // persisted fields, then run report 3
        let mut row = report_row();
        accumulate_report(&mut row, 100, 1, 50.0, 600, 1000);
        accumulate_report(&mut row, 300, 3, 50.0, 630, 1030);

        let mut rehydrated = row.clone();
        assert_eq!(rehydrated.last_raw_tokens, 300);
        assert_eq!(rehydrated.last_raw_requests, 3);
        assert_eq!(rehydrated.last_updated, 1030);

        accumulate_report(&mut rehydrated, 250, 4, 50.0, 660, 1060);
        assert_eq!(rehydrated.tokens_processed, 550);
        assert_eq!(rehydrated.request_count, 7);
    }

    #[test]
    fn reset_produces_full_value_not_difference() {
        let mut row = report_row();
        accumulate_report(&mut row, 500, 5, 10.0, 60, 1000);

        let (token_delta, _) = accumulate_report(&mut row, 30, 1, 10.0, 90, 1030);
        assert_eq!(token_delta, 30);
        assert_eq!(row.tokens_processed, 530);
    }

    #[test]
    fn latency_mean_is_request_weighted() {
        let mut row = report_row();
        accumulate_report(&mut row, 100, 2, 100.0, 60, 1000);
        accumulate_report(&mut row, 200, 8, 400.0, 90, 1030);

        // (100*2 + 400*6) / 8 = 325
        assert!((row.avg_latency_ms - 325.0).abs() < 1e-9);
    }

    #[test]
    fn zero_request_delta_leaves_latency_untouched() {
        let mut row = report_row();
        accumulate_report(&mut row, 100, 2, 100.0, 60, 1000);
        accumulate_report(&mut row, 150, 2, 9999.0, 90, 1030);
        assert!((row.avg_latency_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn uptime_is_overwritten_not_summed() {
        let mut row = report_row();
        accumulate_report(&mut row, 100, 1, 10.0, 600, 1000);
        accumulate_report(&mut row, 200, 2, 10.0, 580, 1030);
        assert_eq!(row.uptime_seconds, 580);
    }

    #[test]
    fn freshness_window_boundaries() {
        let now = 10_000;
        assert!(freshness_ok(now, now + 60));
        assert!(!freshness_ok(now, now + 61));
        assert!(freshness_ok(now, now - 60));
        assert!(!freshness_ok(now, now - 61));
    }

    #[test]
    fn token_bound_is_inclusive() {
        assert!(1_000_000_000u64 <= MAX_TOKENS_PER_REPORT);
        assert!(1_000_000_001u64 > MAX_TOKENS_PER_REPORT);
    }
}
