//! Contribution reporter.
//!
//! Posts per-agent contribution tuples on-chain once per report window.
//! The epoch accumulators only reset when every agent in the batch landed,
//! so a partial failure is retried wholesale on the next cycle; the
//! contract is idempotent under repeated reports for the same
//! `(address, epoch)`.

use crate::error::Result;
use crate::ingest::unix_now;
use crate::scoring::EpochScorer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use synapse_chain::{canonical_address, ChainClient, ContributionReport};
use synapse_storage::models::ContributionRow;
use synapse_storage::Store;
use tracing::{error, info, warn};

pub const DEFAULT_REPORT_INTERVAL_BLOCKS: u64 = 1200;

pub struct ContributionReporter {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<EpochScorer>,
    report_interval_blocks: u64,
    /// Non-reentrancy gate: a slow cycle never overlaps the next tick
    running: AtomicBool,
    last_report_block: Mutex<Option<u64>>,
}

impl ContributionReporter {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        scorer: Arc<EpochScorer>,
        report_interval_blocks: u64,
    ) -> Self {
        Self {
            store,
            chain,
            scorer,
            report_interval_blocks,
            running: AtomicBool::new(false),
            last_report_block: Mutex::new(None),
        }
    }

    /// One 60-second tick. The first tick only records the current block;
    /// later ticks run a report cycle once the block interval has passed.
    pub async fn tick(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("report cycle still running, skipping tick");
            return;
        }

        if let Err(e) = self.tick_inner().await {
            error!("report tick failed: {e}");
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<()> {
        let block = self.chain.current_block().await?;

        let since_last = {
            let mut last = self.last_report_block.lock();
            match *last {
                None => {
                    *last = Some(block);
                    return Ok(());
                }
                Some(b) => block.saturating_sub(b),
            }
        };

        if since_last < self.report_interval_blocks {
            return Ok(());
        }

        if self.run_report_cycle().await? {
            *self.last_report_block.lock() = Some(block);
        }
        Ok(())
    }

    /// Report every active agent's contribution. Returns whether the whole
    /// batch succeeded; per-agent failures are logged and skipped.
    async fn run_report_cycle(&self) -> Result<bool> {
        let epoch = self.chain.current_epoch().await? as i64;
        let agents = self.chain.active_agents().await?;

        info!(epoch, agents = agents.len(), "report cycle starting");

        let mut failures = 0usize;
        for agent in &agents {
            let address = canonical_address(agent);
            match self.report_one(&address, *agent, epoch).await {
                Ok(()) => {}
                Err(e) => {
                    failures += 1;
                    warn!(address = %address, epoch, "contribution report failed: {e}");
                }
            }
        }

        if failures == 0 {
            // Safe to roll the window only when nothing is left to retry
            self.scorer.reset_epoch_accumulators();
            info!(epoch, "report cycle complete, accumulators reset");
            Ok(true)
        } else {
            warn!(
                epoch,
                failures,
                total = agents.len(),
                "report cycle incomplete, retrying next window"
            );
            Ok(false)
        }
    }

    async fn report_one(
        &self,
        address: &str,
        agent: synapse_chain::Address,
        epoch: i64,
    ) -> Result<()> {
        let score = self.scorer.compute(address, epoch).await?;

        let tx = self
            .chain
            .report_contribution(&ContributionReport {
                agent,
                task_count: score.task_count,
                uptime: score.uptime_seconds,
                response_score: score.response_score,
                processed_tokens: score.processed_tokens,
                avg_latency_inv: score.avg_latency_inv,
            })
            .await?;

        // Local row only lands after on-chain inclusion
        self.store
            .upsert_contribution(&ContributionRow {
                address: address.to_string(),
                epoch,
                task_count: score.task_count as i64,
                uptime_seconds: score.uptime_seconds as i64,
                response_score: score.response_score as i64,
                processed_tokens: score.processed_tokens as i64,
                avg_latency_inv: score.avg_latency_inv as i64,
                last_updated: unix_now(),
            })
            .await?;

        info!(address = %address, epoch, tx = ?tx, "contribution reported");
        Ok(())
    }
}
