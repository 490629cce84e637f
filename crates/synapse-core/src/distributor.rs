//! Epoch distributor.
//!
//! Watches for epoch rollover and closes the previous epoch: sync rewards,
//! distribute, then back-fill the local contribution rows from the
//! contract. Sync and distribute are contract-ordered and submitted
//! serially with inclusion waits between them.

use crate::error::Result;
use crate::ingest::unix_now;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use synapse_chain::{canonical_address, ChainClient};
use synapse_storage::models::{ContributionRow, EpochRow};
use synapse_storage::Store;
use tracing::{error, info, warn};

pub struct EpochDistributor {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    running: AtomicBool,
    last_checked_epoch: Mutex<Option<u64>>,
}

impl EpochDistributor {
    pub fn new(store: Arc<Store>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            store,
            chain,
            running: AtomicBool::new(false),
            last_checked_epoch: Mutex::new(None),
        }
    }

    pub async fn tick(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("distribution cycle still running, skipping tick");
            return;
        }

        if let Err(e) = self.tick_inner().await {
            error!("distribution tick failed: {e}");
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<()> {
        let current = self.chain.current_epoch().await?;

        let rolled = {
            let mut last = self.last_checked_epoch.lock();
            match *last {
                None => {
                    *last = Some(current);
                    return Ok(());
                }
                Some(prev_seen) if current > prev_seen => {
                    *last = Some(current);
                    true
                }
                _ => false,
            }
        };

        if rolled && current > 0 {
            self.close_epoch(current - 1).await?;
        }
        Ok(())
    }

    /// Distribute (when not already done) and back-sync one closed epoch
    async fn close_epoch(&self, epoch: u64) -> Result<()> {
        info!(epoch, "closing epoch");

        if !self.chain.epoch_distributed(epoch).await? {
            // Contract requires sync before distribute, in order
            let sync_tx = self.chain.sync_rewards().await?;
            info!(epoch, tx = ?sync_tx, "rewards synced");

            let dist_tx = self.chain.distribute_rewards(epoch).await?;
            info!(epoch, tx = ?dist_tx, "rewards distributed");
        } else {
            info!(epoch, "already distributed, back-syncing only");
        }

        self.backfill_epoch(epoch).await
    }

    /// Mirror the contract's per-agent contribution records locally
    async fn backfill_epoch(&self, epoch: u64) -> Result<()> {
        let agents = self.chain.epoch_agents(epoch).await?;
        let now = unix_now();

        for agent in &agents {
            let address = canonical_address(agent);
            match self.chain.epoch_contribution(epoch, *agent).await {
                Ok(c) => {
                    self.store
                        .upsert_contribution(&ContributionRow {
                            address,
                            epoch: epoch as i64,
                            task_count: c.task_count as i64,
                            uptime_seconds: c.uptime as i64,
                            response_score: c.response_score as i64,
                            processed_tokens: c.processed_tokens as i64,
                            avg_latency_inv: c.avg_latency_inv as i64,
                            last_updated: now,
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(address = %address, epoch, "contribution back-sync failed: {e}");
                }
            }
        }

        let reward = self
            .chain
            .epoch_reward(epoch)
            .await
            .map(|r| r.to_string())
            .unwrap_or_else(|_| "0".to_string());

        self.store
            .upsert_epoch(&EpochRow {
                number: epoch as i64,
                reward,
                agent_count: agents.len() as i32,
                distributed: true,
                synced_at: now,
            })
            .await?;

        info!(epoch, agents = agents.len(), "epoch back-synced");
        Ok(())
    }
}
