//! Challenge service.
//!
//! Keeps one challenge live on-chain and mirrors its lifecycle locally.
//! Solve events append to the scorer's per-agent task log, which feeds the
//! task and response components of the contribution score.

use crate::error::Result;
use crate::ingest::unix_now;
use crate::scoring::{EpochScorer, TaskRecord};
use ethers::types::H256;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use synapse_chain::{canonical_address, ChainClient};
use synapse_storage::models::ChallengeRow;
use synapse_storage::Store;
use tracing::{error, info, warn};

pub const DEFAULT_CHALLENGE_DIFFICULTY: u8 = 2;
pub const DEFAULT_CHALLENGE_DURATION_SECS: u64 = 3600;

pub struct ChallengeService {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<EpochScorer>,
    running: AtomicBool,
    last_scanned_block: Mutex<Option<u64>>,
}

impl ChallengeService {
    pub fn new(store: Arc<Store>, chain: Arc<dyn ChainClient>, scorer: Arc<EpochScorer>) -> Self {
        Self {
            store,
            chain,
            scorer,
            running: AtomicBool::new(false),
            last_scanned_block: Mutex::new(None),
        }
    }

    pub async fn tick(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("challenge tick still running, skipping");
            return;
        }

        if let Err(e) = self.tick_inner().await {
            error!("challenge tick failed: {e}");
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<()> {
        let head = self.chain.current_block().await?;

        let from_block = {
            let mut last = self.last_scanned_block.lock();
            let from = last.map(|b| b + 1).unwrap_or(head);
            *last = Some(head);
            from
        };

        if from_block <= head {
            self.scan_events(from_block).await?;
        }

        self.ensure_challenge_live().await
    }

    /// Mirror challenge events since the last scan into the store and the
    /// scorer's task log.
    async fn scan_events(&self, from_block: u64) -> Result<()> {
        let now = unix_now();

        for created in self.chain.challenge_created_since(from_block).await? {
            self.store
                .upsert_challenge(&ChallengeRow {
                    id: format!("{:#x}", created.id),
                    difficulty: created.difficulty as i32,
                    seed: String::new(),
                    created_at: now,
                    expires_at: created.expires_at as i64,
                    solved: false,
                    solver: None,
                    reward_bonus: "0".to_string(),
                })
                .await?;
            info!(id = %format!("{:#x}", created.id), "challenge created on-chain");
        }

        for solved in self.chain.challenge_solved_since(from_block).await? {
            let id = format!("{:#x}", solved.id);
            let solver = canonical_address(&solved.solver);

            self.store.mark_challenge_solved(&id, &solver).await?;
            self.scorer.record_task(
                &solver,
                TaskRecord {
                    challenge_id: id.clone(),
                    solved_at: now,
                    solve_time_secs: solved.solve_time,
                },
            );
            info!(id = %id, solver = %solver, solve_time = solved.solve_time, "challenge solved");
        }

        Ok(())
    }

    /// Create a fresh challenge when none is live
    async fn ensure_challenge_live(&self) -> Result<()> {
        let now = unix_now();
        let needs_new = match self.chain.current_challenge().await? {
            None => true,
            Some(c) => c.solved || (c.expires_at as i64) < now,
        };

        if !needs_new {
            return Ok(());
        }

        let seed = H256::from(rand::random::<[u8; 32]>());
        let tx = self
            .chain
            .create_challenge(
                DEFAULT_CHALLENGE_DIFFICULTY,
                seed,
                DEFAULT_CHALLENGE_DURATION_SECS,
            )
            .await?;
        info!(tx = ?tx, "new challenge created");
        Ok(())
    }
}
