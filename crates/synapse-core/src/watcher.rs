//! Chain watcher.
//!
//! Subscribes to the block stream and reconciles successful precompile
//! calls into the local registry. Decoding is defensive throughout:
//! malformed calldata is logged and skipped, and a lost stream reconnects
//! with backoff; the watcher never takes the process down.

use crate::error::Result;
use ethers::types::{Address, Transaction, TransactionReceipt, U64};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use synapse_chain::precompiles::{
    decode_agent_slot, decode_register, precompile_address, reward_claimed_topic,
    PRECOMPILE_AGENT_HEARTBEAT, PRECOMPILE_AGENT_REGISTER, PRECOMPILE_CLAIM_REWARD,
    PRECOMPILE_VERIFY_INFERENCE,
};
use synapse_chain::{canonical_address, EvmChain};
use synapse_storage::models::{agent_status, AgentRow};
use synapse_storage::Store;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecompileKind {
    VerifyInference,
    Register,
    Heartbeat,
    ClaimReward,
}

/// Which precompile a transaction targets, if any
pub fn classify_precompile(to: &Address) -> Option<PrecompileKind> {
    if *to == precompile_address(PRECOMPILE_VERIFY_INFERENCE) {
        Some(PrecompileKind::VerifyInference)
    } else if *to == precompile_address(PRECOMPILE_AGENT_REGISTER) {
        Some(PrecompileKind::Register)
    } else if *to == precompile_address(PRECOMPILE_AGENT_HEARTBEAT) {
        Some(PrecompileKind::Heartbeat)
    } else if *to == precompile_address(PRECOMPILE_CLAIM_REWARD) {
        Some(PrecompileKind::ClaimReward)
    } else {
        None
    }
}

pub struct ChainWatcher {
    chain: Arc<EvmChain>,
    store: Arc<Store>,
}

impl ChainWatcher {
    pub fn new(chain: Arc<EvmChain>, store: Arc<Store>) -> Self {
        Self { chain, store }
    }

    /// Consume the block stream until shutdown, reconnecting with
    /// exponential backoff whenever it drops.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut stream = match self.chain.subscribe_blocks().await {
                Ok(s) => {
                    backoff = INITIAL_BACKOFF;
                    info!("block stream subscribed");
                    s
                }
                Err(e) => {
                    warn!("block subscription failed: {e}, retrying in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => return,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            loop {
                tokio::select! {
                    block = stream.next() => match block {
                        Some(header) => {
                            if let Some(hash) = header.hash {
                                if let Err(e) = self.handle_block(hash).await {
                                    error!("block handling failed: {e}");
                                }
                            }
                        }
                        None => {
                            warn!("block stream ended, reconnecting");
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        info!("chain watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_block(&self, hash: ethers::types::H256) -> Result<()> {
        let Some(block) = self.chain.full_block(hash).await? else {
            return Ok(());
        };
        let block_time = block.timestamp.as_u64() as i64;

        for tx in &block.transactions {
            let Some(to) = tx.to else { continue };
            let Some(kind) = classify_precompile(&to) else {
                continue;
            };

            // Only successful calls mutate the registry
            let receipt = match self.chain.receipt(tx.hash).await {
                Ok(Some(r)) if r.status == Some(U64::from(1)) => r,
                Ok(_) => continue,
                Err(e) => {
                    warn!(tx = ?tx.hash, "receipt fetch failed: {e}");
                    continue;
                }
            };

            if let Err(e) = self.handle_call(kind, tx, &receipt, block_time).await {
                warn!(tx = ?tx.hash, ?kind, "precompile handling failed: {e}");
            }
        }

        Ok(())
    }

    async fn handle_call(
        &self,
        kind: PrecompileKind,
        tx: &Transaction,
        receipt: &TransactionReceipt,
        block_time: i64,
    ) -> Result<()> {
        match kind {
            PrecompileKind::Register => {
                let Some(payload) = decode_register(&tx.input) else {
                    warn!(tx = ?tx.hash, "malformed register calldata, skipping");
                    return Ok(());
                };
                let target = payload.beneficiary.unwrap_or(tx.from);
                let address = canonical_address(&target);

                let metadata = serde_json::json!({
                    "modelHash": format!("{:#x}", payload.model_hash),
                    "capabilities": payload.capabilities,
                })
                .to_string();

                self.store
                    .upsert_agent(&AgentRow {
                        address: address.clone(),
                        registered_at: block_time,
                        last_heartbeat: block_time,
                        status: agent_status::ACTIVE.to_string(),
                        stake: "0".to_string(),
                        node_id: Some(payload.name),
                        metadata: Some(metadata),
                        updated_at: None,
                    })
                    .await?;
                info!(address = %address, "agent registered on-chain");
            }

            PrecompileKind::Heartbeat => {
                let address = canonical_address(&tx.from);
                if self.store.get_agent(&address).await?.is_some() {
                    self.store
                        .touch_agent_heartbeat(&address, block_time)
                        .await?;
                } else {
                    // Heartbeats from unknown senders auto-register
                    self.upsert_minimal_agent(&address, block_time).await?;
                    info!(address = %address, "agent auto-registered from heartbeat");
                }
            }

            PrecompileKind::VerifyInference => {
                let Some(agent) = decode_agent_slot(&tx.input) else {
                    warn!(tx = ?tx.hash, "malformed verify-inference calldata, skipping");
                    return Ok(());
                };
                let address = canonical_address(&agent);
                if self.store.get_agent(&address).await?.is_none() {
                    self.upsert_minimal_agent(&address, block_time).await?;
                }
                debug!(address = %address, "inference verification observed");
            }

            PrecompileKind::ClaimReward => {
                let topic = reward_claimed_topic();
                for log in &receipt.logs {
                    if log.topics.first() == Some(&topic) {
                        let claimer = log
                            .topics
                            .get(1)
                            .map(|t| Address::from_slice(&t.as_bytes()[12..]))
                            .unwrap_or(tx.from);
                        info!(address = %canonical_address(&claimer), "reward claimed");
                    }
                }
            }
        }

        Ok(())
    }

    async fn upsert_minimal_agent(&self, address: &str, block_time: i64) -> Result<()> {
        self.store
            .upsert_agent(&AgentRow {
                address: address.to_string(),
                registered_at: block_time,
                last_heartbeat: block_time,
                status: agent_status::ACTIVE.to_string(),
                stake: "0".to_string(),
                node_id: None,
                metadata: None,
                updated_at: None,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_all_four_precompiles() {
        assert_eq!(
            classify_precompile(&Address::from_low_u64_be(0x20)),
            Some(PrecompileKind::VerifyInference)
        );
        assert_eq!(
            classify_precompile(&Address::from_low_u64_be(0x21)),
            Some(PrecompileKind::Register)
        );
        assert_eq!(
            classify_precompile(&Address::from_low_u64_be(0x22)),
            Some(PrecompileKind::Heartbeat)
        );
        assert_eq!(
            classify_precompile(&Address::from_low_u64_be(0x23)),
            Some(PrecompileKind::ClaimReward)
        );
    }

    #[test]
    fn ordinary_addresses_are_ignored() {
        assert_eq!(classify_precompile(&Address::from_low_u64_be(0x24)), None);
        assert_eq!(classify_precompile(&Address::from_low_u64_be(0x1F)), None);
        assert_eq!(
            classify_precompile(&"0x1111111111111111111111111111111111111111".parse().unwrap()),
            None
        );
    }
}
