//! Chain client: typed access to the registry, reward pool and challenge
//! manager, plus the raw precompile writes the oracle sponsors.
//!
//! Core services depend on the [`ChainClient`] trait so tests can substitute
//! an in-memory chain; [`EvmChain`] is the ethers-backed implementation.

use crate::contracts::{AgentRegistry, ChallengeManager, RewardPool};
use crate::error::{ChainError, Result};
use crate::precompiles::{self, PRECOMPILE_AGENT_HEARTBEAT};
use async_trait::async_trait;
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type OracleMiddleware = SignerMiddleware<Provider<Ws>, LocalWallet>;

/// Maximum number of retry attempts for transaction submission.
const MAX_TX_RETRIES: u32 = 3;
const INITIAL_TX_BACKOFF: Duration = Duration::from_secs(2);

/// Lowercase 0x-prefixed hex form used everywhere addresses are compared
/// or persisted.
pub fn canonical_address(addr: &Address) -> String {
    format!("{addr:#x}")
}

pub fn parse_address(s: &str) -> Result<Address> {
    s.parse()
        .map_err(|e| ChainError::Decode(format!("invalid address {s}: {e}")))
}

/// On-chain agent record from the registry
#[derive(Debug, Clone)]
pub struct OnChainAgent {
    pub node_id: H256,
    pub metadata: String,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub status: u8,
    pub stake: U256,
}

/// One agent's contribution tuple as submitted to the reward pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionReport {
    pub agent: Address,
    pub task_count: u64,
    pub uptime: u64,
    pub response_score: u64,
    pub processed_tokens: u64,
    pub avg_latency_inv: u64,
}

/// Contribution tuple as read back from the contract
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnChainContribution {
    pub task_count: u64,
    pub uptime: u64,
    pub response_score: u64,
    pub processed_tokens: u64,
    pub avg_latency_inv: u64,
}

/// Current challenge as read from the challenge manager
#[derive(Debug, Clone)]
pub struct ChallengeInfo {
    pub id: H256,
    pub difficulty: u8,
    pub seed: H256,
    pub created_at: u64,
    pub expires_at: u64,
    pub solved: bool,
    pub solver: Address,
    pub reward_bonus: U256,
}

#[derive(Debug, Clone)]
pub struct ChallengeCreatedEvent {
    pub id: H256,
    pub difficulty: u8,
    pub expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct ChallengeSolvedEvent {
    pub id: H256,
    pub solver: Address,
    pub solve_time: u64,
}

/// Response shape of the `agent_getAgentMeta` custom RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMeta {
    pub node_id: Option<String>,
    pub metadata: Option<String>,
}

/// The chain surface the oracle consumes
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_epoch(&self) -> Result<u64>;
    async fn current_block(&self) -> Result<u64>;
    async fn balance(&self, addr: Address) -> Result<U256>;
    async fn is_agent_account(&self, addr: Address) -> Result<bool>;
    async fn agent_meta(&self, addr: Address) -> Result<Option<AgentMeta>>;

    async fn active_agents(&self) -> Result<Vec<Address>>;
    async fn all_agents(&self) -> Result<Vec<Address>>;
    async fn get_agent(&self, addr: Address) -> Result<OnChainAgent>;

    async fn report_contribution(&self, report: &ContributionReport) -> Result<H256>;
    async fn sync_rewards(&self) -> Result<H256>;
    async fn distribute_rewards(&self, epoch: u64) -> Result<H256>;
    async fn epoch_distributed(&self, epoch: u64) -> Result<bool>;
    async fn epoch_reward(&self, epoch: u64) -> Result<U256>;
    async fn epoch_agents(&self, epoch: u64) -> Result<Vec<Address>>;
    async fn epoch_contribution(&self, epoch: u64, addr: Address) -> Result<OnChainContribution>;
    async fn pending_reward(&self, addr: Address) -> Result<U256>;

    async fn current_challenge(&self) -> Result<Option<ChallengeInfo>>;
    async fn create_challenge(&self, difficulty: u8, seed: H256, duration: u64) -> Result<H256>;
    async fn challenge_created_since(&self, from_block: u64) -> Result<Vec<ChallengeCreatedEvent>>;
    async fn challenge_solved_since(&self, from_block: u64) -> Result<Vec<ChallengeSolvedEvent>>;

    async fn sponsored_heartbeat(&self, agent: Address) -> Result<H256>;
}

/// ethers-backed chain client over a WebSocket provider
pub struct EvmChain {
    provider: Arc<Provider<Ws>>,
    client: Arc<OracleMiddleware>,
    registry: AgentRegistry<OracleMiddleware>,
    rewards: RewardPool<OracleMiddleware>,
    challenges: ChallengeManager<OracleMiddleware>,
    oracle_address: Address,
}

impl EvmChain {
    pub async fn connect(
        ws_url: &str,
        private_key: &str,
        chain_id: Option<u64>,
        registry_address: Address,
        reward_pool_address: Address,
        challenge_manager_address: Address,
    ) -> Result<Self> {
        let provider = Provider::<Ws>::connect(ws_url)
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;
        let provider = Arc::new(provider);

        let chain_id = match chain_id {
            Some(id) => id,
            None => provider
                .get_chainid()
                .await
                .map_err(|e| ChainError::Connection(format!("failed to get chain id: {e}")))?
                .as_u64(),
        };

        let wallet: LocalWallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| ChainError::Connection(format!("invalid signer key: {e}")))?
            .with_chain_id(chain_id);
        let oracle_address = wallet.address();

        let client = Arc::new(SignerMiddleware::new((*provider).clone(), wallet));

        info!(
            oracle = %canonical_address(&oracle_address),
            chain_id,
            "Chain client connected"
        );

        Ok(Self {
            registry: AgentRegistry::new(registry_address, Arc::clone(&client)),
            rewards: RewardPool::new(reward_pool_address, Arc::clone(&client)),
            challenges: ChallengeManager::new(challenge_manager_address, Arc::clone(&client)),
            provider,
            client,
            oracle_address,
        })
    }

    pub fn oracle_address(&self) -> Address {
        self.oracle_address
    }

    /// Subscribe to new block headers. The watcher re-subscribes with
    /// backoff when the stream ends.
    pub async fn subscribe_blocks(&self) -> Result<SubscriptionStream<'_, Ws, Block<TxHash>>> {
        self.provider
            .subscribe_blocks()
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))
    }

    pub async fn full_block(&self, hash: H256) -> Result<Option<Block<Transaction>>> {
        self.provider
            .get_block_with_txs(hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    pub async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    /// Send a prepared call, await inclusion, verify success status.
    /// Retries with exponential backoff on submission failure.
    async fn send_with_retry<F>(&self, what: &str, make_call: F) -> Result<H256>
    where
        F: Fn() -> ContractCall<OracleMiddleware, ()>,
    {
        let mut backoff = INITIAL_TX_BACKOFF;

        for attempt in 0..=MAX_TX_RETRIES {
            let call = make_call();
            let send_result = call.send().await;
            match send_result {
                Ok(pending) => {
                    let receipt = pending
                        .await
                        .map_err(|e| ChainError::Transaction(e.to_string()))?
                        .ok_or_else(|| {
                            ChainError::Transaction(format!("{what}: transaction dropped"))
                        })?;

                    if receipt.status != Some(U64::from(1)) {
                        return Err(ChainError::Transaction(format!(
                            "{what}: reverted in tx {:?}",
                            receipt.transaction_hash
                        )));
                    }
                    return Ok(receipt.transaction_hash);
                }
                Err(e) if attempt < MAX_TX_RETRIES => {
                    warn!(
                        "{what}: attempt {}/{} failed: {}, retrying in {:?}",
                        attempt + 1,
                        MAX_TX_RETRIES,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(ChainError::Transaction(format!(
                        "{what}: failed after {} attempts: {e}",
                        MAX_TX_RETRIES + 1
                    )));
                }
            }
        }

        Err(ChainError::Transaction(format!("{what}: retries exhausted")))
    }
}

#[async_trait]
impl ChainClient for EvmChain {
    async fn current_epoch(&self) -> Result<u64> {
        let epoch = self
            .rewards
            .get_current_epoch()
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;
        Ok(epoch.as_u64())
    }

    async fn current_block(&self) -> Result<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(block.as_u64())
    }

    async fn balance(&self, addr: Address) -> Result<U256> {
        self.provider
            .get_balance(addr, None)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn is_agent_account(&self, addr: Address) -> Result<bool> {
        self.provider
            .request("agent_isAgentAccount", [canonical_address(&addr)])
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn agent_meta(&self, addr: Address) -> Result<Option<AgentMeta>> {
        self.provider
            .request("agent_getAgentMeta", [canonical_address(&addr)])
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn active_agents(&self) -> Result<Vec<Address>> {
        self.registry
            .get_active_agents()
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))
    }

    async fn all_agents(&self) -> Result<Vec<Address>> {
        self.registry
            .get_all_agents()
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))
    }

    async fn get_agent(&self, addr: Address) -> Result<OnChainAgent> {
        let (node_id, metadata, registered_at, last_heartbeat, status, stake) = self
            .registry
            .get_agent(addr)
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(OnChainAgent {
            node_id: H256::from(node_id),
            metadata,
            registered_at: registered_at.as_u64(),
            last_heartbeat: last_heartbeat.as_u64(),
            status,
            stake,
        })
    }

    async fn report_contribution(&self, report: &ContributionReport) -> Result<H256> {
        let r = report.clone();
        self.send_with_retry("reportContribution", move || {
            self.rewards.report_contribution(
                r.agent,
                U256::from(r.task_count),
                U256::from(r.uptime),
                U256::from(r.response_score),
                U256::from(r.processed_tokens),
                U256::from(r.avg_latency_inv),
            )
        })
        .await
    }

    async fn sync_rewards(&self) -> Result<H256> {
        self.send_with_retry("syncRewards", || self.rewards.sync_rewards())
            .await
    }

    async fn distribute_rewards(&self, epoch: u64) -> Result<H256> {
        self.send_with_retry("distributeRewards", move || {
            self.rewards.distribute_rewards(U256::from(epoch))
        })
        .await
    }

    async fn epoch_distributed(&self, epoch: u64) -> Result<bool> {
        self.rewards
            .epoch_distributed(U256::from(epoch))
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))
    }

    async fn epoch_reward(&self, epoch: u64) -> Result<U256> {
        self.rewards
            .epoch_reward(U256::from(epoch))
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))
    }

    async fn epoch_agents(&self, epoch: u64) -> Result<Vec<Address>> {
        self.rewards
            .get_epoch_agents(U256::from(epoch))
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))
    }

    async fn epoch_contribution(&self, epoch: u64, addr: Address) -> Result<OnChainContribution> {
        let (task_count, uptime, response_score, processed_tokens, avg_latency_inv) = self
            .rewards
            .get_epoch_contribution(U256::from(epoch), addr)
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(OnChainContribution {
            task_count: task_count.as_u64(),
            uptime: uptime.as_u64(),
            response_score: response_score.as_u64(),
            processed_tokens: processed_tokens.as_u64(),
            avg_latency_inv: avg_latency_inv.as_u64(),
        })
    }

    async fn pending_reward(&self, addr: Address) -> Result<U256> {
        self.rewards
            .get_pending_reward(addr)
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))
    }

    async fn current_challenge(&self) -> Result<Option<ChallengeInfo>> {
        let (id, difficulty, seed, created_at, expires_at, solved, solver, reward_bonus) = self
            .challenges
            .get_current_challenge()
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        let id = H256::from(id);
        if id == H256::zero() {
            return Ok(None);
        }

        Ok(Some(ChallengeInfo {
            id,
            difficulty,
            seed: H256::from(seed),
            created_at: created_at.as_u64(),
            expires_at: expires_at.as_u64(),
            solved,
            solver,
            reward_bonus,
        }))
    }

    async fn create_challenge(&self, difficulty: u8, seed: H256, duration: u64) -> Result<H256> {
        self.send_with_retry("createChallenge", move || {
            self.challenges
                .create_challenge(difficulty, seed.to_fixed_bytes(), U256::from(duration))
        })
        .await
    }

    async fn challenge_created_since(&self, from_block: u64) -> Result<Vec<ChallengeCreatedEvent>> {
        let events = self
            .challenges
            .challenge_created_filter()
            .from_block(from_block)
            .query()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(events
            .into_iter()
            .map(|e| ChallengeCreatedEvent {
                id: H256::from(e.id),
                difficulty: e.difficulty,
                expires_at: e.expires_at.as_u64(),
            })
            .collect())
    }

    async fn challenge_solved_since(&self, from_block: u64) -> Result<Vec<ChallengeSolvedEvent>> {
        let events = self
            .challenges
            .challenge_solved_filter()
            .from_block(from_block)
            .query()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(events
            .into_iter()
            .map(|e| ChallengeSolvedEvent {
                id: H256::from(e.id),
                solver: e.solver,
                solve_time: e.solve_time.as_u64(),
            })
            .collect())
    }

    /// Agents may hold zero balance; the oracle is the designated gas payer
    /// for their heartbeats.
    async fn sponsored_heartbeat(&self, agent: Address) -> Result<H256> {
        let tx = TransactionRequest::new()
            .to(precompiles::precompile_address(PRECOMPILE_AGENT_HEARTBEAT))
            .data(precompiles::encode_heartbeat(agent));

        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| ChainError::Transaction(e.to_string()))?;

        let receipt = pending
            .await
            .map_err(|e| ChainError::Transaction(e.to_string()))?
            .ok_or_else(|| ChainError::Transaction("sponsored heartbeat dropped".to_string()))?;

        Ok(receipt.transaction_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_address_is_lowercase_full_width() {
        let addr: Address = "0xAAbBcCdDeEff00112233445566778899aAbBcCdD"
            .parse()
            .unwrap();
        let canonical = canonical_address(&addr);
        assert_eq!(canonical, "0xaabbccddeeff00112233445566778899aabbccdd");
        assert_eq!(canonical.len(), 42);
    }

    #[test]
    fn parse_address_rejects_garbage() {
        assert!(parse_address("not-an-address").is_err());
        assert!(parse_address("0x1234").is_err());
    }
}
