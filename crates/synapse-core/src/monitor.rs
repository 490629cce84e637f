//! Monitor, sponsored heartbeat and stale sweep.
//!
//! The monitor tick reconciles on-chain agent state with the local
//! registry and refreshes the network snapshot. Separate slower ticks
//! submit sponsored heartbeats for gasless agents and sweep expired
//! pipeline assignments, re-allocating the affected models.

use crate::error::Result;
use crate::ingest::unix_now;
use std::collections::HashSet;
use std::sync::Arc;
use synapse_chain::{canonical_address, parse_address, ChainClient};
use synapse_pipeline::{ClusterManager, TopologyBus, TopologyEvent};
use synapse_storage::models::{agent_status, AgentRow, NetworkStatsRow};
use synapse_storage::Store;
use tracing::{info, warn};

/// Agents silent longer than this are marked inactive
pub const AGENT_INACTIVE_AFTER_SECS: i64 = 300;
/// On-chain heartbeats older than this get a sponsored refresh
pub const SPONSORED_HEARTBEAT_AFTER_SECS: i64 = 300;

pub struct NodeMonitor {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    clusters: Arc<ClusterManager>,
    bus: TopologyBus,
}

impl NodeMonitor {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        clusters: Arc<ClusterManager>,
        bus: TopologyBus,
    ) -> Self {
        Self {
            store,
            chain,
            clusters,
            bus,
        }
    }

    /// 30-second reconcile: mirror on-chain agents locally, merge node
    /// heartbeats into agent records, expire silent agents.
    pub async fn reconcile(&self) -> Result<()> {
        let now = unix_now();

        match self.chain.active_agents().await {
            Ok(agents) => {
                for agent in agents {
                    let address = canonical_address(&agent);
                    match self.chain.get_agent(agent).await {
                        Ok(info) => {
                            self.store
                                .upsert_agent(&AgentRow {
                                    address,
                                    registered_at: info.registered_at as i64,
                                    last_heartbeat: info.last_heartbeat as i64,
                                    status: agent_status::ACTIVE.to_string(),
                                    stake: info.stake.to_string(),
                                    node_id: Some(format!("{:#x}", info.node_id)),
                                    metadata: Some(info.metadata),
                                    updated_at: None,
                                })
                                .await?;
                        }
                        Err(e) => warn!(address = %address, "agent read failed: {e}"),
                    }
                }
            }
            Err(e) => warn!("active agent enumeration failed: {e}"),
        }

        // A live node implies a live agent
        let node_cutoff = now - synapse_pipeline::HEARTBEAT_TIMEOUT_SECS;
        for node in self.store.list_active_nodes(node_cutoff).await? {
            self.store
                .touch_agent_heartbeat(&node.address, node.last_heartbeat)
                .await?;
        }

        for agent in self.store.list_agents(10_000, 0).await? {
            if agent.status == agent_status::ACTIVE
                && now - agent.last_heartbeat > AGENT_INACTIVE_AFTER_SECS
            {
                self.store
                    .set_agent_status(&agent.address, agent_status::INACTIVE)
                    .await?;
            }
        }

        self.refresh_stats(now).await
    }

    /// Agents may hold zero balance and cannot pay their own gas; the
    /// oracle refreshes their on-chain heartbeat on their behalf.
    pub async fn sponsored_heartbeats(&self) -> Result<()> {
        let now = unix_now();
        let cutoff = now - synapse_pipeline::HEARTBEAT_TIMEOUT_SECS;

        for node in self.store.list_active_nodes(cutoff).await? {
            let Ok(agent) = parse_address(&node.address) else {
                continue;
            };
            let on_chain = match self.chain.get_agent(agent).await {
                Ok(info) => info.last_heartbeat as i64,
                Err(e) => {
                    warn!(address = %node.address, "on-chain heartbeat read failed: {e}");
                    continue;
                }
            };

            if now - on_chain > SPONSORED_HEARTBEAT_AFTER_SECS {
                match self.chain.sponsored_heartbeat(agent).await {
                    Ok(tx) => info!(address = %node.address, tx = ?tx, "sponsored heartbeat"),
                    Err(e) => warn!(address = %node.address, "sponsored heartbeat failed: {e}"),
                }
            }
        }
        Ok(())
    }

    /// Delete assignments whose unified heartbeat expired, then re-run
    /// allocation and cluster checks for every affected model.
    pub async fn sweep_stale(&self) -> Result<()> {
        let now = unix_now();
        let cutoff = now - synapse_pipeline::HEARTBEAT_TIMEOUT_SECS;

        let removed = self.store.delete_stale_assignments(cutoff).await?;
        if removed.is_empty() {
            return Ok(());
        }

        let mut models = HashSet::new();
        for row in &removed {
            self.clusters.forget_member(&row.node_address);
            models.insert(row.model_name.clone());
            self.bus.publish(TopologyEvent::NodeLeft {
                model: row.model_name.clone(),
                address: row.node_address.clone(),
                timestamp: now,
            });
            info!(
                address = %row.node_address,
                model = %row.model_name,
                "stale assignment removed"
            );
        }

        for model in models {
            if let Err(e) = self.clusters.rebalance_model(&model).await {
                warn!(model = %model, "post-sweep rebalance failed: {e}");
            }
        }
        Ok(())
    }

    async fn refresh_stats(&self, now: i64) -> Result<()> {
        let epoch = self.chain.current_epoch().await.unwrap_or(0) as i64;
        let total_agents = self.store.count_agents().await?;
        let active_nodes = self
            .store
            .list_active_nodes(now - synapse_pipeline::HEARTBEAT_TIMEOUT_SECS)
            .await?
            .len() as i64;
        let tokens_processed = self
            .store
            .metrics_for_epoch(epoch)
            .await?
            .iter()
            .map(|m| m.tokens_processed)
            .sum();
        let verified_proofs = self.store.count_verified_proofs(epoch).await?;

        self.store
            .save_network_stats(&NetworkStatsRow {
                id: 1,
                epoch,
                total_agents,
                active_nodes,
                tokens_processed,
                verified_proofs,
                updated_at: now,
            })
            .await?;
        Ok(())
    }
}
