//! LAN cluster formation for memory-constrained nodes.
//!
//! A node whose available memory is below the model's requirement cannot
//! serve it standalone; peers on the same `/24` subnet are combined into a
//! coordinator/worker cluster that jointly covers the layer range. Formed
//! clusters are sticky: a young cluster or a transiently-missing member is
//! not grounds for reformation.

use crate::allocator::{split_weight, unix_now, Allocator};
use crate::catalog::ModelCatalog;
use crate::topology::{TopologyBus, TopologyEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use synapse_storage::models::{node_mode, AssignmentRow};
use synapse_storage::{Result, Store};
use tracing::{debug, info, warn};

/// A cluster younger than this is kept even when membership shifts.
pub const CLUSTER_MIN_AGE_SECS: i64 = 300;
/// A member missing for less than this is treated as transient.
pub const NODE_OFFLINE_GRACE_SECS: i64 = 120;

/// `/24` prefix of a dotted-quad LAN address
pub fn subnet_24(ip: &str) -> Option<String> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return None;
    }
    Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
}

/// Candidate node for cluster planning
#[derive(Debug, Clone)]
pub struct ClusterCandidate {
    pub address: String,
    pub tok_per_sec: f64,
    pub avail_mem_mb: u64,
}

/// Planned member with its layer span; first member is the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMember {
    pub address: String,
    pub coordinator: bool,
    pub layer_start: u32,
    pub layer_end: u32,
}

/// Greedy cluster plan: highest-throughput nodes first until the combined
/// memory covers the requirement. Layer spans follow throughput share,
/// capped by what each node's memory can hold; the last member absorbs the
/// remainder. Returns `None` when fewer than two members suffice or the
/// group cannot cover the requirement.
pub fn plan_cluster(
    mut candidates: Vec<ClusterCandidate>,
    mem_req_mb: u64,
    total_layers: u32,
) -> Option<Vec<PlannedMember>> {
    if mem_req_mb == 0 || total_layers == 0 {
        return None;
    }

    candidates.sort_by(|a, b| {
        b.tok_per_sec
            .partial_cmp(&a.tok_per_sec)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.address.cmp(&b.address))
    });

    let mut selected = Vec::new();
    let mut combined_mem = 0u64;
    for candidate in candidates {
        combined_mem += candidate.avail_mem_mb;
        selected.push(candidate);
        if combined_mem >= mem_req_mb {
            break;
        }
    }

    if selected.len() < 2 || combined_mem < mem_req_mb {
        return None;
    }

    let tok_total: f64 = selected.iter().map(|c| c.tok_per_sec).sum();
    let n = selected.len();
    let mut members = Vec::with_capacity(n);
    let mut cursor = 0u32;

    for (i, candidate) in selected.iter().enumerate() {
        let remaining = total_layers - cursor;
        let span = if i == n - 1 {
            remaining
        } else {
            let share = if tok_total > 0.0 {
                (total_layers as f64 * candidate.tok_per_sec / tok_total) as u32
            } else {
                total_layers / n as u32
            };
            // No node is handed more layers than its memory can hold
            let cap = ((candidate.avail_mem_mb as u128 * total_layers as u128)
                / mem_req_mb as u128) as u32;
            let later_members = (n - 1 - i) as u32;
            share.min(cap).max(1).min(remaining.saturating_sub(later_members))
        };

        members.push(PlannedMember {
            address: candidate.address.clone(),
            coordinator: i == 0,
            layer_start: cursor,
            layer_end: cursor + span,
        });
        cursor += span;
    }

    Some(members)
}

#[derive(Debug, Clone)]
struct ClusterState {
    model: String,
    subnet: String,
    formed_at: i64,
    members: Vec<String>,
}

/// Cluster lifecycle manager
pub struct ClusterManager {
    store: Arc<Store>,
    catalog: ModelCatalog,
    bus: TopologyBus,
    allocator: Arc<Allocator>,
    clusters: Mutex<HashMap<String, ClusterState>>,
    min_age: i64,
    offline_grace: i64,
    heartbeat_timeout: i64,
}

impl ClusterManager {
    pub fn new(
        store: Arc<Store>,
        catalog: ModelCatalog,
        bus: TopologyBus,
        allocator: Arc<Allocator>,
    ) -> Self {
        Self {
            store,
            catalog,
            bus,
            allocator,
            clusters: Mutex::new(HashMap::new()),
            min_age: CLUSTER_MIN_AGE_SECS,
            offline_grace: NODE_OFFLINE_GRACE_SECS,
            heartbeat_timeout: crate::allocator::HEARTBEAT_TIMEOUT_SECS,
        }
    }

    /// Reconstruct in-memory cluster state from assignment rows after a
    /// restart. Formation time is approximated by the oldest member
    /// heartbeat, which only delays the first hysteresis window.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut rehydrated = HashMap::new();

        for model in self.store.list_models().await? {
            let rows = self.store.assignments_for_model(&model).await?;

            let mut grouped: HashMap<String, Vec<&AssignmentRow>> = HashMap::new();
            for row in &rows {
                if let Some(id) = &row.cluster_id {
                    grouped.entry(id.clone()).or_default().push(row);
                }
            }

            for (id, members) in grouped {
                let subnet = members
                    .iter()
                    .find_map(|m| m.lan_ip.as_deref().and_then(subnet_24));
                let Some(subnet) = subnet else { continue };
                let formed_at = members.iter().map(|m| m.updated_at).min().unwrap_or(0);
                rehydrated.insert(
                    id,
                    ClusterState {
                        model: model.clone(),
                        subnet,
                        formed_at,
                        members: members.iter().map(|m| m.node_address.clone()).collect(),
                    },
                );
            }
        }

        let mut clusters = self.clusters.lock();
        info!(clusters = rehydrated.len(), "cluster state rehydrated");
        *clusters = rehydrated;
        Ok(())
    }

    /// Check existing clusters for `model` and form new ones from
    /// unclustered memory-constrained nodes, then re-split the remaining
    /// standalone pipeline.
    pub async fn rebalance_model(&self, model: &str) -> Result<()> {
        let now = unix_now();
        let cutoff = now - self.heartbeat_timeout;
        let mem_req = self.catalog.mem_req_mb(model);
        let total_layers = self.catalog.layer_count(model);

        let rows = self.store.assignments_for_model(model).await?;
        let by_address: HashMap<String, &AssignmentRow> =
            rows.iter().map(|r| (r.node_address.clone(), r)).collect();

        // 1. Dissolve clusters with a member offline beyond the grace window
        let dissolved = self.dissolve_expired(model, now, &by_address).await?;

        // 2. Collect distributable active nodes not owned by a kept cluster
        let kept_members: Vec<String> = {
            let clusters = self.clusters.lock();
            clusters
                .values()
                .filter(|c| c.model == model)
                .flat_map(|c| c.members.iter().cloned())
                .collect()
        };

        let mut candidates_by_subnet: HashMap<String, Vec<(ClusterCandidate, &AssignmentRow)>> =
            HashMap::new();
        for row in &rows {
            if row.updated_at < cutoff || kept_members.contains(&row.node_address) {
                continue;
            }
            let Some(node) = self.store.get_node(&row.node_address).await? else {
                continue;
            };
            if !node.can_distribute {
                continue;
            }
            let Some(subnet) = row.lan_ip.as_deref().and_then(subnet_24) else {
                continue;
            };
            let avail = split_weight(&row.device, row.vram_mb, row.ram_mb);
            if avail >= mem_req {
                // Standalone-capable: the general allocator handles it
                continue;
            }
            candidates_by_subnet.entry(subnet).or_default().push((
                ClusterCandidate {
                    address: row.node_address.clone(),
                    tok_per_sec: row.benchmark_tok_per_sec,
                    avail_mem_mb: avail,
                },
                row,
            ));
        }

        // 3. Form a cluster per subnet group that can cover the model
        for (subnet, group) in candidates_by_subnet {
            let (candidates, group_rows): (Vec<ClusterCandidate>, Vec<&AssignmentRow>) =
                group.into_iter().unzip();

            let Some(plan) = plan_cluster(candidates, mem_req, total_layers) else {
                debug!(model, %subnet, "subnet group cannot cover model, leaving unclustered");
                continue;
            };

            let cluster_id = format!("{:016x}", rand::random::<u64>());
            let mut batch = Vec::with_capacity(plan.len());
            for member in &plan {
                let Some(row) = group_rows
                    .iter()
                    .find(|r| r.node_address == member.address)
                else {
                    continue;
                };
                let mut updated = (*row).clone();
                updated.layer_start = member.layer_start as i32;
                updated.layer_end = member.layer_end as i32;
                updated.total_layers = total_layers as i32;
                updated.pipeline_order = member.layer_start as i32;
                updated.node_mode = if member.coordinator {
                    node_mode::COORDINATOR.to_string()
                } else {
                    node_mode::RPC_SERVER.to_string()
                };
                updated.cluster_id = Some(cluster_id.clone());
                updated.ready = false;
                batch.push(updated);
            }

            self.store.save_assignments(&batch).await?;
            info!(
                model,
                %subnet,
                cluster = %cluster_id,
                members = batch.len(),
                "cluster formed"
            );

            self.clusters.lock().insert(
                cluster_id,
                ClusterState {
                    model: model.to_string(),
                    subnet,
                    formed_at: now,
                    members: plan.iter().map(|m| m.address.clone()).collect(),
                },
            );
        }

        // 4. Re-split the remaining standalone pipeline and publish topology
        self.allocator.reassign_model(model).await?;

        for address in dissolved {
            self.bus.publish(TopologyEvent::NodeStatus {
                model: model.to_string(),
                address,
                status: "unclustered".to_string(),
                timestamp: now,
            });
        }

        Ok(())
    }

    /// Drop a node from any cluster it belongs to (stale sweep removal).
    /// The affected model is rebalanced by the caller.
    pub fn forget_member(&self, address: &str) {
        let mut clusters = self.clusters.lock();
        for state in clusters.values_mut() {
            state.members.retain(|m| m != address);
        }
        clusters.retain(|_, state| !state.members.is_empty());
    }

    /// Dissolve clusters whose members expired; returns the released
    /// member addresses.
    async fn dissolve_expired(
        &self,
        model: &str,
        now: i64,
        by_address: &HashMap<String, &AssignmentRow>,
    ) -> Result<Vec<String>> {
        let expired: Vec<(String, ClusterState)> = {
            let clusters = self.clusters.lock();
            clusters
                .iter()
                .filter(|(_, state)| state.model == model)
                .filter(|(_, state)| {
                    let age = now - state.formed_at;
                    let worst_offline = state
                        .members
                        .iter()
                        .map(|m| match by_address.get(m) {
                            Some(row) => now - row.updated_at,
                            None => i64::MAX,
                        })
                        .max()
                        .unwrap_or(i64::MAX);

                    // Hysteresis: a young cluster rides out churn, and a
                    // member missing only transiently is not grounds for
                    // reformation
                    age >= self.min_age && worst_offline > self.offline_grace
                })
                .map(|(id, state)| (id.clone(), state.clone()))
                .collect()
        };

        let mut released = Vec::new();
        for (id, state) in expired {
            warn!(model, cluster = %id, "dissolving cluster: member offline beyond grace");
            for address in &state.members {
                if let Some(row) = by_address.get(address) {
                    let mut updated = (*row).clone();
                    updated.node_mode = node_mode::STANDALONE.to_string();
                    updated.cluster_id = None;
                    updated.ready = false;
                    self.store.upsert_assignment(&updated).await?;
                }
                released.push(address.clone());
            }
            self.clusters.lock().remove(&id);
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(address: &str, tok: f64, mem: u64) -> ClusterCandidate {
        ClusterCandidate {
            address: address.to_string(),
            tok_per_sec: tok,
            avail_mem_mb: mem,
        }
    }

    #[test]
    fn subnet_grouping() {
        assert_eq!(subnet_24("192.168.0.17"), Some("192.168.0".to_string()));
        assert_eq!(subnet_24("192.168.1.17"), Some("192.168.1".to_string()));
        assert_eq!(subnet_24("not-an-ip"), None);
        assert_eq!(subnet_24("192.168.0.999"), None);
    }

    #[test]
    fn two_lan_peers_cover_a_large_model() {
        // Two peers that can each hold exactly half of a 32-layer model
        // requiring 18 GB combined
        let plan = plan_cluster(
            vec![candidate("0xbb01", 120.0, 9_000), candidate("0xbb02", 100.0, 9_000)],
            18_000,
            32,
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert!(plan[0].coordinator);
        assert_eq!(plan[0].address, "0xbb01"); // higher tok/s leads
        assert!(!plan[1].coordinator);
        assert_eq!((plan[0].layer_start, plan[0].layer_end), (0, 16));
        assert_eq!((plan[1].layer_start, plan[1].layer_end), (16, 32));
    }

    #[test]
    fn single_member_never_forms_a_cluster() {
        let plan = plan_cluster(vec![candidate("0xbb01", 120.0, 30_000)], 18_000, 32);
        assert!(plan.is_none());
    }

    #[test]
    fn insufficient_memory_never_forms_a_cluster() {
        let plan = plan_cluster(
            vec![candidate("0xbb01", 120.0, 4_000), candidate("0xbb02", 100.0, 4_000)],
            18_000,
            32,
        );
        assert!(plan.is_none());
    }

    #[test]
    fn greedy_selection_stops_once_memory_suffices() {
        let plan = plan_cluster(
            vec![
                candidate("0xcc01", 300.0, 10_000),
                candidate("0xcc02", 200.0, 10_000),
                candidate("0xcc03", 100.0, 10_000),
            ],
            18_000,
            32,
        )
        .unwrap();

        // Third node is unnecessary
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].address, "0xcc01");
        assert_eq!(plan[1].address, "0xcc02");
    }

    #[test]
    fn spans_cover_layers_in_pipeline_order() {
        let plan = plan_cluster(
            vec![
                candidate("0xdd01", 250.0, 7_000),
                candidate("0xdd02", 150.0, 7_000),
                candidate("0xdd03", 100.0, 7_000),
            ],
            20_000,
            40,
        )
        .unwrap();

        let mut cursor = 0;
        for member in &plan {
            assert_eq!(member.layer_start, cursor);
            assert!(member.layer_end > member.layer_start);
            cursor = member.layer_end;
        }
        assert_eq!(cursor, 40);
        assert_eq!(plan.iter().filter(|m| m.coordinator).count(), 1);
    }

    #[test]
    fn peers_on_other_subnets_never_mix() {
        // Two peers on 192.168.0.* and one on 192.168.1.*; grouping is by
        // /24, so the third peer's subnet has to stand on its own
        let peers = [
            ("0xbb01", "192.168.0.10", 120.0, 9_000u64),
            ("0xbb02", "192.168.0.11", 100.0, 9_000),
            ("0xbb03", "192.168.1.12", 150.0, 9_000),
        ];

        let mut by_subnet: HashMap<String, Vec<ClusterCandidate>> = HashMap::new();
        for (address, ip, tok, mem) in peers {
            by_subnet
                .entry(subnet_24(ip).unwrap())
                .or_default()
                .push(candidate(address, tok, mem));
        }

        let formed = plan_cluster(by_subnet.remove("192.168.0").unwrap(), 18_000, 32).unwrap();
        assert_eq!(formed.len(), 2);
        assert!(formed.iter().all(|m| m.address != "0xbb03"));

        // A lone peer short of the requirement stays unclustered
        assert!(plan_cluster(by_subnet.remove("192.168.1").unwrap(), 18_000, 32).is_none());
    }

    #[test]
    fn memory_cap_limits_fast_nodes() {
        // The fast node's memory only holds a quarter of the layers
        let plan = plan_cluster(
            vec![candidate("0xee01", 900.0, 5_000), candidate("0xee02", 100.0, 15_000)],
            20_000,
            32,
        )
        .unwrap();

        // Share would be 28 layers; the cap keeps it at 8
        assert_eq!((plan[0].layer_start, plan[0].layer_end), (0, 8));
        assert_eq!((plan[1].layer_start, plan[1].layer_end), (8, 32));
    }
}
