//! Per-model layer assignment.
//!
//! Runs on every pipeline registration or update, after stale-sweep
//! removals and after cluster reformation. The split is computed over the
//! full active set and persisted as one batch so a half-updated pipeline is
//! never observable.

use crate::catalog::ModelCatalog;
use crate::topology::{TopologyBus, TopologyEvent, TopologyNode};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use synapse_storage::models::{node_mode, AssignmentRow};
use synapse_storage::{Result, Store};
use tracing::{debug, info};

/// Assignments whose heartbeat is older than this are not part of any split.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 600;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Split weight for a node: vram when the device is a GPU and reports any,
/// otherwise ram.
pub fn split_weight(device: &str, vram_mb: i64, ram_mb: i64) -> u64 {
    if device != "cpu" && vram_mb > 0 {
        vram_mb as u64
    } else {
        ram_mb.max(0) as u64
    }
}

/// Split order for a model pipeline: lightest node first, address as the
/// tie-break, so the heaviest node sits last and absorbs the rounding
/// remainder of the proportional split.
pub fn sort_for_split(pipeline: &mut [AssignmentRow]) {
    pipeline.sort_by(|a, b| {
        let wa = split_weight(&a.device, a.vram_mb, a.ram_mb);
        let wb = split_weight(&b.device, b.vram_mb, b.ram_mb);
        wa.cmp(&wb).then_with(|| a.node_address.cmp(&b.node_address))
    });
}

/// Proportional layer split. The returned spans cover `[0, total_layers)`
/// exactly, pairwise disjoint, one per input weight; the last node absorbs
/// the rounding remainder. Zero total weight degrades to an equal split.
pub fn split_layers(weights: &[u64], total_layers: u32) -> Vec<(u32, u32)> {
    let n = weights.len();
    if n == 0 || total_layers == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![(0, total_layers)];
    }

    let total_weight: u64 = weights.iter().sum();
    let mut spans = Vec::with_capacity(n);
    let mut cursor = 0u32;

    for (i, &w) in weights.iter().enumerate() {
        let span = if i == n - 1 {
            total_layers - cursor
        } else if total_weight == 0 {
            total_layers / n as u32
        } else {
            ((total_layers as u64 * w) / total_weight) as u32
        };
        spans.push((cursor, cursor + span));
        cursor += span;
    }

    spans
}

/// Layer assignment service for one deployment
pub struct Allocator {
    store: Arc<Store>,
    catalog: ModelCatalog,
    bus: TopologyBus,
    heartbeat_timeout: i64,
}

impl Allocator {
    pub fn new(store: Arc<Store>, catalog: ModelCatalog, bus: TopologyBus) -> Self {
        Self {
            store,
            catalog,
            bus,
            heartbeat_timeout: HEARTBEAT_TIMEOUT_SECS,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn bus(&self) -> &TopologyBus {
        &self.bus
    }

    /// Recompute the split for `model` over the current active set and
    /// persist it as one batch. Cluster-owned rows are left to the cluster
    /// manager; endpoint-collapsed rows are listed as standalone inference
    /// nodes and excluded from splitting.
    pub async fn reassign_model(&self, model: &str) -> Result<Vec<AssignmentRow>> {
        let now = unix_now();
        let cutoff = now - self.heartbeat_timeout;
        let total_layers = self.catalog.layer_count(model) as i32;

        let rows = self.store.assignments_for_model(model).await?;

        let mut pipeline: Vec<AssignmentRow> = Vec::new();
        let mut listed: Vec<AssignmentRow> = Vec::new();

        for row in rows {
            if row.updated_at < cutoff {
                continue;
            }
            if row.cluster_id.is_some() {
                listed.push(row);
            } else if row.grpc_endpoint == row.http_endpoint {
                // Single-transport rows run the whole model themselves
                let mut standalone = row;
                standalone.layer_start = 0;
                standalone.layer_end = total_layers;
                standalone.total_layers = total_layers;
                standalone.pipeline_order = 0;
                standalone.node_mode = node_mode::STANDALONE.to_string();
                listed.push(standalone);
            } else {
                pipeline.push(row);
            }
        }

        sort_for_split(&mut pipeline);

        let weights: Vec<u64> = pipeline
            .iter()
            .map(|r| split_weight(&r.device, r.vram_mb, r.ram_mb))
            .collect();
        let spans = split_layers(&weights, total_layers as u32);

        for (i, (row, (start, end))) in pipeline.iter_mut().zip(spans).enumerate() {
            row.layer_start = start as i32;
            row.layer_end = end as i32;
            row.total_layers = total_layers;
            row.pipeline_order = i as i32;
            row.node_mode = node_mode::STANDALONE.to_string();
            row.cluster_id = None;
            row.ready = false;
        }

        let mut all: Vec<AssignmentRow> = Vec::with_capacity(pipeline.len() + listed.len());
        all.extend(pipeline);
        all.extend(listed);

        if !all.is_empty() {
            self.store.save_assignments(&all).await?;
        }

        info!(model, nodes = all.len(), "pipeline reassigned");
        self.publish_topology(model, &all, now);

        Ok(all)
    }

    /// Current active topology for a model, ordered for data flow
    pub async fn topology(&self, model: &str) -> Result<Vec<AssignmentRow>> {
        let cutoff = unix_now() - self.heartbeat_timeout;
        let mut rows = self.store.assignments_for_model(model).await?;
        rows.retain(|r| r.updated_at >= cutoff);
        rows.sort_by_key(|r| (r.cluster_id.clone(), r.pipeline_order));
        Ok(rows)
    }

    fn publish_topology(&self, model: &str, rows: &[AssignmentRow], timestamp: i64) {
        let nodes: Vec<TopologyNode> = rows.iter().map(TopologyNode::from).collect();
        self.bus.publish(TopologyEvent::Topology {
            model: model.to_string(),
            nodes,
            timestamp,
        });
        debug!(model, "topology event published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_row(address: &str, vram_mb: i64) -> AssignmentRow {
        AssignmentRow {
            node_address: address.to_string(),
            model_name: "llama-3-8b".to_string(),
            layer_start: 0,
            layer_end: 0,
            total_layers: 0,
            grpc_endpoint: format!("grpc://{address}:9000"),
            http_endpoint: format!("http://{address}:8000"),
            ram_mb: 16_000,
            device: "cuda".to_string(),
            vram_mb,
            benchmark_tok_per_sec: 0.0,
            ready: false,
            pipeline_order: 0,
            node_mode: node_mode::STANDALONE.to_string(),
            cluster_id: None,
            rpc_port: 0,
            lan_ip: None,
            updated_at: 0,
        }
    }

    #[test]
    fn single_node_takes_everything() {
        assert_eq!(split_layers(&[4096], 32), vec![(0, 32)]);
    }

    #[test]
    fn two_nodes_split_proportionally_with_remainder_to_last() {
        // 8 GiB and 16 GiB of vram over 32 layers, in split order
        let spans = split_layers(&[8192, 16384], 32);
        assert_eq!(spans, vec![(0, 10), (10, 32)]);
    }

    #[test]
    fn production_ordering_gives_the_heavy_node_the_remainder() {
        // Same 8 GiB / 16 GiB boundary case through the ordering the
        // assignment pass actually applies, regardless of arrival order
        let mut pipeline = vec![gpu_row("0xcc02", 16_384), gpu_row("0xcc01", 8_192)];
        sort_for_split(&mut pipeline);

        assert_eq!(pipeline[0].node_address, "0xcc01");
        assert_eq!(pipeline[1].node_address, "0xcc02");

        let weights: Vec<u64> = pipeline
            .iter()
            .map(|r| split_weight(&r.device, r.vram_mb, r.ram_mb))
            .collect();
        assert_eq!(weights, vec![8192, 16384]);
        assert_eq!(split_layers(&weights, 32), vec![(0, 10), (10, 32)]);
    }

    #[test]
    fn zero_weight_degrades_to_equal_split() {
        let spans = split_layers(&[0, 0, 0], 30);
        assert_eq!(spans, vec![(0, 10), (10, 20), (20, 30)]);
    }

    #[test]
    fn zero_weight_remainder_goes_to_last() {
        let spans = split_layers(&[0, 0, 0], 32);
        assert_eq!(spans, vec![(0, 10), (10, 20), (20, 32)]);
    }

    #[test]
    fn spans_cover_layers_disjointly() {
        let weights = [3000, 1000, 7000, 500];
        let spans = split_layers(&weights, 80);
        let mut cursor = 0;
        for (start, end) in &spans {
            assert_eq!(*start, cursor);
            assert!(end >= start);
            cursor = *end;
        }
        assert_eq!(cursor, 80);
    }

    #[test]
    fn empty_input_yields_no_spans() {
        assert!(split_layers(&[], 32).is_empty());
    }

    #[test]
    fn gpu_weight_prefers_vram() {
        assert_eq!(split_weight("cuda", 24_000, 64_000), 24_000);
        assert_eq!(split_weight("cuda", 0, 64_000), 64_000);
        assert_eq!(split_weight("cpu", 24_000, 64_000), 64_000);
    }
}
