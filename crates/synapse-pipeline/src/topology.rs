//! Topology change bus.
//!
//! Every assignment-table change is published here; the WebSocket edge fans
//! the events out to the downstream request router.

use serde::Serialize;
use synapse_storage::models::AssignmentRow;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// One node's slice of a model pipeline as exposed to the router
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyNode {
    pub address: String,
    pub layer_start: i32,
    pub layer_end: i32,
    pub total_layers: i32,
    pub grpc_endpoint: String,
    pub http_endpoint: String,
    pub pipeline_order: i32,
    pub node_mode: String,
    pub cluster_id: Option<String>,
    pub rpc_port: i32,
    pub lan_ip: Option<String>,
    pub ready: bool,
}

impl From<&AssignmentRow> for TopologyNode {
    fn from(row: &AssignmentRow) -> Self {
        Self {
            address: row.node_address.clone(),
            layer_start: row.layer_start,
            layer_end: row.layer_end,
            total_layers: row.total_layers,
            grpc_endpoint: row.grpc_endpoint.clone(),
            http_endpoint: row.http_endpoint.clone(),
            pipeline_order: row.pipeline_order,
            node_mode: row.node_mode.clone(),
            cluster_id: row.cluster_id.clone(),
            rpc_port: row.rpc_port,
            lan_ip: row.lan_ip.clone(),
            ready: row.ready,
        }
    }
}

/// Topology event published on the broadcast bus
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TopologyEvent {
    Topology {
        model: String,
        nodes: Vec<TopologyNode>,
        timestamp: i64,
    },
    NodeJoined {
        model: String,
        address: String,
        timestamp: i64,
    },
    NodeLeft {
        model: String,
        address: String,
        timestamp: i64,
    },
    NodeStatus {
        model: String,
        address: String,
        status: String,
        timestamp: i64,
    },
}

impl TopologyEvent {
    /// WebSocket event name
    pub fn name(&self) -> &'static str {
        match self {
            TopologyEvent::Topology { .. } => "pipeline:topology",
            TopologyEvent::NodeJoined { .. } => "pipeline:nodeJoined",
            TopologyEvent::NodeLeft { .. } => "pipeline:nodeLeft",
            TopologyEvent::NodeStatus { .. } => "pipeline:nodeStatus",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            TopologyEvent::Topology { model, .. }
            | TopologyEvent::NodeJoined { model, .. }
            | TopologyEvent::NodeLeft { model, .. }
            | TopologyEvent::NodeStatus { model, .. } => model,
        }
    }
}

/// Multi-subscriber broadcast channel of topology events
#[derive(Clone)]
pub struct TopologyBus {
    tx: broadcast::Sender<TopologyEvent>,
}

impl TopologyBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.tx.subscribe()
    }

    /// Publish, ignoring the no-subscriber case
    pub fn publish(&self, event: TopologyEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for TopologyBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = TopologyBus::new();
        let mut rx = bus.subscribe();

        bus.publish(TopologyEvent::NodeJoined {
            model: "llama-3-8b".to_string(),
            address: "0xaa".to_string(),
            timestamp: 1,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "pipeline:nodeJoined");
        assert_eq!(event.model(), "llama-3-8b");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = TopologyBus::new();
        bus.publish(TopologyEvent::NodeLeft {
            model: "m".to_string(),
            address: "0xbb".to_string(),
            timestamp: 2,
        });
    }
}
