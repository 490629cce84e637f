//! Distributed-inference pipeline management.
//!
//! Partitions model layers across healthy nodes, groups memory-constrained
//! LAN peers into coordinator/worker clusters and exposes the resulting
//! topology to the request router over a broadcast bus.

pub mod allocator;
pub mod catalog;
pub mod cluster;
pub mod topology;

pub use allocator::{sort_for_split, split_layers, split_weight, Allocator, HEARTBEAT_TIMEOUT_SECS};
pub use catalog::ModelCatalog;
pub use cluster::{
    plan_cluster, subnet_24, ClusterCandidate, ClusterManager, PlannedMember,
    CLUSTER_MIN_AGE_SECS, NODE_OFFLINE_GRACE_SECS,
};
pub use topology::{TopologyBus, TopologyEvent, TopologyNode};
