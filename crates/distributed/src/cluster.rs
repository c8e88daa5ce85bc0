//! Interfaces of the collaborators the coordinator runs against: cluster
//! membership, message transport and the in-process map executor.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tsq_common::{NodeId, PartitionId, Result, TopologyVersion};

use crate::messages::QueryMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Sharded by key hash across owning nodes.
    Partitioned,
    /// Fully copied onto every owning node.
    Replicated,
    /// Node-local; never part of distributed join checks.
    Local,
}

/// Snapshot of one cache's placement as observed by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopology {
    pub name: String,
    pub mode: CacheMode,
    pub partitions: u32,
    /// Nodes owning primary partitions; every owner for replicated caches.
    pub data_nodes: BTreeSet<NodeId>,
    /// Current owners of each partition, indexed by partition id.
    pub owners: Vec<Vec<NodeId>>,
    /// Partitions of this cache are migrating between nodes.
    pub rebalancing: bool,
}

impl CacheTopology {
    pub fn is_partitioned(&self) -> bool {
        self.mode == CacheMode::Partitioned
    }

    pub fn is_replicated(&self) -> bool {
        self.mode == CacheMode::Replicated
    }

    pub fn owners_of(&self, partition: PartitionId) -> &[NodeId] {
        self.owners
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes owning every partition. Falls back to `data_nodes` when no
    /// per-partition ownership is known.
    pub fn full_owners(&self) -> BTreeSet<NodeId> {
        let mut parts = self.owners.iter();
        let Some(first) = parts.next() else {
            return self.data_nodes.clone();
        };
        let mut nodes: BTreeSet<NodeId> = first.iter().cloned().collect();
        for owners in parts {
            nodes.retain(|n| owners.contains(n));
            if nodes.is_empty() {
                break;
            }
        }
        nodes
    }
}

/// Read side of cluster membership as seen by the local node.
#[async_trait]
pub trait ClusterView: Send + Sync {
    fn local_node(&self) -> NodeId;
    fn is_alive(&self, node: &NodeId) -> bool;
    /// Latest topology version whose partition exchange finished locally.
    fn ready_topology_version(&self) -> TopologyVersion;
    /// Resolve once the local node observed `version` (or a newer one).
    async fn await_topology_version(&self, version: TopologyVersion) -> Result<()>;
    /// The local node lost its connection to the cluster.
    fn client_disconnected(&self) -> bool;
    fn cache(&self, name: &str) -> Option<CacheTopology>;
}

/// Fire-and-forget delivery to remote participants.
///
/// `send` only enqueues. Replies arrive asynchronously through
/// [`crate::ReduceCoordinator::on_message`].
pub trait Transport: Send + Sync {
    fn send(&self, node: &NodeId, msg: QueryMessage) -> Result<()>;
}

/// Map-side executor of the local node, invoked in-process.
///
/// Implementations must not block the caller; replies go back through
/// [`crate::ReduceCoordinator::on_message`] with the local node id.
pub trait LocalMapExecutor: Send + Sync {
    fn execute(&self, msg: QueryMessage);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined {
        node: NodeId,
        version: TopologyVersion,
    },
    NodeLeft {
        node: NodeId,
        version: TopologyVersion,
    },
    NodeFailed {
        node: NodeId,
        version: TopologyVersion,
    },
}

impl MembershipEvent {
    /// Node that left the topology, for leave and failure events.
    pub fn departed(&self) -> Option<&NodeId> {
        match self {
            MembershipEvent::NodeJoined { .. } => None,
            MembershipEvent::NodeLeft { node, .. } | MembershipEvent::NodeFailed { node, .. } => {
                Some(node)
            }
        }
    }

    pub fn version(&self) -> TopologyVersion {
        match self {
            MembershipEvent::NodeJoined { version, .. }
            | MembershipEvent::NodeLeft { version, .. }
            | MembershipEvent::NodeFailed { version, .. } => *version,
        }
    }
}
