//! Cluster handle abstraction
//!
//! `ClusterHandle` is the control plane (topology, leadership, network
//! isolation). `ClusterClient` is the data plane used by workload clients.
//! Both are object-safe so the orchestrator only sees `Arc<dyn _>`.

pub mod docker;
pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClusterError};

/// Node identifier (1-based, as the cluster numbers its members)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a node reports for itself
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Unknown,
}

impl Role {
    /// Parse the role string reported by a node's status endpoint
    pub fn from_status(state: &str) -> Self {
        match state {
            "Leader" => Role::Leader,
            "Follower" | "Candidate" => Role::Follower,
            _ => Role::Unknown,
        }
    }
}

/// Network reachability as controlled by the harness
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    Connected,
    Isolated,
}

/// A cluster member as seen by the harness
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Client API address ("host:port")
    pub addr: String,
    pub role: Role,
    pub reachability: Reachability,
}

/// Control-plane access to a running cluster.
///
/// `isolate` and `restore` are idempotent: isolating an isolated node or
/// restoring a connected one succeeds without changing anything. Failures to
/// reach a node are returned, never swallowed.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// All members with their last known role and reachability
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// The node currently acting as leader, if any reachable node claims it
    async fn current_leader(&self) -> Result<Option<Node>, ClusterError>;

    /// Cut a node off from the cluster network
    async fn isolate(&self, node: NodeId) -> Result<(), ClusterError>;

    /// Reconnect a node to the cluster network
    async fn restore(&self, node: NodeId) -> Result<(), ClusterError>;

    /// Whether the node is connected and answering its status endpoint
    async fn is_healthy(&self, node: NodeId) -> bool;
}

/// Data-plane access used by workload clients
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, ClientError>;

    async fn write(&self, key: &str, value: &str) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_status() {
        assert_eq!(Role::from_status("Leader"), Role::Leader);
        assert_eq!(Role::from_status("Follower"), Role::Follower);
        assert_eq!(Role::from_status("Candidate"), Role::Follower);
        assert_eq!(Role::from_status("garbage"), Role::Unknown);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(3).to_string(), "3");
    }
}
