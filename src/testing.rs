//! Testing utilities for chaos runs without containers
//!
//! Provides `SimCluster`, an in-process stand-in for a replicated key-value
//! cluster. It implements both `ClusterHandle` and `ClusterClient`, elects a
//! new leader after a configurable delay when the leader is isolated, and can
//! be told to misbehave (never fail over, serve stale reads after rejoin, hang
//! requests, fail isolate/restore calls) so harness failure paths can be
//! exercised deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::cluster::{ClusterClient, ClusterHandle, Node, NodeId, Reachability, Role};
use crate::error::{ClientError, ClusterError};

/// A single simulated member
#[derive(Debug, Clone)]
struct SimNode {
    id: NodeId,
    connected: bool,
    /// What the node itself believes; a stale leader keeps this after isolation
    believes_leader: bool,
    /// Rejoined without catching up and still answering reads locally
    stale: bool,
    data: HashMap<String, String>,
}

#[derive(Debug)]
struct SimState {
    nodes: Vec<SimNode>,
    leader: Option<NodeId>,
    election_due: Option<Instant>,
    committed: HashMap<String, String>,
    election_delay: Duration,
    op_latency: Duration,
    failover: bool,
    stale_rejoin_reads: bool,
    hanging_requests: bool,
    failing_isolates: u32,
    failing_restores: u32,
}

impl SimState {
    fn node(&self, id: NodeId) -> Result<&SimNode, ClusterError> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or(ClusterError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SimNode, ClusterError> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(ClusterError::NodeNotFound(id))
    }

    fn has_quorum(&self) -> bool {
        let connected = self.nodes.iter().filter(|n| n.connected).count();
        connected * 2 > self.nodes.len()
    }

    /// Run a pending election once its delay has passed
    fn tick(&mut self) {
        if self.leader.is_some() || !self.failover || !self.has_quorum() {
            return;
        }
        let Some(due) = self.election_due else {
            return;
        };
        if Instant::now() < due {
            return;
        }

        let Some(winner) = self
            .nodes
            .iter()
            .filter(|n| n.connected && !n.stale)
            .map(|n| n.id)
            .min()
        else {
            return;
        };

        for node in self.nodes.iter_mut().filter(|n| n.connected && !n.stale) {
            node.believes_leader = node.id == winner;
        }
        self.leader = Some(winner);
        self.election_due = None;
        debug!(leader = %winner, "simulated election complete");
    }

    fn to_node(&self, node: &SimNode) -> Node {
        Node {
            id: node.id,
            addr: format!("sim-{}", node.id),
            role: if node.believes_leader {
                Role::Leader
            } else {
                Role::Follower
            },
            reachability: if node.connected {
                Reachability::Connected
            } else {
                Reachability::Isolated
            },
        }
    }
}

/// In-process simulated cluster
#[derive(Debug, Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Create a cluster of `count` nodes with node 1 as leader
    pub fn new(count: usize) -> Self {
        let nodes = (1..=count as u64)
            .map(|id| SimNode {
                id: NodeId(id),
                connected: true,
                believes_leader: id == 1,
                stale: false,
                data: HashMap::new(),
            })
            .collect();

        SimCluster {
            state: Arc::new(Mutex::new(SimState {
                nodes,
                leader: (count > 0).then_some(NodeId(1)),
                election_due: None,
                committed: HashMap::new(),
                election_delay: Duration::ZERO,
                op_latency: Duration::ZERO,
                failover: true,
                stale_rejoin_reads: false,
                hanging_requests: false,
                failing_isolates: 0,
                failing_restores: 0,
            })),
        }
    }

    /// Time between losing the leader and electing a new one
    pub fn with_election_delay(self, delay: Duration) -> Self {
        self.state.lock().election_delay = delay;
        self
    }

    /// Simulated latency added to every client request
    pub fn with_op_latency(self, latency: Duration) -> Self {
        self.state.lock().op_latency = latency;
        self
    }

    /// Never elect a replacement leader
    pub fn without_failover(self) -> Self {
        self.state.lock().failover = false;
        self
    }

    /// Restored nodes keep their pre-isolation data and answer reads from it
    pub fn with_stale_rejoin_reads(self) -> Self {
        self.state.lock().stale_rejoin_reads = true;
        self
    }

    /// Requests that cannot be served hang instead of failing fast
    pub fn with_hanging_requests(self) -> Self {
        self.state.lock().hanging_requests = true;
        self
    }

    /// Make the next `count` isolate calls fail
    pub fn fail_next_isolates(&self, count: u32) {
        self.state.lock().failing_isolates = count;
    }

    /// Make the next `count` restore calls fail
    pub fn fail_next_restores(&self, count: u32) {
        self.state.lock().failing_restores = count;
    }

    pub fn isolated_nodes(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .nodes
            .iter()
            .filter(|n| !n.connected)
            .map(|n| n.id)
            .collect()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        let mut state = self.state.lock();
        state.tick();
        state.leader
    }

    pub fn committed_value(&self, key: &str) -> Option<String> {
        self.state.lock().committed.get(key).cloned()
    }

    async fn latency(&self) {
        let latency = self.state.lock().op_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn unavailable<T>(&self, reason: &str) -> Result<T, ClientError> {
        let hanging = self.state.lock().hanging_requests;
        if hanging {
            std::future::pending::<()>().await;
        }
        Err(ClientError::Unavailable(reason.to_string()))
    }
}

#[async_trait]
impl ClusterHandle for SimCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let mut state = self.state.lock();
        state.tick();
        Ok(state.nodes.iter().map(|n| state.to_node(n)).collect())
    }

    async fn current_leader(&self) -> Result<Option<Node>, ClusterError> {
        let mut state = self.state.lock();
        state.tick();
        match state.leader {
            Some(id) => {
                let node = state.node(id)?;
                Ok(Some(state.to_node(node)))
            }
            None => Ok(None),
        }
    }

    async fn isolate(&self, id: NodeId) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.node(id)?;
        if state.failing_isolates > 0 {
            state.failing_isolates -= 1;
            return Err(ClusterError::Unreachable {
                node: id,
                reason: "injected isolate failure".into(),
            });
        }

        let node = state.node_mut(id)?;
        if !node.connected {
            return Ok(());
        }
        node.connected = false;

        if state.leader == Some(id) {
            let delay = state.election_delay;
            state.leader = None;
            state.election_due = Some(Instant::now() + delay);
        }
        debug!(node = %id, "simulated isolate");
        Ok(())
    }

    async fn restore(&self, id: NodeId) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.node(id)?;
        if state.failing_restores > 0 {
            state.failing_restores -= 1;
            return Err(ClusterError::Unreachable {
                node: id,
                reason: "injected restore failure".into(),
            });
        }

        let stale_rejoin = state.stale_rejoin_reads;
        let committed = state.committed.clone();
        let leader = state.leader;
        let node = state.node_mut(id)?;
        if node.connected {
            return Ok(());
        }
        node.connected = true;

        if stale_rejoin && leader.is_some() {
            node.stale = true;
        } else {
            node.data = committed;
            node.believes_leader = false;
        }
        if leader.is_none() && state.election_due.is_none() {
            let delay = state.election_delay;
            state.election_due = Some(Instant::now() + delay);
        }
        debug!(node = %id, stale_rejoin, "simulated restore");
        Ok(())
    }

    async fn is_healthy(&self, id: NodeId) -> bool {
        self.state.lock().node(id).map(|n| n.connected).unwrap_or(false)
    }
}

#[async_trait]
impl ClusterClient for SimCluster {
    async fn read(&self, key: &str) -> Result<Option<String>, ClientError> {
        self.latency().await;

        let served = {
            let mut state = self.state.lock();
            state.tick();
            if let Some(stale) = state.nodes.iter().find(|n| n.connected && n.stale) {
                Some(stale.data.get(key).cloned())
            } else if state.leader.is_some() && state.has_quorum() {
                Some(state.committed.get(key).cloned())
            } else {
                None
            }
        };

        match served {
            Some(value) => Ok(value),
            None => self.unavailable("no leader").await,
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.latency().await;

        let committed = {
            let mut state = self.state.lock();
            state.tick();
            if state.leader.is_some() && state.has_quorum() {
                state.committed.insert(key.to_string(), value.to_string());
                for node in state.nodes.iter_mut().filter(|n| n.connected && !n.stale) {
                    node.data.insert(key.to_string(), value.to_string());
                }
                true
            } else {
                false
            }
        };

        if committed {
            Ok(())
        } else {
            self.unavailable("no leader").await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_leader_and_replication() {
        let sim = SimCluster::new(3);
        assert_eq!(sim.leader_id(), Some(NodeId(1)));

        sim.write("k", "v1").await.unwrap();
        assert_eq!(sim.read("k").await.unwrap(), Some("v1".to_string()));
        assert_eq!(sim.read("missing").await.unwrap(), None);
        assert_eq!(sim.committed_value("k"), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_failover_after_election_delay() {
        let sim = SimCluster::new(3).with_election_delay(Duration::from_millis(30));
        sim.isolate(NodeId(1)).await.unwrap();

        assert_eq!(sim.leader_id(), None);
        assert!(matches!(sim.write("k", "v").await, Err(ClientError::Unavailable(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sim.leader_id(), Some(NodeId(2)));
        sim.write("k", "v").await.unwrap();

        // The isolated node still claims leadership
        let nodes = sim.list_nodes().await.unwrap();
        assert_eq!(nodes[0].role, Role::Leader);
        assert_eq!(nodes[0].reachability, Reachability::Isolated);
    }

    #[tokio::test]
    async fn test_no_election_without_quorum() {
        let sim = SimCluster::new(3);
        sim.isolate(NodeId(2)).await.unwrap();
        sim.isolate(NodeId(1)).await.unwrap();
        assert_eq!(sim.leader_id(), None);

        sim.restore(NodeId(2)).await.unwrap();
        assert_eq!(sim.leader_id(), Some(NodeId(2)));
    }

    #[tokio::test]
    async fn test_isolate_and_restore_are_idempotent() {
        let sim = SimCluster::new(3);
        sim.isolate(NodeId(3)).await.unwrap();
        sim.isolate(NodeId(3)).await.unwrap();
        assert_eq!(sim.isolated_nodes(), vec![NodeId(3)]);

        sim.restore(NodeId(3)).await.unwrap();
        sim.restore(NodeId(3)).await.unwrap();
        assert!(sim.isolated_nodes().is_empty());
        assert_eq!(sim.leader_id(), Some(NodeId(1)));
    }

    #[tokio::test]
    async fn test_unknown_node_is_an_error() {
        let sim = SimCluster::new(3);
        assert!(matches!(
            sim.isolate(NodeId(9)).await,
            Err(ClusterError::NodeNotFound(NodeId(9)))
        ));
        assert!(!sim.is_healthy(NodeId(9)).await);
    }

    #[tokio::test]
    async fn test_stale_rejoin_serves_old_value() {
        let sim = SimCluster::new(3).with_stale_rejoin_reads();
        sim.write("k", "old").await.unwrap();
        sim.isolate(NodeId(1)).await.unwrap();
        sim.write("k", "new").await.unwrap();
        sim.restore(NodeId(1)).await.unwrap();

        assert_eq!(sim.leader_id(), Some(NodeId(2)));
        assert_eq!(sim.read("k").await.unwrap(), Some("old".to_string()));
        assert_eq!(sim.committed_value("k"), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_injected_restore_failures() {
        let sim = SimCluster::new(3);
        sim.isolate(NodeId(1)).await.unwrap();
        sim.fail_next_restores(1);

        assert!(sim.restore(NodeId(1)).await.is_err());
        sim.restore(NodeId(1)).await.unwrap();
        assert!(sim.is_healthy(NodeId(1)).await);
    }
}
