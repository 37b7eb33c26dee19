//! Fault variants
//!
//! A fault knows how to pick its target, apply itself, undo itself, and what
//! "the cluster coped" and "the cluster recovered" mean for it. The
//! orchestrator only sees `dyn Fault`.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::cluster::{ClusterHandle, Node, NodeId, Reachability};
use crate::error::{ClusterError, InfrastructureError};
use crate::history::Timestamp;

/// A single failure scenario
#[async_trait]
pub trait Fault: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    /// Choose the node to fault. May record pre-fault cluster state.
    async fn select_target(&mut self, cluster: &dyn ClusterHandle) -> Result<Node, InfrastructureError>;

    async fn apply(&self, cluster: &dyn ClusterHandle, target: &Node) -> Result<(), ClusterError>;

    /// Reverse `apply`. Must succeed when the fault is already undone.
    async fn undo(&self, cluster: &dyn ClusterHandle, target: &Node) -> Result<(), ClusterError>;

    /// Whether the cluster is routing around the fault while it is applied
    async fn tolerated(&self, _cluster: &dyn ClusterHandle, _target: &Node) -> bool {
        true
    }

    /// Whether the cluster is fully recovered after `undo`
    async fn recovered(&self, cluster: &dyn ClusterHandle) -> bool;
}

/// Zero-argument constructor for a fault variant
pub type FaultFactory = Box<dyn FnOnce() -> Box<dyn Fault> + Send>;

/// Isolates the current leader from the network.
///
/// Recovered means a reachable leader exists and every node that was a member
/// before the fault is healthy again.
#[derive(Debug, Default)]
pub struct BaselineRecoverableFault {
    membership: Vec<NodeId>,
}

impl BaselineRecoverableFault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members recorded at target selection
    pub fn membership(&self) -> &[NodeId] {
        &self.membership
    }
}

#[async_trait]
impl Fault for BaselineRecoverableFault {
    fn name(&self) -> &'static str {
        "baseline_recoverable"
    }

    async fn select_target(&mut self, cluster: &dyn ClusterHandle) -> Result<Node, InfrastructureError> {
        let leader = cluster.current_leader().await?.ok_or(InfrastructureError::NoLeader)?;
        self.membership = cluster.list_nodes().await?.into_iter().map(|n| n.id).collect();
        Ok(leader)
    }

    async fn apply(&self, cluster: &dyn ClusterHandle, target: &Node) -> Result<(), ClusterError> {
        cluster.isolate(target.id).await
    }

    async fn undo(&self, cluster: &dyn ClusterHandle, target: &Node) -> Result<(), ClusterError> {
        cluster.restore(target.id).await
    }

    async fn tolerated(&self, cluster: &dyn ClusterHandle, target: &Node) -> bool {
        match cluster.current_leader().await {
            Ok(Some(leader)) if leader.id != target.id => cluster.is_healthy(leader.id).await,
            _ => false,
        }
    }

    async fn recovered(&self, cluster: &dyn ClusterHandle) -> bool {
        let leader = match cluster.current_leader().await {
            Ok(Some(leader)) => leader,
            _ => return false,
        };
        if leader.reachability != Reachability::Connected || !cluster.is_healthy(leader.id).await {
            return false;
        }

        let nodes = match cluster.list_nodes().await {
            Ok(nodes) => nodes,
            Err(_) => return false,
        };
        for member in &self.membership {
            if !nodes.iter().any(|n| n.id == *member) || !cluster.is_healthy(*member).await {
                return false;
            }
        }
        true
    }
}

/// What the harness did to the fault target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultAction {
    Select,
    Apply,
    Undo,
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultAction::Select => write!(f, "select"),
            FaultAction::Apply => write!(f, "apply"),
            FaultAction::Undo => write!(f, "undo"),
        }
    }
}

/// Timestamped record of a fault action
#[derive(Clone, Debug, Serialize)]
pub struct FaultEvent {
    pub at: Timestamp,
    pub fault: &'static str,
    pub target: NodeId,
    pub action: FaultAction,
    /// Failure message if the action failed
    pub error: Option<String>,
}

/// Lifecycle of a fault within a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultState {
    /// No target chosen or nothing applied yet
    Pending,
    /// Apply was attempted; the cluster may be faulted
    Applied,
    Undone,
}

/// A fault variant bound to one run: its target, state, and action log
pub struct FaultInstance {
    fault: Box<dyn Fault>,
    target: Option<Node>,
    state: FaultState,
    events: Vec<FaultEvent>,
    clock: Instant,
}

impl FaultInstance {
    /// Wrap a fault; event timestamps are relative to `clock`
    pub fn new(fault: Box<dyn Fault>, clock: Instant) -> Self {
        FaultInstance {
            fault,
            target: None,
            state: FaultState::Pending,
            events: Vec::new(),
            clock,
        }
    }

    pub fn name(&self) -> &'static str {
        self.fault.name()
    }

    pub fn target(&self) -> Option<&Node> {
        self.target.as_ref()
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    pub fn events(&self) -> &[FaultEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<FaultEvent> {
        self.events
    }

    /// Whether an undo is owed to the cluster
    pub fn needs_undo(&self) -> bool {
        self.state == FaultState::Applied
    }

    fn record(&mut self, target: NodeId, action: FaultAction, error: Option<String>) {
        self.events.push(FaultEvent {
            at: Timestamp(self.clock.elapsed().as_micros() as u64),
            fault: self.fault.name(),
            target,
            action,
            error,
        });
    }

    pub async fn select(&mut self, cluster: &dyn ClusterHandle) -> Result<Node, InfrastructureError> {
        let target = self.fault.select_target(cluster).await?;
        info!(fault = self.name(), target = %target.id, "selected fault target");
        self.record(target.id, FaultAction::Select, None);
        self.target = Some(target.clone());
        Ok(target)
    }

    /// Apply the fault to the selected target.
    ///
    /// The instance counts as applied before the call returns, so a failed or
    /// interrupted apply is still undone.
    pub async fn apply(&mut self, cluster: &dyn ClusterHandle) -> Result<(), InfrastructureError> {
        let Some(target) = self.target.clone() else {
            return Err(InfrastructureError::NoLeader);
        };

        self.state = FaultState::Applied;
        match self.fault.apply(cluster, &target).await {
            Ok(()) => {
                info!(fault = self.name(), target = %target.id, "fault applied");
                self.record(target.id, FaultAction::Apply, None);
                Ok(())
            }
            Err(e) => {
                warn!(fault = self.name(), target = %target.id, error = %e, "fault apply failed");
                self.record(target.id, FaultAction::Apply, Some(e.to_string()));
                Err(InfrastructureError::FaultApply {
                    node: target.id,
                    source: e,
                })
            }
        }
    }

    /// Undo the fault, retrying up to `attempts` times with `backoff` between tries.
    ///
    /// A no-op when nothing was applied.
    pub async fn undo(
        &mut self,
        cluster: &dyn ClusterHandle,
        attempts: u32,
        backoff: Duration,
    ) -> Result<(), InfrastructureError> {
        let Some(target) = self.target.clone() else {
            return Ok(());
        };
        if self.state == FaultState::Pending {
            return Ok(());
        }

        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fault.undo(cluster, &target).await {
                Ok(()) => {
                    info!(fault = self.name(), target = %target.id, attempt, "fault undone");
                    self.record(target.id, FaultAction::Undo, None);
                    self.state = FaultState::Undone;
                    return Ok(());
                }
                Err(e) => {
                    warn!(fault = self.name(), target = %target.id, attempt, error = %e, "fault undo failed");
                    self.record(target.id, FaultAction::Undo, Some(e.to_string()));
                    if attempt >= attempts {
                        return Err(InfrastructureError::FaultUndo {
                            node: target.id,
                            attempts,
                            source: e,
                        });
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    pub async fn tolerated(&self, cluster: &dyn ClusterHandle) -> bool {
        match &self.target {
            Some(target) => self.fault.tolerated(cluster, target).await,
            None => false,
        }
    }

    pub async fn recovered(&self, cluster: &dyn ClusterHandle) -> bool {
        self.fault.recovered(cluster).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Role;
    use crate::testing::SimCluster;

    #[tokio::test]
    async fn test_baseline_targets_leader_and_records_membership() {
        let cluster = SimCluster::new(3);
        let mut fault = BaselineRecoverableFault::new();

        let target = fault.select_target(&cluster).await.unwrap();
        assert_eq!(target.id, NodeId(1));
        assert_eq!(target.role, Role::Leader);
        assert_eq!(fault.membership(), &[NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[tokio::test]
    async fn test_baseline_apply_isolates_and_undo_restores() {
        let cluster = SimCluster::new(3);
        let mut instance = FaultInstance::new(Box::new(BaselineRecoverableFault::new()), Instant::now());

        let target = instance.select(&cluster).await.unwrap();
        instance.apply(&cluster).await.unwrap();
        assert!(instance.needs_undo());
        assert!(!cluster.is_healthy(target.id).await);

        instance.undo(&cluster, 3, Duration::ZERO).await.unwrap();
        assert_eq!(instance.state(), FaultState::Undone);
        assert!(cluster.is_healthy(target.id).await);

        let actions: Vec<_> = instance.events().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![FaultAction::Select, FaultAction::Apply, FaultAction::Undo]);
    }

    #[tokio::test]
    async fn test_tolerated_requires_new_leader() {
        let cluster = SimCluster::new(3).with_election_delay(Duration::from_millis(30));
        let mut instance = FaultInstance::new(Box::new(BaselineRecoverableFault::new()), Instant::now());

        instance.select(&cluster).await.unwrap();
        instance.apply(&cluster).await.unwrap();
        assert!(!instance.tolerated(&cluster).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(instance.tolerated(&cluster).await);
        assert!(!instance.recovered(&cluster).await);

        instance.undo(&cluster, 1, Duration::ZERO).await.unwrap();
        assert!(instance.recovered(&cluster).await);
    }

    #[tokio::test]
    async fn test_undo_retries_then_succeeds() {
        let cluster = SimCluster::new(3);
        let mut instance = FaultInstance::new(Box::new(BaselineRecoverableFault::new()), Instant::now());

        instance.select(&cluster).await.unwrap();
        instance.apply(&cluster).await.unwrap();
        cluster.fail_next_restores(2);

        instance.undo(&cluster, 3, Duration::from_millis(1)).await.unwrap();
        let failed_undos = instance
            .events()
            .iter()
            .filter(|e| e.action == FaultAction::Undo && e.error.is_some())
            .count();
        assert_eq!(failed_undos, 2);
        assert_eq!(instance.state(), FaultState::Undone);
    }

    #[tokio::test]
    async fn test_undo_gives_up_after_bounded_attempts() {
        let cluster = SimCluster::new(3);
        let mut instance = FaultInstance::new(Box::new(BaselineRecoverableFault::new()), Instant::now());

        instance.select(&cluster).await.unwrap();
        instance.apply(&cluster).await.unwrap();
        cluster.fail_next_restores(10);

        let err = instance.undo(&cluster, 3, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, InfrastructureError::FaultUndo { attempts: 3, .. }));
        assert!(instance.needs_undo());
    }

    #[tokio::test]
    async fn test_undo_without_apply_is_noop() {
        let cluster = SimCluster::new(3);
        let mut instance = FaultInstance::new(Box::new(BaselineRecoverableFault::new()), Instant::now());
        instance.select(&cluster).await.unwrap();

        instance.undo(&cluster, 1, Duration::ZERO).await.unwrap();
        assert_eq!(instance.state(), FaultState::Pending);
        assert_eq!(instance.events().len(), 1);
    }
}
