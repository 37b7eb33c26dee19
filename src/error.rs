//! Error taxonomy for the harness
//!
//! Three kinds of failure are kept apart:
//! - infrastructure failures (cluster unreachable, fault apply/undo failed,
//!   recovery deadline exceeded) end the run;
//! - operation failures are recorded in the history as `ClientError` tags and
//!   never surface here;
//! - consistency violations are a checker verdict, not an error.

use std::time::Duration;

use thiserror::Error;

use crate::cluster::NodeId;

/// Errors from administrative calls against the live cluster
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to spawn control command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    #[error("http error: {0}")]
    Http(String),
}

/// Errors from a single client operation against the cluster
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("request timed out")]
    Timeout,

    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures that mean the harness, not the system under test, could not do its job
#[derive(Error, Debug)]
pub enum InfrastructureError {
    #[error("no leader found in cluster")]
    NoLeader,

    #[error("failed to apply fault to node {node}: {source}")]
    FaultApply {
        node: NodeId,
        #[source]
        source: ClusterError,
    },

    #[error("failed to undo fault on node {node} after {attempts} attempts: {source}")]
    FaultUndo {
        node: NodeId,
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    #[error("cluster did not recover {phase} within {waited:?}")]
    RecoveryTimeout { phase: &'static str, waited: Duration },

    #[error("cluster query failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("workload failed: {0}")]
    Workload(String),

    #[error("history violates ordering invariant: {0}")]
    InvalidHistory(String),

    #[error("cluster has {found} nodes, expected {expected}")]
    Membership { expected: usize, found: usize },

    #[error("invalid run transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("checker gave no answer: {0}")]
    Inconclusive(String),
}

/// Top-level harness error
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("infrastructure failure: {0}")]
    Infrastructure(#[from] InfrastructureError),

    #[error("run cancelled")]
    Cancelled,

    #[error("run deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ClusterError> for HarnessError {
    fn from(err: ClusterError) -> Self {
        HarnessError::Infrastructure(InfrastructureError::Cluster(err))
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
