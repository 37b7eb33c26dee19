//! Chaos testing harness for leader-based replicated clusters
//!
//! Runs a concurrent read/write workload against a cluster, isolates the
//! leader, waits for the cluster to route around the fault, heals it, waits
//! for full recovery, and then checks the recorded history for
//! linearizability using the Wing-Gong (WGL) search.

pub mod checker;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fault;
pub mod history;
pub mod monitor;
pub mod orchestrator;
pub mod workload;

/// In-process simulated cluster for tests.
pub mod testing;

pub use checker::{HistoryChecker, LinearizabilityChecker, RegisterModel, Verdict, VerdictStatus};
pub use cluster::{ClusterClient, ClusterHandle, Node, NodeId, Reachability, Role};
pub use config::{HarnessConfig, MonitorConfig, WorkloadConfig};
pub use error::{ClientError, ClusterError, HarnessError, InfrastructureError, Result};
pub use fault::{BaselineRecoverableFault, Fault, FaultFactory};
pub use history::{ClientId, History, OpKind, OpResult, Operation, Timestamp};
pub use monitor::{CancelHandle, CancelSignal, RecoveryMonitor};
pub use orchestrator::{FailureKind, Orchestrator, RunOutcome, RunReport, RunState};
pub use workload::{RunningWorkload, WorkloadDriver};
