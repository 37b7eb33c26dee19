//! Chaos orchestrator
//!
//! Drives one chaos run through an explicit state machine:
//!
//! ```text
//! Idle -> WorkloadRunning -> FaultApplied -> AwaitingRecovery -> FaultUndone
//!      -> AwaitingFullRecovery -> WorkloadStopped -> Checked -> Passed | Failed
//! ```
//!
//! Any error moves the run straight to `Failed`. Whatever the cause (including
//! cancellation and the run deadline), a fault that may have been applied is
//! undone before the run reports.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::checker::{HistoryChecker, LinearizabilityChecker, Verdict, VerdictStatus};
use crate::cluster::{ClusterClient, ClusterHandle};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, InfrastructureError};
use crate::fault::{Fault, FaultEvent, FaultInstance};
use crate::history::{History, Timestamp};
use crate::monitor::{CancelSignal, RecoveryMonitor};
use crate::workload::{RunningWorkload, WorkloadDriver};

/// Run state; no state is entered twice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    WorkloadRunning,
    FaultApplied,
    AwaitingRecovery,
    FaultUndone,
    AwaitingFullRecovery,
    WorkloadStopped,
    Checked,
    Passed,
    Failed,
}

/// What just happened in the run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunEvent {
    WorkloadStarted,
    FaultApplied,
    DwellElapsed,
    FaultUndone,
    RecoveryWaitStarted,
    WorkloadStopped,
    HistoryChecked,
    VerdictPass,
    VerdictFail,
    Abort,
}

impl RunState {
    /// Transition function. `None` means the event is not valid here.
    pub fn next(self, event: RunEvent) -> Option<RunState> {
        use RunEvent as E;
        use RunState as S;

        match (self, event) {
            (S::Passed | S::Failed, _) => None,
            (_, E::Abort) => Some(S::Failed),
            (S::Idle, E::WorkloadStarted) => Some(S::WorkloadRunning),
            (S::WorkloadRunning, E::FaultApplied) => Some(S::FaultApplied),
            (S::FaultApplied, E::DwellElapsed) => Some(S::AwaitingRecovery),
            (S::AwaitingRecovery, E::FaultUndone) => Some(S::FaultUndone),
            (S::FaultUndone, E::RecoveryWaitStarted) => Some(S::AwaitingFullRecovery),
            (S::AwaitingFullRecovery, E::WorkloadStopped) => Some(S::WorkloadStopped),
            (S::WorkloadStopped, E::HistoryChecked) => Some(S::Checked),
            (S::Checked, E::VerdictPass) => Some(S::Passed),
            (S::Checked, E::VerdictFail) => Some(S::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Passed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One recorded state change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: Timestamp,
}

/// Why a run failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The harness or the cluster could not complete the run
    Infrastructure,
    /// The history is not linearizable
    Consistency,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed { kind: FailureKind, message: String },
}

/// Everything a test runner needs to judge and diagnose a run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub history: History,
    pub verdict: Option<Verdict>,
    pub fault_events: Vec<FaultEvent>,
    pub transitions: Vec<Transition>,
    /// The error that aborted the run, if any
    #[serde(skip)]
    pub error: Option<HarnessError>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.outcome == RunOutcome::Passed
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            RunOutcome::Passed => None,
            RunOutcome::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn final_state(&self) -> RunState {
        self.transitions.last().map(|t| t.to).unwrap_or(RunState::Idle)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Mutable state of a single run
struct RunContext {
    clock: Instant,
    state: RunState,
    transitions: Vec<Transition>,
    fault: FaultInstance,
    workload: Option<RunningWorkload>,
    history: Option<History>,
    verdict: Option<Verdict>,
}

impl RunContext {
    fn new(fault: Box<dyn Fault>, clock: Instant) -> Self {
        RunContext {
            clock,
            state: RunState::Idle,
            transitions: Vec::new(),
            fault: FaultInstance::new(fault, clock),
            workload: None,
            history: None,
            verdict: None,
        }
    }

    fn advance(&mut self, event: RunEvent) -> Result<(), InfrastructureError> {
        let next = self
            .state
            .next(event)
            .ok_or_else(|| InfrastructureError::InvalidTransition {
                from: self.state.to_string(),
                event: event.to_string(),
            })?;

        info!(from = %self.state, to = %next, %event, "run state transition");
        self.transitions.push(Transition {
            from: self.state,
            to: next,
            at: Timestamp(self.clock.elapsed().as_micros() as u64),
        });
        self.state = next;
        Ok(())
    }
}

/// Runs a fault against a cluster under load and judges the result
pub struct Orchestrator {
    config: HarnessConfig,
    cluster: Arc<dyn ClusterHandle>,
    client: Arc<dyn ClusterClient>,
    monitor: RecoveryMonitor,
    checker: Box<dyn HistoryChecker>,
}

impl Orchestrator {
    pub fn new(
        config: HarnessConfig,
        cluster: Arc<dyn ClusterHandle>,
        client: Arc<dyn ClusterClient>,
    ) -> Result<Self, HarnessError> {
        config.validate()?;
        Ok(Orchestrator {
            monitor: RecoveryMonitor::new(&config.monitor),
            config,
            cluster,
            client,
            checker: Box::new(LinearizabilityChecker::register()),
        })
    }

    /// Replace the default register linearizability checker
    pub fn with_checker(mut self, checker: impl HistoryChecker + 'static) -> Self {
        self.checker = Box::new(checker);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Execute one chaos run with a freshly constructed fault.
    ///
    /// Never returns early with the cluster faulted: on error, cancellation
    /// or run deadline the fault is undone (bounded retries) and the workload
    /// stopped before the report is produced.
    pub async fn run<F>(&self, fault_factory: F, cancel: &CancelSignal) -> RunReport
    where
        F: FnOnce() -> Box<dyn Fault>,
    {
        let mut ctx = RunContext::new(fault_factory(), Instant::now());
        info!(
            fault = ctx.fault.name(),
            nodes = self.config.node_count,
            timeout = ?self.config.run_timeout,
            "chaos run starting"
        );

        let deadline = tokio::time::Instant::now() + self.config.run_timeout;
        let driven = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarnessError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(HarnessError::DeadlineExceeded),
            driven = self.drive(&mut ctx, cancel) => driven,
        };

        let (outcome, error) = match driven {
            Ok(outcome) => (outcome, None),
            Err(err) => {
                let message = self.abort(&mut ctx, &err).await;
                (
                    RunOutcome::Failed {
                        kind: FailureKind::Infrastructure,
                        message,
                    },
                    Some(err),
                )
            }
        };

        match &outcome {
            RunOutcome::Passed => info!(ops = ctx.history.as_ref().map_or(0, History::len), "chaos run passed"),
            RunOutcome::Failed { kind, message } => error!(?kind, %message, "chaos run failed"),
        }

        let RunContext {
            transitions,
            fault,
            history,
            verdict,
            ..
        } = ctx;

        RunReport {
            outcome,
            history: history.unwrap_or_default(),
            verdict,
            fault_events: fault.into_events(),
            transitions,
            error,
        }
    }

    /// The happy path, one step per transition
    async fn drive(&self, ctx: &mut RunContext, cancel: &CancelSignal) -> Result<RunOutcome, HarnessError> {
        let cluster = self.cluster.as_ref();

        let found = cluster.list_nodes().await?.len();
        if found != self.config.node_count {
            return Err(InfrastructureError::Membership {
                expected: self.config.node_count,
                found,
            }
            .into());
        }

        let driver = WorkloadDriver::new(self.config.workload.clone(), self.client.clone());
        ctx.workload = Some(driver.start(ctx.clock));
        ctx.advance(RunEvent::WorkloadStarted)?;
        tokio::time::sleep(self.config.warmup).await;

        ctx.fault.select(cluster).await?;
        ctx.fault.apply(cluster).await?;
        ctx.advance(RunEvent::FaultApplied)?;

        tokio::time::sleep(self.config.fault_dwell).await;
        ctx.advance(RunEvent::DwellElapsed)?;

        let fault = &ctx.fault;
        let tolerated = self
            .monitor
            .wait_until(move || fault.tolerated(cluster), self.config.fault_tolerance_deadline, cancel)
            .await?;
        if !tolerated {
            return Err(InfrastructureError::RecoveryTimeout {
                phase: "while faulted",
                waited: self.config.fault_tolerance_deadline,
            }
            .into());
        }
        info!(fault = fault.name(), "cluster tolerated fault");

        ctx.fault
            .undo(cluster, self.config.undo_attempts, self.config.undo_retry_backoff)
            .await?;
        ctx.advance(RunEvent::FaultUndone)?;

        ctx.advance(RunEvent::RecoveryWaitStarted)?;
        let fault = &ctx.fault;
        let recovered = self
            .monitor
            .wait_until(move || fault.recovered(cluster), self.config.recovery_deadline, cancel)
            .await?;
        if !recovered {
            return Err(InfrastructureError::RecoveryTimeout {
                phase: "after undo",
                waited: self.config.recovery_deadline,
            }
            .into());
        }
        info!(fault = fault.name(), "cluster fully recovered");
        tokio::time::sleep(self.config.cooldown).await;

        // Stays in the context until joined so an abort can still collect it
        let history = ctx
            .workload
            .as_mut()
            .ok_or_else(|| InfrastructureError::Workload("workload not running".into()))?
            .stop()
            .await?;
        ctx.workload = None;
        ctx.advance(RunEvent::WorkloadStopped)?;

        let checked = history.validate().map(|()| self.checker.check(&history));
        ctx.history = Some(history);
        let verdict = checked.map_err(InfrastructureError::InvalidHistory)?;
        ctx.advance(RunEvent::HistoryChecked)?;

        let outcome = match verdict.status {
            VerdictStatus::Pass => {
                ctx.advance(RunEvent::VerdictPass)?;
                RunOutcome::Passed
            }
            VerdictStatus::Fail => {
                ctx.advance(RunEvent::VerdictFail)?;
                RunOutcome::Failed {
                    kind: FailureKind::Consistency,
                    message: verdict
                        .reason
                        .clone()
                        .unwrap_or_else(|| "history is not linearizable".to_string()),
                }
            }
            VerdictStatus::Unknown => {
                let reason = verdict.reason.clone().unwrap_or_default();
                ctx.verdict = Some(verdict);
                return Err(InfrastructureError::Inconclusive(reason).into());
            }
        };
        ctx.verdict = Some(verdict);
        Ok(outcome)
    }

    /// Put the cluster back and collect what history there is
    async fn abort(&self, ctx: &mut RunContext, err: &HarnessError) -> String {
        let mut message = err.to_string();
        warn!(state = %ctx.state, error = %err, "aborting chaos run");

        let undo_exhausted = matches!(
            err,
            HarnessError::Infrastructure(InfrastructureError::FaultUndo { .. })
        );
        if ctx.fault.needs_undo() && !undo_exhausted {
            if let Err(undo_err) = ctx
                .fault
                .undo(
                    self.cluster.as_ref(),
                    self.config.undo_attempts,
                    self.config.undo_retry_backoff,
                )
                .await
            {
                error!(error = %undo_err, "fault left in place after abort");
                message = format!("{}; {}", message, undo_err);
            }
        }

        if let Some(mut workload) = ctx.workload.take() {
            match workload.stop().await {
                Ok(history) => ctx.history = Some(history),
                Err(e) => warn!(error = %e, "workload did not stop cleanly"),
            }
        }

        if let Err(e) = ctx.advance(RunEvent::Abort) {
            warn!(error = %e, "run already terminal");
        }
        message
    }
}
