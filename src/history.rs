//! Operation history recorded by the workload
//!
//! Every client operation is recorded with its invocation time, its completion
//! time (absent when the operation never completed, e.g. it timed out) and its
//! result. The history is append-only while the workload runs and read-only
//! once handed to the checker.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Microsecond timestamp relative to run start
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp from microseconds
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Get the value in microseconds
    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// Logical client identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }
}

/// Operation type against a key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    Read,
    Write { value: String },
}

/// Result of an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OpResult {
    /// Read returned this value (None = key not found)
    ReadOk(Option<String>),
    /// Write acknowledged
    WriteOk,
    /// Operation failed or timed out; its effect on the cluster is unknown
    Error(String),
}

/// A recorded operation with its timing interval
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: u64,
    pub client_id: ClientId,
    pub key: String,
    pub kind: OpKind,
    /// When the operation was invoked
    pub invoke_ts: Timestamp,
    /// When the response arrived; `None` if it never did
    pub complete_ts: Option<Timestamp>,
    pub result: OpResult,
}

impl Operation {
    pub fn new(
        id: u64,
        client_id: ClientId,
        key: String,
        kind: OpKind,
        invoke_ts: Timestamp,
        complete_ts: Option<Timestamp>,
        result: OpResult,
    ) -> Self {
        Operation {
            id,
            client_id,
            key,
            kind,
            invoke_ts,
            complete_ts,
            result,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self.kind, OpKind::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, OpKind::Write { .. })
    }

    /// Whether the operation got an acknowledged result
    pub fn is_ok(&self) -> bool {
        self.complete_ts.is_some() && !matches!(self.result, OpResult::Error(_))
    }

    /// Whether the effect of this operation is unknown (errored or never completed)
    pub fn is_indeterminate(&self) -> bool {
        !self.is_ok()
    }

    /// Completion time, treating a missing completion as "never"
    pub fn complete_or_max(&self) -> u64 {
        self.complete_ts.map(|ts| ts.0).unwrap_or(u64::MAX)
    }
}

/// Collection of operations from a run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct History {
    ops: Vec<Operation>,
    /// Run start for relative timestamps
    #[serde(skip, default = "Instant::now")]
    start_time: Instant,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        History {
            ops: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Create an empty history whose clock started at `start_time`
    pub fn starting_at(start_time: Instant) -> Self {
        History {
            ops: Vec::new(),
            start_time,
        }
    }

    /// Build a history from already-recorded operations
    pub fn from_ops(ops: Vec<Operation>) -> Self {
        History {
            ops,
            start_time: Instant::now(),
        }
    }

    /// Current time relative to run start
    pub fn now(&self) -> Timestamp {
        Timestamp(self.start_time.elapsed().as_micros() as u64)
    }

    pub fn add(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations that got an acknowledged result
    pub fn successful_ops(&self) -> Vec<&Operation> {
        self.ops.iter().filter(|op| op.is_ok()).collect()
    }

    pub fn ops_for_key(&self, key: &str) -> Vec<&Operation> {
        self.ops.iter().filter(|op| op.key == key).collect()
    }

    /// Unique keys in a stable order
    pub fn unique_keys(&self) -> BTreeSet<&str> {
        self.ops.iter().map(|op| op.key.as_str()).collect()
    }

    /// Check the ordering invariant: completion never precedes invocation.
    ///
    /// Also rejects a success result without a completion time, which would
    /// mean an acknowledgement was fabricated.
    pub fn validate(&self) -> Result<(), String> {
        for op in &self.ops {
            match op.complete_ts {
                Some(complete) if complete < op.invoke_ts => {
                    return Err(format!(
                        "op {} completed at {} before its invocation at {}",
                        op.id, complete.0, op.invoke_ts.0
                    ));
                }
                None if !matches!(op.result, OpResult::Error(_)) => {
                    return Err(format!("op {} has a result but no completion time", op.id));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
