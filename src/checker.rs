//! Wing-Gong linearizability checker
//!
//! Checks a history key by key against a sequential `Model` (by default a
//! read/write register). Operations whose effect is unknown are handled as
//! follows:
//! - an errored or incomplete write may or may not have taken effect; it is
//!   optional in the search and its interval extends to the end of time;
//! - an errored or incomplete read constrains nothing and is dropped.
//!
//! A violation comes with a counterexample: either a direct stale-read witness
//! or a shrunk sub-history that is still not linearizable.

use std::collections::HashSet;
use std::hash::Hash;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::history::{History, OpKind, OpResult, Operation};

/// Visited-configuration budget for a full check
const DEFAULT_STATE_BUDGET: usize = 1_000_000;
/// Budget for each trial check while shrinking a counterexample
const SHRINK_STATE_BUDGET: usize = 50_000;
/// Above this many operations the greedy shrink pass is skipped
const SHRINK_LIMIT: usize = 64;

/// Sequential specification the history must be explainable by
pub trait Model {
    type State: Clone + Eq + Hash;

    fn init(&self) -> Self::State;

    /// Apply `op` to `state`. `None` if the op's observed result is impossible
    /// in `state`. Writes are applied regardless of their recorded result, since
    /// an indeterminate write is only placed when the search assumes it happened.
    fn step(&self, state: &Self::State, op: &Operation) -> Option<Self::State>;

    /// Cheap direct proof of a violation, checked before searching
    fn witness(&self, _ops: &[&Operation]) -> Option<(String, Vec<Operation>)> {
        None
    }

    /// Whether an indeterminate `op` could change what the rest of `ops`
    /// observed. Operations that cannot are left out of the search.
    fn observable(&self, _op: &Operation, _ops: &[&Operation]) -> bool {
        true
    }
}

/// Single-key register; `None` is the initial (absent) value
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterModel;

impl Model for RegisterModel {
    type State = Option<String>;

    fn init(&self) -> Self::State {
        None
    }

    fn step(&self, state: &Self::State, op: &Operation) -> Option<Self::State> {
        match (&op.kind, &op.result) {
            (OpKind::Write { value }, _) => Some(Some(value.clone())),
            (OpKind::Read, OpResult::ReadOk(read)) => (state == read).then(|| state.clone()),
            _ => None,
        }
    }

    /// A write nobody read can always be assumed not to have happened
    fn observable(&self, op: &Operation, ops: &[&Operation]) -> bool {
        observed_by_read(op, ops)
    }

    fn witness(&self, ops: &[&Operation]) -> Option<(String, Vec<Operation>)> {
        let written: HashSet<&str> = ops
            .iter()
            .filter_map(|op| match &op.kind {
                OpKind::Write { value } => Some(value.as_str()),
                OpKind::Read => None,
            })
            .collect();

        let reads = ops.iter().filter(|op| op.is_read() && op.is_ok());

        for read in reads.clone() {
            if let OpResult::ReadOk(Some(value)) = &read.result {
                if !written.contains(value.as_str()) {
                    return Some((
                        format!("read {} returned {:?}, which was never written", read.id, value),
                        vec![(*read).clone()],
                    ));
                }
            }
        }

        // A read of `v` is stale if some confirmed write of another value
        // completed before the read started, and every write of `v` completed
        // before that write started.
        for read in reads {
            let OpResult::ReadOk(observed) = &read.result else {
                continue;
            };
            let sources: Vec<&Operation> = ops
                .iter()
                .filter(|op| matches!(&op.kind, OpKind::Write { value } if Some(value) == observed.as_ref()))
                .copied()
                .collect();

            let overwrite = ops
                .iter()
                .filter(|w| w.is_write() && w.is_ok())
                .filter(|w| !matches!(&w.kind, OpKind::Write { value } if Some(value) == observed.as_ref()))
                .filter(|w| w.complete_or_max() < read.invoke_ts.0)
                // An unacknowledged source may still land at any later time
                .filter(|w| sources.iter().all(|s| s.is_ok() && s.complete_or_max() < w.invoke_ts.0))
                .max_by_key(|w| w.complete_or_max());

            if let Some(overwrite) = overwrite {
                let mut evidence: Vec<Operation> = sources.iter().map(|op| (*op).clone()).collect();
                evidence.push((*overwrite).clone());
                evidence.push((*read).clone());
                evidence.sort_by_key(|op| (op.invoke_ts, op.id));

                let new_value = match &overwrite.kind {
                    OpKind::Write { value } => value.as_str(),
                    OpKind::Read => "",
                };
                return Some((
                    format!(
                        "stale read: read {} invoked at {} returned {:?}, but write {} of {:?} completed at {}",
                        read.id,
                        read.invoke_ts.0,
                        observed,
                        overwrite.id,
                        new_value,
                        overwrite.complete_or_max()
                    ),
                    evidence,
                ));
            }
        }

        None
    }
}

/// Outcome of a check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    /// The search budget ran out before an answer was found
    Unknown,
}

/// Result of checking a history. Produced once per run.
#[derive(Clone, Debug, Serialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    /// Operation ids in a valid linearization order (pass only)
    pub linearization: Option<Vec<u64>>,
    /// Key whose history failed
    pub key: Option<String>,
    pub reason: Option<String>,
    /// Sub-history proving the violation (fail only)
    pub counterexample: Vec<Operation>,
}

impl Verdict {
    fn pass(order: Vec<u64>) -> Self {
        Verdict {
            status: VerdictStatus::Pass,
            linearization: Some(order),
            key: None,
            reason: None,
            counterexample: Vec::new(),
        }
    }

    fn fail(key: &str, reason: String, counterexample: Vec<Operation>) -> Self {
        Verdict {
            status: VerdictStatus::Fail,
            linearization: None,
            key: Some(key.to_string()),
            reason: Some(format!("key '{}': {}", key, reason)),
            counterexample,
        }
    }

    fn unknown(key: &str, explored: usize) -> Self {
        Verdict {
            status: VerdictStatus::Unknown,
            linearization: None,
            key: Some(key.to_string()),
            reason: Some(format!(
                "key '{}': search gave up after {} configurations",
                key, explored
            )),
            counterexample: Vec::new(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Pass
    }

    pub fn is_fail(&self) -> bool {
        self.status == VerdictStatus::Fail
    }
}

/// Check `history` against `model`
pub fn check<M: Model>(history: &History, model: M) -> Verdict {
    LinearizabilityChecker::new(model).check(history)
}

/// Anything that can judge a finished history
pub trait HistoryChecker: Send + Sync {
    fn check(&self, history: &History) -> Verdict;
}

impl<M: Model + Send + Sync> HistoryChecker for LinearizabilityChecker<M> {
    fn check(&self, history: &History) -> Verdict {
        LinearizabilityChecker::check(self, history)
    }
}

/// Outcome of searching one key
enum Search {
    Linearizable(Vec<u64>),
    Violation,
    GaveUp(usize),
}

/// Search input for one operation
struct Entry<'a> {
    op: &'a Operation,
    invoke: u64,
    /// `u64::MAX` for optional operations
    complete: u64,
    required: bool,
}

/// Fixed-size set of placed operation indices
#[derive(Clone, PartialEq, Eq, Hash)]
struct OpSet(Vec<u64>);

impl OpSet {
    fn new(len: usize) -> Self {
        OpSet(vec![0; len.div_ceil(64)])
    }

    fn contains(&self, i: usize) -> bool {
        self.0[i / 64] & (1 << (i % 64)) != 0
    }

    fn insert(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }

    fn remove(&mut self, i: usize) {
        self.0[i / 64] &= !(1 << (i % 64));
    }
}

/// One level of the depth-first search
struct Frame<S> {
    state: S,
    /// Latest invocation among placed operations; nothing can linearize earlier
    frontier: u64,
    candidates: Vec<usize>,
    next: usize,
    placed: Option<usize>,
}

/// WGL linearizability checker
pub struct LinearizabilityChecker<M: Model = RegisterModel> {
    model: M,
    state_budget: usize,
}

impl LinearizabilityChecker<RegisterModel> {
    /// Checker for read/write register histories
    pub fn register() -> Self {
        Self::new(RegisterModel)
    }
}

impl<M: Model> LinearizabilityChecker<M> {
    pub fn new(model: M) -> Self {
        LinearizabilityChecker {
            model,
            state_budget: DEFAULT_STATE_BUDGET,
        }
    }

    /// Limit the number of distinct configurations explored per key
    pub fn with_state_budget(mut self, budget: usize) -> Self {
        self.state_budget = budget.max(1);
        self
    }

    /// Check a multi-key history; each key is an independent object
    pub fn check(&self, history: &History) -> Verdict {
        let mut order = Vec::new();
        let mut gave_up = None;

        for key in history.unique_keys() {
            let ops = history.ops_for_key(key);

            if let Some((reason, evidence)) = self.model.witness(&ops) {
                warn!(key, %reason, "consistency violation");
                return Verdict::fail(key, reason, evidence);
            }

            match self.search(&ops, self.state_budget) {
                Search::Linearizable(lin) => {
                    debug!(key, ops = ops.len(), "key linearizable");
                    order.extend(lin);
                }
                Search::Violation => {
                    let counterexample = self.shrink(&ops);
                    warn!(key, evidence = counterexample.len(), "consistency violation");
                    return Verdict::fail(
                        key,
                        "no valid linearization: operations cannot be ordered to satisfy the model"
                            .to_string(),
                        counterexample,
                    );
                }
                Search::GaveUp(explored) => {
                    warn!(key, explored, "linearizability search gave up");
                    gave_up.get_or_insert((key, explored));
                }
            }
        }

        if let Some((key, explored)) = gave_up {
            return Verdict::unknown(key, explored);
        }

        info!(ops = history.len(), "history is linearizable");
        Verdict::pass(order)
    }

    /// Depth-first search for a linearization of one key's operations
    fn search(&self, ops: &[&Operation], budget: usize) -> Search {
        let entries: Vec<Entry> = ops
            .iter()
            // An unacknowledged read tells us nothing
            .filter(|op| !(op.is_read() && op.is_indeterminate()))
            .filter(|op| op.is_ok() || self.model.observable(op, ops))
            .map(|op| {
                let required = op.is_ok();
                Entry {
                    op,
                    invoke: op.invoke_ts.0,
                    complete: if required { op.complete_or_max() } else { u64::MAX },
                    required,
                }
            })
            .collect();

        let mut remaining = entries.iter().filter(|e| e.required).count();
        if remaining == 0 {
            return Search::Linearizable(Vec::new());
        }

        let mut placed = OpSet::new(entries.len());
        let mut visited: HashSet<(OpSet, M::State)> = HashSet::new();
        let mut stack = vec![Frame {
            state: self.model.init(),
            frontier: 0,
            candidates: candidates(&entries, &placed, 0),
            next: 0,
            placed: None,
        }];

        loop {
            let Some(frame) = stack.last_mut() else {
                return Search::Violation;
            };

            if frame.next >= frame.candidates.len() {
                // Exhausted: backtrack
                if let Some(i) = frame.placed {
                    placed.remove(i);
                    if entries[i].required {
                        remaining += 1;
                    }
                }
                stack.pop();
                continue;
            }

            let i = frame.candidates[frame.next];
            frame.next += 1;

            let Some(state) = self.model.step(&frame.state, entries[i].op) else {
                continue;
            };
            let frontier = frame.frontier.max(entries[i].invoke);

            placed.insert(i);
            if entries[i].required {
                remaining -= 1;
            }

            if remaining == 0 {
                let mut order: Vec<u64> = stack
                    .iter()
                    .filter_map(|f| f.placed)
                    .map(|j| entries[j].op.id)
                    .collect();
                order.push(entries[i].op.id);
                return Search::Linearizable(order);
            }

            if !visited.insert((placed.clone(), state.clone())) {
                placed.remove(i);
                if entries[i].required {
                    remaining += 1;
                }
                continue;
            }
            if visited.len() > budget {
                return Search::GaveUp(visited.len());
            }

            stack.push(Frame {
                state,
                frontier,
                candidates: candidates(&entries, &placed, frontier),
                next: 0,
                placed: Some(i),
            });
        }
    }

    fn fails(&self, ops: &[&Operation]) -> bool {
        self.model.witness(ops).is_some()
            || matches!(self.search(ops, SHRINK_STATE_BUDGET), Search::Violation)
    }

    /// Reduce a non-linearizable history to a small failing sub-history.
    ///
    /// First the shortest failing invocation-ordered prefix is located, then
    /// operations are removed one at a time while the rest still fails. A write
    /// is kept while a remaining read observed its value.
    fn shrink(&self, ops: &[&Operation]) -> Vec<Operation> {
        let mut sorted: Vec<&Operation> = ops.to_vec();
        sorted.sort_by_key(|op| (op.invoke_ts, op.id));

        // Invariant: prefix `lo` passes, prefix `hi` fails
        let (mut lo, mut hi) = (0, sorted.len());
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.fails(&with_sources(&sorted[..mid], &sorted)) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        let mut kept = with_sources(&sorted[..hi], &sorted);

        if kept.len() <= SHRINK_LIMIT {
            let mut idx = kept.len();
            while idx > 0 {
                idx -= 1;
                if observed_by_read(kept[idx], &kept) {
                    continue;
                }
                let trial: Vec<&Operation> = kept
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != idx)
                    .map(|(_, op)| *op)
                    .collect();
                if self.fails(&trial) {
                    kept = trial;
                }
            }
        }

        kept.into_iter().cloned().collect()
    }
}

/// Operations that may be linearized next
fn candidates(entries: &[Entry], placed: &OpSet, frontier: u64) -> Vec<usize> {
    // Something must linearize before the earliest pending required completion
    let min_complete = entries
        .iter()
        .enumerate()
        .filter(|(i, e)| e.required && !placed.contains(*i))
        .map(|(_, e)| e.complete)
        .min()
        .unwrap_or(u64::MAX);

    let mut found: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(i, e)| !placed.contains(*i) && e.invoke <= min_complete && e.complete >= frontier)
        .map(|(i, _)| i)
        .collect();

    // Earlier invocations first, writes before reads
    found.sort_by(|&a, &b| {
        entries[a]
            .invoke
            .cmp(&entries[b].invoke)
            .then_with(|| entries[b].op.is_write().cmp(&entries[a].op.is_write()))
    });
    found
}

/// `prefix` plus the writes in `all` whose values its reads observed
fn with_sources<'a>(prefix: &[&'a Operation], all: &[&'a Operation]) -> Vec<&'a Operation> {
    let mut ops: Vec<&'a Operation> = prefix.to_vec();
    for op in all {
        if !prefix.iter().any(|p| p.id == op.id) && observed_by_read(op, prefix) {
            ops.push(*op);
        }
    }
    ops.sort_by_key(|op| (op.invoke_ts, op.id));
    ops
}

/// Whether `op` is a write whose value some other op in `ops` read
fn observed_by_read(op: &Operation, ops: &[&Operation]) -> bool {
    let OpKind::Write { value } = &op.kind else {
        return false;
    };
    ops.iter().any(|other| {
        other.is_read() && matches!(&other.result, OpResult::ReadOk(Some(read)) if read == value)
    })
}
