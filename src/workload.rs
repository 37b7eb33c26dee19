//! Workload driver
//!
//! Spawns concurrent logical clients that issue random reads and writes until
//! stopped. Every operation is recorded into one shared history with its
//! invocation and completion times. A failed operation is recorded as an
//! error; an operation that exceeds the request timeout is recorded without a
//! completion time. Nothing is ever recorded as a success unless the cluster
//! acknowledged it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cluster::ClusterClient;
use crate::config::WorkloadConfig;
use crate::error::{ClientError, InfrastructureError};
use crate::history::{ClientId, History, OpKind, OpResult, Operation, Timestamp};

/// Client wrapper that records every operation to the shared history
pub struct RecordingClient {
    client_id: ClientId,
    client: Arc<dyn ClusterClient>,
    history: Arc<Mutex<History>>,
    next_op_id: Arc<AtomicU64>,
    request_timeout: Duration,
    clock: Instant,
}

impl RecordingClient {
    pub fn new(
        client_id: ClientId,
        client: Arc<dyn ClusterClient>,
        history: Arc<Mutex<History>>,
        op_counter: Arc<AtomicU64>,
        request_timeout: Duration,
        clock: Instant,
    ) -> Self {
        RecordingClient {
            client_id,
            client,
            history,
            next_op_id: op_counter,
            request_timeout,
            clock,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::SeqCst)
    }

    fn now(&self) -> Timestamp {
        Timestamp(self.clock.elapsed().as_micros() as u64)
    }

    fn record(&self, op: Operation) {
        self.history.lock().add(op);
    }

    /// Completion time and result tag for a finished or timed-out call
    fn outcome<T>(&self, result: &Result<T, ClientError>, ok: impl FnOnce(&T) -> OpResult) -> (Option<Timestamp>, OpResult) {
        match result {
            Ok(value) => (Some(self.now()), ok(value)),
            Err(ClientError::Timeout) => (None, OpResult::Error(ClientError::Timeout.to_string())),
            Err(e) => (Some(self.now()), OpResult::Error(e.to_string())),
        }
    }

    /// Read a key, recording the operation
    pub async fn read(&self, key: &str) -> Result<Option<String>, ClientError> {
        let op_id = self.next_id();
        let invoke_ts = self.now();

        let result = match tokio::time::timeout(self.request_timeout, self.client.read(key)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        };

        let (complete_ts, op_result) = self.outcome(&result, |value| OpResult::ReadOk(value.clone()));
        self.record(Operation::new(
            op_id,
            self.client_id,
            key.to_string(),
            OpKind::Read,
            invoke_ts,
            complete_ts,
            op_result,
        ));

        result
    }

    /// Write a key, recording the operation
    pub async fn write(&self, key: &str, value: &str) -> Result<(), ClientError> {
        let op_id = self.next_id();
        let invoke_ts = self.now();

        let result = match tokio::time::timeout(self.request_timeout, self.client.write(key, value)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        };

        let (complete_ts, op_result) = self.outcome(&result, |_| OpResult::WriteOk);
        self.record(Operation::new(
            op_id,
            self.client_id,
            key.to_string(),
            OpKind::Write {
                value: value.to_string(),
            },
            invoke_ts,
            complete_ts,
            op_result,
        ));

        result
    }
}

/// Spawns the workload clients
pub struct WorkloadDriver {
    config: WorkloadConfig,
    client: Arc<dyn ClusterClient>,
}

impl WorkloadDriver {
    pub fn new(config: WorkloadConfig, client: Arc<dyn ClusterClient>) -> Self {
        WorkloadDriver { config, client }
    }

    /// Start all clients; history timestamps are relative to `clock`
    pub fn start(&self, clock: Instant) -> RunningWorkload {
        let history = Arc::new(Mutex::new(History::starting_at(clock)));
        let op_counter = Arc::new(AtomicU64::new(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let tasks = (0..self.config.client_count)
            .map(|i| {
                let client = RecordingClient::new(
                    ClientId::new(i as u64),
                    self.client.clone(),
                    history.clone(),
                    op_counter.clone(),
                    self.config.request_timeout,
                    clock,
                );
                let config = self.config.clone();
                let stop = stop_rx.clone();
                tokio::spawn(async move { run_client(client, config, stop).await })
            })
            .collect();

        info!(clients = self.config.client_count, keys = ?self.config.keys, "workload started");

        RunningWorkload {
            history,
            stop_tx,
            tasks,
        }
    }
}

/// Handle to a running workload
pub struct RunningWorkload {
    history: Arc<Mutex<History>>,
    stop_tx: watch::Sender<bool>,
    tasks: FuturesUnordered<JoinHandle<()>>,
}

impl RunningWorkload {
    /// Number of operations recorded so far
    pub fn ops_recorded(&self) -> usize {
        self.history.lock().len()
    }

    /// Signal all clients to stop, wait for in-flight operations, and return
    /// the merged history.
    ///
    /// Cancel-safe: a client leaves the set only once joined, so calling
    /// `stop` again after an interrupted call still collects the history.
    pub async fn stop(&mut self) -> Result<History, InfrastructureError> {
        let _ = self.stop_tx.send(true);

        while let Some(joined) = self.tasks.next().await {
            joined.map_err(|e| InfrastructureError::Workload(e.to_string()))?;
        }

        let history = std::mem::take(&mut *self.history.lock());
        info!(ops = history.len(), successful = history.successful_ops().len(), "workload stopped");
        Ok(history)
    }
}

/// Issue operations until the stop flag flips
async fn run_client(client: RecordingClient, config: WorkloadConfig, mut stop: watch::Receiver<bool>) {
    // StdRng is Send, unlike ThreadRng
    let mut rng = StdRng::from_os_rng();
    let mut value_counter = 0u64;
    let max_pause_ms = config.op_interval.as_millis() as u64;

    while !*stop.borrow() {
        let key = &config.keys[rng.random_range(0..config.keys.len())];

        if rng.random::<f64>() < config.write_ratio {
            // Unique per client so every read maps to exactly one write
            value_counter += 1;
            let value = format!("c{}-{}", client.client_id.0, value_counter);
            if let Err(e) = client.write(key, &value).await {
                debug!(client = client.client_id.0, key = %key, error = %e, "write failed");
            }
        } else if let Err(e) = client.read(key).await {
            debug!(client = client.client_id.0, key = %key, error = %e, "read failed");
        }

        let pause = Duration::from_millis(rng.random_range(0..=max_pause_ms));
        tokio::select! {
            _ = stop.changed() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimCluster;

    fn config() -> WorkloadConfig {
        WorkloadConfig::default()
            .with_clients(3)
            .with_keys(["a", "b"])
            .with_op_interval(Duration::from_millis(2))
            .with_request_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_op_id_generation_is_shared() {
        let history = Arc::new(Mutex::new(History::new()));
        let counter = Arc::new(AtomicU64::new(1));
        let sim: Arc<dyn ClusterClient> = Arc::new(SimCluster::new(3));

        let a = RecordingClient::new(ClientId(1), sim.clone(), history.clone(), counter.clone(), Duration::from_secs(1), Instant::now());
        let b = RecordingClient::new(ClientId(2), sim, history, counter.clone(), Duration::from_secs(1), Instant::now());

        assert_eq!(a.next_id(), 1);
        assert_eq!(b.next_id(), 2);
        assert_eq!(a.next_id(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_workload_records_ordered_history() {
        let sim = Arc::new(SimCluster::new(3));
        let driver = WorkloadDriver::new(config(), sim);

        let mut running = driver.start(Instant::now());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(running.ops_recorded() > 0);
        let history = running.stop().await.unwrap();

        assert!(!history.is_empty());
        assert!(history.validate().is_ok());
        assert_eq!(history.successful_ops().len(), history.len());
        for op in history.ops() {
            assert!(op.complete_ts.unwrap() >= op.invoke_ts);
            assert!(op.key == "a" || op.key == "b");
        }
    }

    #[tokio::test]
    async fn test_interrupted_stop_keeps_history() {
        let sim = Arc::new(SimCluster::new(3).with_op_latency(Duration::from_millis(150)));
        let driver = WorkloadDriver::new(config().with_request_timeout(Duration::from_secs(2)), sim);

        let mut running = driver.start(Instant::now());
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Clients are mid-request, so stopping cannot finish this quickly
        let interrupted = tokio::time::timeout(Duration::from_millis(10), running.stop()).await;
        assert!(interrupted.is_err());

        let history = running.stop().await.unwrap();
        assert!(history.len() >= 3);
        assert!(history.validate().is_ok());
    }

    #[tokio::test]
    async fn test_no_fabricated_success_during_isolation() {
        use crate::cluster::{ClusterHandle, NodeId};

        let sim = Arc::new(SimCluster::new(3).without_failover());
        sim.isolate(NodeId(1)).await.unwrap();

        let driver = WorkloadDriver::new(config(), sim.clone());
        let mut running = driver.start(Instant::now());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let history = running.stop().await.unwrap();

        assert!(!history.is_empty());
        assert!(history.successful_ops().is_empty());
        assert!(history
            .ops()
            .iter()
            .all(|op| matches!(op.result, OpResult::Error(_))));
    }

    #[tokio::test]
    async fn test_timed_out_operation_has_no_completion() {
        use crate::cluster::{ClusterHandle, NodeId};

        let sim = Arc::new(SimCluster::new(3).without_failover().with_hanging_requests());
        sim.isolate(NodeId(1)).await.unwrap();

        let history = Arc::new(Mutex::new(History::new()));
        let client = RecordingClient::new(
            ClientId(0),
            sim,
            history.clone(),
            Arc::new(AtomicU64::new(1)),
            Duration::from_millis(30),
            Instant::now(),
        );

        assert_eq!(client.write("a", "v").await, Err(ClientError::Timeout));
        let history = history.lock();
        let op = &history.ops()[0];
        assert!(op.complete_ts.is_none());
        assert!(op.is_indeterminate());
    }
}
