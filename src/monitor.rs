//! Recovery monitor
//!
//! Polls a predicate at a fixed interval until it holds or a deadline passes.
//! A timeout is an ordinary `false`; only cancellation is an error, and it
//! interrupts both the poll and the sleep between polls.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

use crate::config::MonitorConfig;
use crate::error::HarnessError;

/// Sender side of a cancellation signal, held by the test runner
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cloneable cancellation signal observed by the harness
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a linked handle/signal pair
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> CancelSignal {
        let (_, rx) = watch::channel(false);
        CancelSignal { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle is gone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Bounded, cancellable poller
#[derive(Debug, Clone)]
pub struct RecoveryMonitor {
    poll_interval: Duration,
}

impl RecoveryMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        RecoveryMonitor {
            poll_interval: config.poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll `predicate` until it returns true (`Ok(true)`) or `deadline`
    /// elapses (`Ok(false)`).
    ///
    /// A predicate call still running at the deadline is abandoned. Returns
    /// `Err(HarnessError::Cancelled)` as soon as `cancel` fires.
    pub async fn wait_until<F, Fut>(
        &self,
        mut predicate: F,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<bool, HarnessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline_at = Instant::now() + deadline;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                outcome = timeout_at(deadline_at, predicate()) => outcome,
            };

            match outcome {
                Ok(true) => {
                    debug!(polls, "recovery predicate satisfied");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(_) => {
                    debug!(polls, "recovery predicate still running at deadline");
                    return Ok(false);
                }
            }

            let now = Instant::now();
            if now >= deadline_at {
                debug!(polls, "recovery deadline elapsed");
                return Ok(false);
            }

            let wake = (now + self.poll_interval).min(deadline_at);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                _ = sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn monitor(ms: u64) -> RecoveryMonitor {
        RecoveryMonitor::new(&MonitorConfig {
            poll_interval: Duration::from_millis(ms),
        })
    }

    #[tokio::test]
    async fn test_returns_true_when_predicate_eventually_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let ok = monitor(5)
            .wait_until(
                move || {
                    let counter = counter.clone();
                    async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
                },
                Duration::from_secs(5),
                &CancelSignal::never(),
            )
            .await
            .unwrap();

        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_returns_false_on_deadline() {
        let start = std::time::Instant::now();
        let ok = monitor(10)
            .wait_until(|| async { false }, Duration::from_millis(100), &CancelSignal::never())
            .await
            .unwrap();

        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_abandons_hung_predicate_at_deadline() {
        let ok = monitor(10)
            .wait_until(
                || std::future::pending::<bool>(),
                Duration::from_millis(50),
                &CancelSignal::never(),
            )
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let (handle, signal) = CancelSignal::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let start = std::time::Instant::now();
        let result = monitor(1000)
            .wait_until(|| async { false }, Duration::from_secs(30), &signal)
            .await;

        assert!(matches!(result, Err(HarnessError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let (handle, signal) = CancelSignal::channel();
        handle.cancel();

        let result = monitor(10)
            .wait_until(|| async { true }, Duration::from_secs(1), &signal)
            .await;
        assert!(matches!(result, Err(HarnessError::Cancelled)));
    }
}
