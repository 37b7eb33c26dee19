//! Harness configuration
//!
//! All run parameters travel in an explicit `HarnessConfig` handed to the
//! orchestrator. Configs can be built in code (`Default` + `with_*`) or parsed
//! from JSON, where durations are given in milliseconds and every field is
//! optional.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Workload generation parameters
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of concurrent logical clients
    pub client_count: usize,
    /// Keys the clients operate on (each an independent register)
    pub keys: Vec<String>,
    /// Ratio of writes (0.0 = all reads, 1.0 = all writes)
    pub write_ratio: f64,
    /// Upper bound of the random pause between a client's operations
    pub op_interval: Duration,
    /// Per-operation timeout; an operation exceeding it is recorded as incomplete
    pub request_timeout: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            client_count: 5,
            keys: vec!["k1".to_string()],
            write_ratio: 0.5,
            op_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl WorkloadConfig {
    pub fn with_clients(mut self, count: usize) -> Self {
        self.client_count = count;
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_write_ratio(mut self, ratio: f64) -> Self {
        self.write_ratio = ratio;
        self
    }

    pub fn with_op_interval(mut self, interval: Duration) -> Self {
        self.op_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Recovery monitor parameters
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Fixed interval between predicate polls
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Parameters for one chaos run
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Expected cluster size
    pub node_count: usize,
    /// Overall run deadline
    pub run_timeout: Duration,
    /// Workload time before the fault is applied
    pub warmup: Duration,
    /// Time the fault is held before checking the cluster tolerated it
    pub fault_dwell: Duration,
    /// Deadline for the cluster to route around the fault
    pub fault_tolerance_deadline: Duration,
    /// Deadline for full recovery after the fault is undone
    pub recovery_deadline: Duration,
    /// Workload time after full recovery, before the workload is stopped
    pub cooldown: Duration,
    /// Attempts at undoing a fault before giving up
    pub undo_attempts: u32,
    /// Pause between undo attempts
    pub undo_retry_backoff: Duration,
    pub monitor: MonitorConfig,
    pub workload: WorkloadConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            node_count: 3,
            run_timeout: Duration::from_secs(300),
            warmup: Duration::from_secs(1),
            fault_dwell: Duration::from_secs(5),
            fault_tolerance_deadline: Duration::from_secs(30),
            recovery_deadline: Duration::from_secs(30),
            cooldown: Duration::from_secs(1),
            undo_attempts: 3,
            undo_retry_backoff: Duration::from_secs(1),
            monitor: MonitorConfig::default(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_fault_dwell(mut self, dwell: Duration) -> Self {
        self.fault_dwell = dwell;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set both the under-fault and the post-undo recovery deadlines
    pub fn with_recovery_deadlines(mut self, tolerance: Duration, recovery: Duration) -> Self {
        self.fault_tolerance_deadline = tolerance;
        self.recovery_deadline = recovery;
        self
    }

    pub fn with_undo_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.undo_attempts = attempts;
        self.undo_retry_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.monitor.poll_interval = interval;
        self
    }

    pub fn with_workload(mut self, workload: WorkloadConfig) -> Self {
        self.workload = workload;
        self
    }

    /// Parse a JSON config; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count < 3 {
            return Err(ConfigError::Invalid(format!(
                "node_count must be at least 3 to survive leader isolation, got {}",
                self.node_count
            )));
        }
        if self.workload.client_count == 0 {
            return Err(ConfigError::Invalid("client_count must be positive".into()));
        }
        if self.workload.keys.is_empty() {
            return Err(ConfigError::Invalid("workload needs at least one key".into()));
        }
        if !(0.0..=1.0).contains(&self.workload.write_ratio) {
            return Err(ConfigError::Invalid(format!(
                "write_ratio must be within [0, 1], got {}",
                self.workload.write_ratio
            )));
        }
        if self.workload.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request_timeout must be positive".into()));
        }
        if self.undo_attempts == 0 {
            return Err(ConfigError::Invalid("undo_attempts must be positive".into()));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkload {
    client_count: Option<usize>,
    keys: Option<Vec<String>>,
    write_ratio: Option<f64>,
    op_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    node_count: Option<usize>,
    run_timeout_ms: Option<u64>,
    warmup_ms: Option<u64>,
    fault_dwell_ms: Option<u64>,
    fault_tolerance_deadline_ms: Option<u64>,
    recovery_deadline_ms: Option<u64>,
    cooldown_ms: Option<u64>,
    undo_attempts: Option<u32>,
    undo_retry_backoff_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    workload: RawWorkload,
}

impl RawConfig {
    fn into_config(self) -> HarnessConfig {
        let d = HarnessConfig::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        let w = self.workload;

        HarnessConfig {
            node_count: self.node_count.unwrap_or(d.node_count),
            run_timeout: ms(self.run_timeout_ms, d.run_timeout),
            warmup: ms(self.warmup_ms, d.warmup),
            fault_dwell: ms(self.fault_dwell_ms, d.fault_dwell),
            fault_tolerance_deadline: ms(self.fault_tolerance_deadline_ms, d.fault_tolerance_deadline),
            recovery_deadline: ms(self.recovery_deadline_ms, d.recovery_deadline),
            cooldown: ms(self.cooldown_ms, d.cooldown),
            undo_attempts: self.undo_attempts.unwrap_or(d.undo_attempts),
            undo_retry_backoff: ms(self.undo_retry_backoff_ms, d.undo_retry_backoff),
            monitor: MonitorConfig {
                poll_interval: ms(self.poll_interval_ms, d.monitor.poll_interval),
            },
            workload: WorkloadConfig {
                client_count: w.client_count.unwrap_or(d.workload.client_count),
                keys: w.keys.unwrap_or(d.workload.keys),
                write_ratio: w.write_ratio.unwrap_or(d.workload.write_ratio),
                op_interval: ms(w.op_interval_ms, d.workload.op_interval),
                request_timeout: ms(w.request_timeout_ms, d.workload.request_timeout),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HarnessConfig::default();
        assert_eq!(config.node_count, 3);
        assert_eq!(config.recovery_deadline, Duration::from_secs(30));
        assert_eq!(config.workload.client_count, 5);
        assert!((config.workload.write_ratio - 0.5).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = HarnessConfig::default()
            .with_node_count(5)
            .with_poll_interval(Duration::from_millis(20))
            .with_workload(WorkloadConfig::default().with_keys(["a", "b"]).with_clients(2));
        assert_eq!(config.node_count, 5);
        assert_eq!(config.monitor.poll_interval, Duration::from_millis(20));
        assert_eq!(config.workload.keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.workload.client_count, 2);
    }

    #[test]
    fn test_from_json_partial() {
        let config = HarnessConfig::from_json(
            r#"{"node_count": 5, "recovery_deadline_ms": 1500, "workload": {"keys": ["x", "y"]}}"#,
        )
        .unwrap();
        assert_eq!(config.node_count, 5);
        assert_eq!(config.recovery_deadline, Duration::from_millis(1500));
        assert_eq!(config.workload.keys.len(), 2);
        assert_eq!(config.fault_dwell, Duration::from_secs(5));
        assert_eq!(config.cooldown, Duration::from_secs(1));
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        assert!(matches!(
            HarnessConfig::from_json(r#"{"nodes": 3}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(HarnessConfig::default().with_node_count(2).validate().is_err());
        assert!(HarnessConfig::default()
            .with_workload(WorkloadConfig::default().with_write_ratio(1.5))
            .validate()
            .is_err());
        assert!(HarnessConfig::default()
            .with_undo_retries(0, Duration::ZERO)
            .validate()
            .is_err());
        assert!(HarnessConfig::from_json(r#"{"workload": {"keys": []}}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_request_timeout() {
        let config = HarnessConfig::default()
            .with_workload(WorkloadConfig::default().with_request_timeout(Duration::ZERO));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            HarnessConfig::from_json(r#"{"workload": {"request_timeout_ms": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
    }
}
