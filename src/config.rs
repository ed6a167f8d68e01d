use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlicerError};

/// Whether an execution stops once its slicers are exhausted or keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Once,
    Persistent,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Once => write!(f, "once"),
            Lifecycle::Persistent => write!(f, "persistent"),
        }
    }
}

/// Which incomplete slices of a recovered execution get reprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryCleanupType {
    /// Only slices that ended in the `error` state
    Errors,
    /// Slices in either the `error` or the `start` state
    #[default]
    All,
}

/// How a `failing` execution proves it has healed.
///
/// A probation poll is "clean" when the failed count is unchanged and the
/// processed count went up since the previous poll. The execution returns to
/// `running` after `clean_windows` consecutive clean polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbationPolicy {
    pub clean_windows: u32,
}

impl Default for ProbationPolicy {
    fn default() -> Self {
        Self { clean_windows: 1 }
    }
}

/// Job description for one execution. Immutable once the controller starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub ex_id: String,
    pub job_id: String,
    pub name: String,
    pub lifecycle: Lifecycle,
    /// Number of workers requested for the execution. Also bounds dispatch concurrency.
    pub workers: usize,
    /// Number of parallel slicer functions to request from the slicer.
    pub slicers: usize,
    /// Opaque operation pipeline; the first entry configures the reader.
    pub operations: Vec<serde_json::Value>,
    pub probation_window_ms: u64,
    pub probation: ProbationPolicy,
    /// Attempts made to build the slicer functions before giving up.
    pub max_retries: u32,
    /// Execution id whose incomplete slices should be recovered.
    pub recovered_execution: Option<String>,
    pub recovered_slice_type: RecoveryCleanupType,
    pub analytics: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            ex_id: uuid::Uuid::new_v4().to_string(),
            job_id: uuid::Uuid::new_v4().to_string(),
            name: "slicer-lite-job".to_string(),
            lifecycle: Lifecycle::Once,
            workers: 1,
            slicers: 1,
            operations: Vec::new(),
            probation_window_ms: 300_000,
            probation: ProbationPolicy::default(),
            max_retries: 3,
            recovered_execution: None,
            recovered_slice_type: RecoveryCleanupType::All,
            analytics: true,
        }
    }
}

impl ExecutionConfig {
    pub fn new(ex_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            ex_id: ex_id.into(),
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    /// Load a job description from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_slicers(mut self, slicers: usize) -> Self {
        self.slicers = slicers;
        self
    }

    pub fn with_recovery(mut self, ex_id: impl Into<String>, cleanup: RecoveryCleanupType) -> Self {
        self.recovered_execution = Some(ex_id.into());
        self.recovered_slice_type = cleanup;
        self
    }

    pub fn is_recovery(&self) -> bool {
        self.recovered_execution.is_some()
    }

    pub fn probation_window(&self) -> Duration {
        Duration::from_millis(self.probation_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ex_id.trim().is_empty() {
            return Err(SlicerError::InvalidConfig("ex_id must not be empty".into()));
        }
        if self.job_id.trim().is_empty() {
            return Err(SlicerError::InvalidConfig("job_id must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(SlicerError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.slicers == 0 {
            return Err(SlicerError::InvalidConfig("slicers must be at least 1".into()));
        }
        if self.probation_window_ms == 0 {
            return Err(SlicerError::InvalidConfig(
                "probation_window_ms must be greater than 0".into(),
            ));
        }
        if self.probation.clean_windows == 0 {
            return Err(SlicerError::InvalidConfig(
                "probation.clean_windows must be at least 1".into(),
            ));
        }
        if let Some(ref recovered) = self.recovered_execution {
            if recovered.trim().is_empty() {
                return Err(SlicerError::InvalidConfig(
                    "recovered_execution must not be empty when set".into(),
                ));
            }
            if recovered == &self.ex_id {
                return Err(SlicerError::InvalidConfig(
                    "recovered_execution must differ from ex_id".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Controller-wide settings: where to listen and how long to wait for things.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    pub action_timeout_ms: u64,
    pub network_latency_buffer_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// How long every worker may stay offline before the execution fails.
    pub worker_disconnect_timeout_ms: u64,
    /// How long to wait for the first worker to connect.
    pub slicer_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub analytics_interval_ms: u64,
    pub dispatch_interval_ms: u64,
    /// Dispatches allowed to start per `dispatch_interval_ms`.
    pub dispatch_interval_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 45680)),
            action_timeout_ms: 30_000,
            network_latency_buffer_ms: 1_000,
            ping_interval_ms: 5_000,
            ping_timeout_ms: 10_000,
            worker_disconnect_timeout_ms: 300_000,
            slicer_timeout_ms: 180_000,
            shutdown_timeout_ms: 60_000,
            analytics_interval_ms: 10_000,
            dispatch_interval_ms: 100,
            dispatch_interval_cap: 10,
        }
    }
}

impl ControllerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn worker_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_disconnect_timeout_ms)
    }

    pub fn slicer_timeout(&self) -> Duration {
        Duration::from_millis(self.slicer_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("action_timeout_ms", self.action_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("worker_disconnect_timeout_ms", self.worker_disconnect_timeout_ms),
            ("slicer_timeout_ms", self.slicer_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("analytics_interval_ms", self.analytics_interval_ms),
            ("dispatch_interval_ms", self.dispatch_interval_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(SlicerError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        if self.dispatch_interval_cap == 0 {
            return Err(SlicerError::InvalidConfig(
                "dispatch_interval_cap must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for a worker process connecting to an execution controller.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Controller address in host:port format
    pub controller_addr: String,
    pub worker_id: String,
    pub action_timeout_ms: u64,
    pub network_latency_buffer_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_min_ms: u64,
    pub reconnect_delay_max_ms: u64,
    /// Attempts made to report a completed slice across reconnects.
    pub slice_complete_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            controller_addr: "127.0.0.1:45680".to_string(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            action_timeout_ms: 30_000,
            network_latency_buffer_ms: 1_000,
            ping_interval_ms: 5_000,
            ping_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            reconnect_delay_min_ms: 100,
            reconnect_delay_max_ms: 500,
            slice_complete_retries: 5,
        }
    }
}

impl WorkerConfig {
    pub fn new(controller_addr: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            controller_addr: controller_addr.into(),
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_addr.trim().is_empty() {
            return Err(SlicerError::InvalidConfig(
                "WorkerMessenger requires a valid controller_addr".into(),
            ));
        }
        if self.worker_id.trim().is_empty() {
            return Err(SlicerError::InvalidConfig(
                "WorkerMessenger requires a valid worker_id".into(),
            ));
        }
        if self.action_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(SlicerError::InvalidConfig(
                "worker timeouts must be greater than 0".into(),
            ));
        }
        if self.reconnect_delay_min_ms > self.reconnect_delay_max_ms {
            return Err(SlicerError::InvalidConfig(
                "reconnect_delay_min_ms must not exceed reconnect_delay_max_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_config_default_is_valid() {
        let cfg = ExecutionConfig::default();
        assert_eq!(cfg.lifecycle, Lifecycle::Once);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.slicers, 1);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.recovered_slice_type, RecoveryCleanupType::All);
        assert!(!cfg.is_recovery());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn execution_config_rejects_zero_workers() {
        let cfg = ExecutionConfig::new("ex-1", "job-1").with_workers(0);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, SlicerError::InvalidConfig(_)));
    }

    #[test]
    fn execution_config_rejects_empty_ids() {
        assert!(ExecutionConfig::new("", "job-1").validate().is_err());
        assert!(ExecutionConfig::new("ex-1", " ").validate().is_err());
    }

    #[test]
    fn execution_config_rejects_recovering_itself() {
        let cfg = ExecutionConfig::new("ex-1", "job-1").with_recovery("ex-1", RecoveryCleanupType::All);
        assert!(cfg.validate().is_err());

        let cfg = ExecutionConfig::new("ex-2", "job-1").with_recovery("ex-1", RecoveryCleanupType::Errors);
        assert!(cfg.validate().is_ok());
        assert!(cfg.is_recovery());
    }

    #[test]
    fn execution_config_deserializes_with_defaults() {
        let raw = r#"{
            "ex_id": "ex-9",
            "job_id": "job-9",
            "lifecycle": "persistent",
            "workers": 4,
            "recovered_slice_type": "errors"
        }"#;
        let cfg: ExecutionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.ex_id, "ex-9");
        assert_eq!(cfg.lifecycle, Lifecycle::Persistent);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.slicers, 1);
        assert_eq!(cfg.recovered_slice_type, RecoveryCleanupType::Errors);
        assert_eq!(cfg.probation.clean_windows, 1);
    }

    #[test]
    fn execution_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{"ex_id":"ex-f","job_id":"job-f","slicers":2}"#).unwrap();

        let cfg = ExecutionConfig::from_file(&path).unwrap();
        assert_eq!(cfg.ex_id, "ex-f");
        assert_eq!(cfg.slicers, 2);
    }

    #[test]
    fn controller_config_default() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:45680");
        assert_eq!(cfg.dispatch_interval_ms, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn controller_config_rejects_zero_timeouts() {
        let cfg = ControllerConfig {
            worker_disconnect_timeout_ms: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("worker_disconnect_timeout_ms"));
    }

    #[test]
    fn worker_config_requires_ids() {
        let cfg = WorkerConfig::new("127.0.0.1:1", "");
        assert!(cfg.validate().is_err());

        let cfg = WorkerConfig::new("", "w1");
        assert!(cfg.validate().is_err());

        let cfg = WorkerConfig::new("127.0.0.1:1", "w1");
        assert!(cfg.validate().is_ok());
    }
}
