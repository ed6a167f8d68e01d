//! Test harness for execution controller integration tests.
//!
//! Runs a controller on an ephemeral port backed by an in-memory store and
//! an in-process cluster master, plus any number of in-process workers.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use slicer_lite::cluster_master::LocalClusterMaster;
use slicer_lite::config::{ControllerConfig, ExecutionConfig, WorkerConfig};
use slicer_lite::controller::{ControllerDeps, ExecutionController, ExecutionStatus};
use slicer_lite::error::Result;
use slicer_lite::slicer::Slicer;
use slicer_lite::store::{ExecutionRecord, ExecutionStore, MemoryStore};
use slicer_lite::worker::{SliceProcessor, Worker};

/// Controller configuration with short timeouts for faster tests
pub fn test_controller_config() -> ControllerConfig {
    ControllerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        action_timeout_ms: 2_000,
        network_latency_buffer_ms: 200,
        ping_interval_ms: 100,
        ping_timeout_ms: 1_000,
        worker_disconnect_timeout_ms: 3_000,
        slicer_timeout_ms: 10_000,
        shutdown_timeout_ms: 3_000,
        analytics_interval_ms: 100,
        dispatch_interval_ms: 10,
        dispatch_interval_cap: 10,
    }
}

pub fn test_worker_config(addr: &str, worker_id: &str) -> WorkerConfig {
    WorkerConfig {
        action_timeout_ms: 2_000,
        network_latency_buffer_ms: 200,
        ping_interval_ms: 100,
        ping_timeout_ms: 1_000,
        connect_timeout_ms: 5_000,
        reconnect_delay_min_ms: 20,
        reconnect_delay_max_ms: 50,
        ..WorkerConfig::new(addr, worker_id)
    }
}

/// Handle to a worker running in a background task
pub struct TestWorker {
    pub worker: Arc<Worker>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestWorker {
    pub async fn spawn(addr: &str, worker_id: &str, processor: Arc<dyn SliceProcessor>) -> Self {
        let config = test_worker_config(addr, worker_id);
        let worker = Arc::new(Worker::new(&config, processor).expect("valid worker config"));
        worker.start().await.expect("worker should connect");

        let cancel = CancellationToken::new();
        let task_worker = worker.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = task_worker.run(task_cancel).await;
            task_worker.shutdown().await?;
            result
        });

        Self {
            worker,
            cancel,
            handle,
        }
    }

    pub fn processed(&self) -> u64 {
        self.worker.processed()
    }

    pub fn failed(&self) -> u64 {
        self.worker.failed()
    }

    /// Wait for the worker to exit on its own (after execution:finished).
    pub async fn join(self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.handle).await, Ok(Ok(Ok(()))))
    }

    /// Stop the worker without waiting for the execution to finish.
    ///
    /// A worker stuck inside a slice is aborted.
    pub async fn stop(self) {
        self.cancel.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(Duration::from_secs(2), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
        let _ = self.worker.shutdown().await;
    }
}

/// A controller plus the collaborators tests inspect.
pub struct TestExecution {
    pub controller: ExecutionController,
    pub store: Arc<MemoryStore>,
    pub cluster_master: Arc<LocalClusterMaster>,
    pub workers: Vec<TestWorker>,
    run_handle: Option<JoinHandle<Result<()>>>,
}

impl TestExecution {
    /// Seed a pending execution record and build a controller for it.
    pub async fn new(execution: ExecutionConfig, slicer: Arc<dyn Slicer>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(execution, slicer, store).await
    }

    pub async fn with_store(
        execution: ExecutionConfig,
        slicer: Arc<dyn Slicer>,
        store: Arc<MemoryStore>,
    ) -> Self {
        if store.get(&execution.ex_id).await.is_err() {
            store
                .create(ExecutionRecord::new(
                    &execution.ex_id,
                    &execution.job_id,
                    ExecutionStatus::Pending,
                ))
                .await
                .unwrap();
        }

        Self::with_config(test_controller_config(), execution, slicer, store)
    }

    pub fn with_config(
        config: ControllerConfig,
        execution: ExecutionConfig,
        slicer: Arc<dyn Slicer>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let cluster_master = Arc::new(LocalClusterMaster::new());
        let controller = ExecutionController::new(
            config,
            execution,
            ControllerDeps {
                ex_store: store.clone(),
                state_store: store.clone(),
                cluster_master: cluster_master.clone(),
                slicer,
            },
        )
        .expect("valid controller config");

        Self {
            controller,
            store,
            cluster_master,
            workers: Vec::new(),
            run_handle: None,
        }
    }

    pub fn ex_id(&self) -> String {
        self.controller.ex_id().to_string()
    }

    pub fn addr(&self) -> String {
        self.controller
            .local_addr()
            .expect("controller should be listening")
            .to_string()
    }

    /// Initialize the controller and start running it in the background.
    pub async fn start(&mut self) {
        assert!(
            self.controller.initialize().await.unwrap(),
            "execution should pass verification"
        );
        let controller = self.controller.clone();
        self.run_handle = Some(tokio::spawn(async move { controller.run().await }));
    }

    pub async fn add_workers(&mut self, count: usize, processor: Arc<dyn SliceProcessor>) {
        let addr = self.addr();
        for _ in 0..count {
            let worker_id = format!("worker-{}", self.workers.len() + 1);
            let worker = TestWorker::spawn(&addr, &worker_id, processor.clone()).await;
            self.workers.push(worker);
        }
    }

    /// Wait for `run` to return. Returns false on timeout.
    pub async fn wait_for_run(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.run_handle.take() else {
            return true;
        };
        matches!(tokio::time::timeout(timeout, handle).await, Ok(Ok(Ok(()))))
    }

    pub async fn record(&self) -> ExecutionRecord {
        self.store.get(&self.ex_id()).await.unwrap()
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.controller.status().await.unwrap()
    }

    pub fn processed_by_workers(&self) -> u64 {
        self.workers.iter().map(|w| w.processed()).sum()
    }

    /// Wait for run to finish, then shut the controller down and reap workers.
    pub async fn finish(mut self, timeout: Duration) -> ExecutionRecord {
        assert!(
            self.wait_for_run(timeout).await,
            "execution should finish within {:?}",
            timeout
        );
        self.controller.shutdown().await.unwrap();
        for worker in self.workers.drain(..) {
            worker.stop().await;
        }
        self.record().await
    }
}

/// Poll `condition` until it holds or `timeout_duration` elapses.
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout_duration;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Assert a condition becomes true within the timeout
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
