//! Worker runtime: receives slices from an execution controller and runs them.
//!
//! # Execution Flow
//!
//! 1. [`Worker::start`] connects to the controller
//! 2. The worker announces it is ready and waits for a slice
//! 3. [`SliceExecutor::execute`] runs the slice through the [`SliceProcessor`]
//! 4. The completion (with timing) is reported back, then the loop repeats
//!
//! The loop ends when the controller sends `execution:finished` or the
//! caller's cancellation token fires.

pub mod executor;

pub use executor::{FailOnProcessor, NoopProcessor, SliceExecutor, SliceProcessor};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::messaging::WorkerMessenger;

pub struct Worker {
    messenger: WorkerMessenger,
    executor: SliceExecutor,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Worker {
    pub fn new(config: &WorkerConfig, processor: Arc<dyn SliceProcessor>) -> Result<Self> {
        Ok(Self {
            messenger: WorkerMessenger::new(config)?,
            executor: SliceExecutor::new(processor),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn worker_id(&self) -> &str {
        self.messenger.worker_id()
    }

    pub fn messenger(&self) -> &WorkerMessenger {
        &self.messenger
    }

    pub async fn start(&self) -> Result<()> {
        self.messenger.start().await?;
        tracing::info!(worker_id = %self.worker_id(), "Worker connected to execution controller");
        Ok(())
    }

    /// Process slices until the execution finishes or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let worker_id = self.worker_id().to_string();

        while let Some(slice) = self.messenger.wait_for_slice(&cancel).await {
            let completion = self.executor.execute(&worker_id, slice).await;
            if completion.is_failure() {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }

            match self.messenger.slice_complete(&completion).await {
                Ok(recorded) => {
                    tracing::debug!(worker_id = %worker_id, slice_id = %recorded.slice_id, "Slice completion recorded");
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %worker_id,
                        slice_id = %completion.slice.slice_id,
                        error = %e,
                        "Failed to report slice completion"
                    );
                }
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
        }

        tracing::info!(
            worker_id = %worker_id,
            processed = self.processed(),
            finished = self.messenger.is_finished(),
            "Worker stopped processing slices"
        );
        Ok(())
    }

    /// Slices this worker ran, including failed ones.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.messenger.shutdown().await
    }
}
