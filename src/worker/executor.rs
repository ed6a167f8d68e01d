use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::scheduler::{Slice, SliceAnalytics, SliceCompletion};

/// The processing pipeline a worker runs each slice through.
#[async_trait]
pub trait SliceProcessor: Send + Sync {
    /// Process one slice. An `Err` marks the slice as failed.
    async fn process(&self, slice: &Slice) -> std::result::Result<(), String>;
}

/// Accepts every slice, optionally after a fixed delay.
#[derive(Debug, Clone, Default)]
pub struct NoopProcessor {
    delay: Duration,
}

impl NoopProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl SliceProcessor for NoopProcessor {
    async fn process(&self, _slice: &Slice) -> std::result::Result<(), String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

type SlicePredicate = dyn Fn(&Slice) -> bool + Send + Sync;

/// Fails the slices matching a predicate and accepts the rest.
#[derive(Clone)]
pub struct FailOnProcessor {
    predicate: Arc<SlicePredicate>,
    delay: Duration,
}

impl FailOnProcessor {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Slice) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            delay: Duration::ZERO,
        }
    }

    /// Fail the slice with this slicer order.
    pub fn slicer_order(order: u64) -> Self {
        Self::new(move |slice| slice.slicer_order == order)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SliceProcessor for FailOnProcessor {
    async fn process(&self, slice: &Slice) -> std::result::Result<(), String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if (self.predicate)(slice) {
            return Err(format!("slice {} failed to process", slice.slice_id));
        }
        Ok(())
    }
}

/// Runs slices through a processor and builds the completion report.
#[derive(Clone)]
pub struct SliceExecutor {
    processor: Arc<dyn SliceProcessor>,
}

impl SliceExecutor {
    pub fn new(processor: Arc<dyn SliceProcessor>) -> Self {
        Self { processor }
    }

    pub async fn execute(&self, worker_id: &str, slice: Slice) -> SliceCompletion {
        tracing::debug!(worker_id, slice_id = %slice.slice_id, slicer_order = slice.slicer_order, "Executing slice");

        let started = Instant::now();
        let result = self.processor.process(&slice).await;
        let analytics = SliceAnalytics {
            time_ms: started.elapsed().as_millis() as u64,
        };

        let error = match result {
            Ok(()) => {
                tracing::debug!(
                    worker_id,
                    slice_id = %slice.slice_id,
                    time_ms = analytics.time_ms,
                    "Slice completed"
                );
                None
            }
            Err(e) => {
                tracing::error!(worker_id, slice_id = %slice.slice_id, error = %e, "Slice failed");
                Some(e)
            }
        };

        SliceCompletion {
            worker_id: worker_id.to_string(),
            slice,
            error,
            analytics: Some(analytics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slice(order: u64) -> Slice {
        Slice::new("ex-1", "job-1", 0, order, json!({ "offset": order }))
    }

    #[tokio::test]
    async fn noop_processor_completes_slices() {
        let executor = SliceExecutor::new(Arc::new(NoopProcessor::new()));
        let completion = executor.execute("w1", slice(0)).await;

        assert_eq!(completion.worker_id, "w1");
        assert!(!completion.is_failure());
        assert!(completion.analytics.is_some());
    }

    #[tokio::test]
    async fn fail_on_processor_fails_matching_slice() {
        let executor = SliceExecutor::new(Arc::new(FailOnProcessor::slicer_order(2)));

        let ok = executor.execute("w1", slice(1)).await;
        assert!(!ok.is_failure());

        let failed = executor.execute("w1", slice(2)).await;
        assert!(failed.is_failure());
        assert!(failed.error.unwrap().contains("failed to process"));
    }

    #[tokio::test]
    async fn delay_is_reported_in_analytics() {
        let executor = SliceExecutor::new(Arc::new(NoopProcessor::with_delay(
            Duration::from_millis(30),
        )));
        let completion = executor.execute("w1", slice(0)).await;
        assert!(completion.analytics.unwrap().time_ms >= 30);
    }
}
