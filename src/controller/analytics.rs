use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster_master::ClusterMasterClient;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::slicer::SlicerHooks;

/// Point-in-time execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStats {
    pub processed: u64,
    pub failed: u64,
    pub queued: u64,
    pub dispatched: u64,
    pub slicers: u64,
    pub workers_joined: u64,
    pub workers_disconnected: u64,
    pub workers_reconnected: u64,
    pub workers_available: u64,
    pub workers_active: u64,
    /// Seconds from start to finish, set once the execution ends
    pub job_duration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Processed,
    Failed,
    Queued,
    Dispatched,
    Slicers,
    WorkersJoined,
    WorkersDisconnected,
    WorkersReconnected,
    WorkersAvailable,
    WorkersActive,
    JobDuration,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    dispatched: AtomicU64,
    slicers: AtomicU64,
    workers_joined: AtomicU64,
    workers_disconnected: AtomicU64,
    workers_reconnected: AtomicU64,
    workers_available: AtomicU64,
    workers_active: AtomicU64,
    job_duration: AtomicU64,
}

impl Counters {
    fn slot(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::Processed => &self.processed,
            Metric::Failed => &self.failed,
            Metric::Queued => &self.queued,
            Metric::Dispatched => &self.dispatched,
            Metric::Slicers => &self.slicers,
            Metric::WorkersJoined => &self.workers_joined,
            Metric::WorkersDisconnected => &self.workers_disconnected,
            Metric::WorkersReconnected => &self.workers_reconnected,
            Metric::WorkersAvailable => &self.workers_available,
            Metric::WorkersActive => &self.workers_active,
            Metric::JobDuration => &self.job_duration,
        }
    }
}

/// Everything the periodic reporter needs.
pub struct AnalyticsReporter {
    pub cluster_master: Arc<dyn ClusterMasterClient>,
    pub hooks: SlicerHooks,
    pub scheduler: Scheduler,
    pub interval: Duration,
}

/// Execution-wide counters with an optional periodic push to the cluster master.
#[derive(Clone, Default)]
pub struct ExecutionAnalytics {
    counters: Arc<Counters>,
    stop: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    reporter: Arc<Mutex<Option<Arc<dyn ClusterMasterClient>>>>,
}

impl ExecutionAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, metric: Metric) {
        self.add(metric, 1);
    }

    pub fn add(&self, metric: Metric, value: u64) {
        self.counters.slot(metric).fetch_add(value, Ordering::SeqCst);
    }

    pub fn set(&self, metric: Metric, value: u64) {
        self.counters.slot(metric).store(value, Ordering::SeqCst);
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counters.slot(metric).load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            processed: self.get(Metric::Processed),
            failed: self.get(Metric::Failed),
            queued: self.get(Metric::Queued),
            dispatched: self.get(Metric::Dispatched),
            slicers: self.get(Metric::Slicers),
            workers_joined: self.get(Metric::WorkersJoined),
            workers_disconnected: self.get(Metric::WorkersDisconnected),
            workers_reconnected: self.get(Metric::WorkersReconnected),
            workers_available: self.get(Metric::WorkersAvailable),
            workers_active: self.get(Metric::WorkersActive),
            job_duration: self.get(Metric::JobDuration),
        }
    }

    /// Start pushing stats every `interval` until [`ExecutionAnalytics::shutdown`].
    pub fn start(&self, reporter: AnalyticsReporter) {
        *self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reporter.cluster_master.clone());

        let analytics = self.clone();
        let stop = self.stop.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + reporter.interval;
            let mut ticker = tokio::time::interval_at(start, reporter.interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        analytics.set(Metric::Queued, reporter.scheduler.queue_length() as u64);
                        let stats = analytics.snapshot();
                        reporter.hooks.execution_stats(&stats).await;
                        if let Err(e) = reporter.cluster_master.send_execution_analytics(&stats).await {
                            tracing::warn!(error = %e, "Failed to send execution analytics");
                        }
                    }
                }
            }
        });

        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    /// Stop the reporter and push a final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let reporter = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match reporter {
            Some(cluster_master) => {
                cluster_master
                    .send_execution_analytics(&self.snapshot())
                    .await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_master::LocalClusterMaster;

    #[test]
    fn test_counters_snapshot() {
        let analytics = ExecutionAnalytics::new();
        analytics.increment(Metric::Processed);
        analytics.increment(Metric::Processed);
        analytics.add(Metric::Failed, 3);
        analytics.set(Metric::WorkersAvailable, 4);
        analytics.set(Metric::WorkersAvailable, 2);

        let stats = analytics.snapshot();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.workers_available, 2);
        assert_eq!(stats.dispatched, 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let analytics = ExecutionAnalytics::new();
        let other = analytics.clone();
        other.increment(Metric::WorkersJoined);
        assert_eq!(analytics.get(Metric::WorkersJoined), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_reporter_is_ok() {
        let analytics = ExecutionAnalytics::new();
        assert!(analytics.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_pushes_final_snapshot() {
        let analytics = ExecutionAnalytics::new();
        let cluster_master = Arc::new(LocalClusterMaster::new());
        analytics.start(AnalyticsReporter {
            cluster_master: cluster_master.clone(),
            hooks: SlicerHooks::new(Arc::new(crate::slicer::ListSlicer::new(Vec::new()))),
            scheduler: Scheduler::new(
                "ex-1",
                "job-1",
                SlicerHooks::new(Arc::new(crate::slicer::ListSlicer::new(Vec::new()))),
                crate::events::EventHub::new(),
                10,
            ),
            interval: Duration::from_secs(60),
        });
        analytics.add(Metric::Processed, 7);

        analytics.shutdown().await.unwrap();
        assert_eq!(cluster_master.analytics_sent(), 1);
        assert_eq!(cluster_master.last_analytics().map(|s| s.processed), Some(7));
    }
}
