//! Client for the cluster master that owns the execution's lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::controller::analytics::ExecutionStats;
use crate::controller::ControllerEvent;
use crate::error::{Result, SlicerError};
use crate::events::EventHub;

#[async_trait]
pub trait ClusterMasterClient: Send + Sync {
    /// Connect and start forwarding pause/resume/shutdown requests into `events`.
    async fn start(&self, events: EventHub<ControllerEvent>) -> Result<()>;

    /// Report that the controller is ready to accept workers.
    async fn send_available(&self) -> Result<()>;

    /// Report that the execution is over, with an error if it did not start.
    async fn send_execution_finished(&self, error: Option<String>) -> Result<()>;

    async fn send_execution_analytics(&self, stats: &ExecutionStats) -> Result<()>;

    fn is_ready(&self) -> bool;

    async fn shutdown(&self) -> Result<()>;
}

/// Cluster master living in the same process as the controller.
///
/// Records every report it receives and lets the embedding program request
/// pause, resume and shutdown.
#[derive(Default)]
pub struct LocalClusterMaster {
    events: Mutex<Option<EventHub<ControllerEvent>>>,
    ready: AtomicBool,
    available: AtomicBool,
    finished: Mutex<Vec<Option<String>>>,
    last_analytics: Mutex<Option<ExecutionStats>>,
    analytics_sent: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalClusterMaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: ControllerEvent) -> Result<()> {
        match lock(&self.events).as_ref() {
            Some(events) => {
                events.emit(event);
                Ok(())
            }
            None => Err(SlicerError::NotConnected("cluster_master".into())),
        }
    }

    pub fn pause_execution(&self) -> Result<()> {
        self.emit(ControllerEvent::ExecutionPause)
    }

    pub fn resume_execution(&self) -> Result<()> {
        self.emit(ControllerEvent::ExecutionResume)
    }

    /// The cluster master is going away; the execution should end.
    pub fn server_shutdown(&self) -> Result<()> {
        self.emit(ControllerEvent::ClusterMasterShutdown)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Every `send_execution_finished` report, oldest first.
    pub fn finished_reports(&self) -> Vec<Option<String>> {
        lock(&self.finished).clone()
    }

    pub fn last_analytics(&self) -> Option<ExecutionStats> {
        *lock(&self.last_analytics)
    }

    pub fn analytics_sent(&self) -> u64 {
        self.analytics_sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterMasterClient for LocalClusterMaster {
    async fn start(&self, events: EventHub<ControllerEvent>) -> Result<()> {
        *lock(&self.events) = Some(events);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_available(&self) -> Result<()> {
        self.available.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_execution_finished(&self, error: Option<String>) -> Result<()> {
        if let Some(ref error) = error {
            tracing::warn!(error = %error, "Execution finished with error");
        }
        lock(&self.finished).push(error);
        Ok(())
    }

    async fn send_execution_analytics(&self, stats: &ExecutionStats) -> Result<()> {
        *lock(&self.last_analytics) = Some(*stats);
        self.analytics_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        lock(&self.events).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_fail_before_start() {
        let master = LocalClusterMaster::new();
        assert!(matches!(
            master.pause_execution(),
            Err(SlicerError::NotConnected(_))
        ));
        assert!(!master.is_ready());
    }

    #[tokio::test]
    async fn test_requests_reach_controller_events() {
        let master = LocalClusterMaster::new();
        let events = EventHub::new();
        let mut received = events.subscribe();
        master.start(events).await.unwrap();
        assert!(master.is_ready());

        master.pause_execution().unwrap();
        master.server_shutdown().unwrap();
        assert!(matches!(received.recv().await, Some(ControllerEvent::ExecutionPause)));
        assert!(matches!(
            received.recv().await,
            Some(ControllerEvent::ClusterMasterShutdown)
        ));

        master.shutdown().await.unwrap();
        assert!(!master.is_ready());
        assert!(master.resume_execution().is_err());
    }

    #[tokio::test]
    async fn test_reports_are_recorded() {
        let master = LocalClusterMaster::new();
        master.send_available().await.unwrap();
        master
            .send_execution_finished(Some("slicer failed".into()))
            .await
            .unwrap();
        master
            .send_execution_analytics(&ExecutionStats::default())
            .await
            .unwrap();

        assert!(master.is_available());
        assert_eq!(master.finished_reports(), vec![Some("slicer failed".to_string())]);
        assert_eq!(master.analytics_sent(), 1);
    }
}
