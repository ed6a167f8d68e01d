//! The execution controller: owns one execution from start to final status.
//!
//! The controller wires the worker-facing server, the scheduler, the
//! dispatch queue and (optionally) recovery together, persists every status
//! transition, and runs the watchdogs that turn a stalled execution into a
//! terminal one.

pub mod analytics;
pub mod dispatch;
pub mod recovery;
pub mod status;
pub mod watchdog;

pub use analytics::{AnalyticsReporter, ExecutionAnalytics, ExecutionStats, Metric};
pub use dispatch::DispatchQueue;
pub use recovery::{ExecutionRecovery, RecoveryOutcome};
pub use status::ExecutionStatus;
pub use watchdog::Watchdog;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;

use crate::cluster_master::ClusterMasterClient;
use crate::config::{ControllerConfig, ExecutionConfig, Lifecycle};
use crate::error::{Result, SlicerError};
use crate::events::{EventHub, Listeners};
use crate::messaging::{ExecutionControllerServer, ServerEvent};
use crate::scheduler::{Scheduler, Slice, SliceCompletion, SliceState};
use crate::slicer::{QueueLength, Slicer, SlicerContext, SlicerHooks, StartingPoint};
use crate::store::{ExecutionStore, ExecutionUpdate, StateStore};

/// Poll period for the bounded waits of the run and shutdown paths.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long the dispatch loop sleeps while the execution is paused.
const PAUSED_DELAY: Duration = Duration::from_secs(1);
/// Longest wait for a worker to become available before re-checking.
const WORKER_WAIT: Duration = Duration::from_secs(1);
/// Delay between slicer initialization attempts.
const SLICER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Events published to the controller by the slicer and the cluster master.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Every slicer is done; carries the error if one of them failed
    SlicersFinished(Option<String>),
    /// New operation metadata to persist on the execution record
    ExecutionUpdate(Vec<Value>),
    ExecutionPause,
    ExecutionResume,
    ClusterMasterShutdown,
}

/// External collaborators of a controller.
pub struct ControllerDeps {
    pub ex_store: Arc<dyn ExecutionStore>,
    pub state_store: Arc<dyn StateStore>,
    pub cluster_master: Arc<dyn ClusterMasterClient>,
    pub slicer: Arc<dyn Slicer>,
}

#[derive(Default)]
struct Flags {
    initialized: AtomicBool,
    started: AtomicBool,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: AtomicBool,
    done_processing: AtomicBool,
    done_dispatching: AtomicBool,
    execution_done: AtomicBool,
    execution_finished: AtomicBool,
    workers_have_connected: AtomicBool,
    slicer_failed: AtomicBool,
    recovery_complete: AtomicBool,
}

fn flag(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

fn set(flag: &AtomicBool, value: bool) {
    flag.store(value, Ordering::SeqCst);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts tracked while the execution is on probation.
#[derive(Debug, Default)]
struct Probation {
    failed: u64,
    processed: u64,
    clean: u32,
}

struct ControllerInner {
    config: ControllerConfig,
    execution: ExecutionConfig,
    ex_id: String,
    ex_store: Arc<dyn ExecutionStore>,
    state_store: Arc<dyn StateStore>,
    cluster_master: Arc<dyn ClusterMasterClient>,
    hooks: SlicerHooks,
    server: ExecutionControllerServer,
    server_events: EventHub<ServerEvent>,
    events: EventHub<ControllerEvent>,
    scheduler: Scheduler,
    dispatch: DispatchQueue,
    analytics: ExecutionAnalytics,
    recovery: Mutex<Option<ExecutionRecovery>>,
    starting_points: Mutex<Vec<StartingPoint>>,
    /// Slices accepted by a worker and not yet reported back
    pending: AtomicI64,
    dynamic_queue_length: bool,
    flags: Flags,
    connect_watchdog: Watchdog,
    disconnect_watchdog: Watchdog,
    probation_watchdog: Watchdog,
    probation: Mutex<Probation>,
    listeners: Mutex<Listeners>,
    start_time: Mutex<Option<Instant>>,
    shutdown_result: tokio::sync::Mutex<Option<std::result::Result<(), Vec<String>>>>,
}

/// Coordinates one execution.
///
/// Lifecycle: [`ExecutionController::initialize`], then
/// [`ExecutionController::run`] until the execution finishes, then
/// [`ExecutionController::shutdown`].
#[derive(Clone)]
pub struct ExecutionController {
    inner: Arc<ControllerInner>,
}

fn slicer_context(execution: &ExecutionConfig, events: &EventHub<ControllerEvent>) -> SlicerContext {
    SlicerContext {
        ex_id: execution.ex_id.clone(),
        job_id: execution.job_id.clone(),
        lifecycle: execution.lifecycle,
        slicers: execution.slicers,
        workers: execution.workers,
        operations: execution.operations.clone(),
        recovered: execution.is_recovery(),
        events: events.clone(),
    }
}

/// Failure message for an execution that ended with slices in `error` or `start`.
pub fn format_execution_failure(ex_id: &str, errors: usize, started: usize) -> String {
    let started_msg = if started == 1 {
        format!("{} slice stuck in started", started)
    } else {
        format!("{} slices stuck in started", started)
    };
    let errors_msg = if errors == 1 {
        format!("{} slice failure", errors)
    } else {
        format!("{} slice failures", errors)
    };

    let mut msg = format!("execution: {}", ex_id);
    if errors == 0 && started > 0 {
        msg.push_str(&format!(" had {}", started_msg));
    } else {
        msg.push_str(&format!(" had {}", errors_msg));
        if started > 0 {
            msg.push_str(&format!(", and had {}", started_msg));
        }
    }
    msg.push_str(" during processing");
    msg
}

impl ExecutionController {
    pub fn new(config: ControllerConfig, execution: ExecutionConfig, deps: ControllerDeps) -> Result<Self> {
        config.validate()?;
        execution.validate()?;

        let ex_id = execution.ex_id.clone();
        let server_events = EventHub::new();
        let events = EventHub::new();
        let server = ExecutionControllerServer::new(&config, &ex_id, server_events.clone())?;

        let hooks = SlicerHooks::new(deps.slicer);
        let ctx = slicer_context(&execution, &events);
        let (queue_length, dynamic_queue_length) = match hooks.slicer().queue_length(&ctx) {
            QueueLength::Fixed(length) => (length, false),
            QueueLength::WorkerMinimum => (execution.workers, true),
        };

        let scheduler = Scheduler::new(
            &ex_id,
            &execution.job_id,
            hooks.clone(),
            events.clone(),
            queue_length,
        );
        let dispatch = DispatchQueue::new(
            execution.workers,
            config.dispatch_interval_cap,
            Duration::from_millis(config.dispatch_interval_ms),
        );

        let flags = Flags::default();
        set(&flags.recovery_complete, !execution.is_recovery());

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                ex_id,
                ex_store: deps.ex_store,
                state_store: deps.state_store,
                cluster_master: deps.cluster_master,
                hooks,
                server,
                server_events,
                events,
                scheduler,
                dispatch,
                analytics: ExecutionAnalytics::new(),
                recovery: Mutex::new(None),
                starting_points: Mutex::new(Vec::new()),
                pending: AtomicI64::new(0),
                dynamic_queue_length,
                flags,
                connect_watchdog: Watchdog::new(),
                disconnect_watchdog: Watchdog::new(),
                probation_watchdog: Watchdog::new(),
                probation: Mutex::new(Probation::default()),
                listeners: Mutex::new(Listeners::new()),
                start_time: Mutex::new(None),
                shutdown_result: tokio::sync::Mutex::new(None),
                execution,
            }),
        })
    }

    /// Verify the execution may start, then bring up the server and listeners.
    ///
    /// Returns `Ok(false)` when the execution is already terminal or running
    /// elsewhere; the cluster master has then been told it finished.
    pub async fn initialize(&self) -> Result<bool> {
        let inner = &self.inner;
        inner.cluster_master.start(inner.events.clone()).await?;

        match inner.verify_execution().await {
            Ok(true) => {}
            verified => {
                set(&inner.flags.shutdown, true);
                if let Err(e) = inner.ex_store.shutdown().await {
                    tracing::warn!(error = %e, "Failed to shutdown execution store");
                }
                if let Err(e) = inner.cluster_master.shutdown().await {
                    tracing::warn!(error = %e, "Failed to shutdown cluster master client");
                }
                return verified;
            }
        }

        let addr = inner.server.start().await?;
        tracing::info!(ex_id = %inner.ex_id, addr = %addr, "Execution controller listening");

        let server_handler = inner.clone();
        let server_listener = inner.server_events.on(move |event| {
            let inner = server_handler.clone();
            async move { inner.handle_server_event(event).await }
        });
        let event_handler = inner.clone();
        let event_listener = inner.events.on(move |event| {
            let inner = event_handler.clone();
            async move { inner.handle_controller_event(event).await }
        });
        {
            let mut listeners = lock(&inner.listeners);
            listeners.push(server_listener);
            listeners.push(event_listener);
        }

        set(&inner.flags.initialized, true);
        tracing::debug!(ex_id = %inner.ex_id, "Execution is initialized");
        Ok(true)
    }

    /// Run the execution to completion and persist its final status.
    pub async fn run(&self) -> Result<()> {
        let inner = &self.inner;
        if flag(&inner.flags.shutting_down) {
            tracing::error!(ex_id = %inner.ex_id, "Cannot run execution while shutting down");
            return Ok(());
        }
        if !flag(&inner.flags.initialized) {
            tracing::error!(ex_id = %inner.ex_id, "Cannot run execution, it is not initialized");
            return Ok(());
        }

        if let Err(e) = inner.run_execution().await {
            tracing::error!(ex_id = %inner.ex_id, error = %e, "Run execution error");
        }

        // let workers go straight to offline from here on
        inner.server.set_shutting_down(true);

        inner.finish_execution().await;

        let notified = inner.server.send_execution_finished_to_all(&inner.ex_id);
        tracing::debug!(ex_id = %inner.ex_id, workers = notified, "Sent execution finished to workers");

        let (finished, _) = tokio::join!(
            inner.cluster_master.send_execution_finished(None),
            inner.wait_for_workers_to_exit(),
        );
        if let Err(e) = finished {
            tracing::error!(ex_id = %inner.ex_id, error = %e, "Failure sending execution finished");
        }

        tracing::debug!(ex_id = %inner.ex_id, "Execution is done");
        Ok(())
    }

    pub async fn pause(&self) {
        self.inner.pause().await;
    }

    pub async fn resume(&self) {
        self.inner.resume().await;
    }

    /// Shut everything down. Idempotent; a concurrent caller waits for the
    /// first shutdown and gets its result.
    pub async fn shutdown(&self) -> Result<()> {
        let mut result = self.inner.shutdown_result.lock().await;
        if let Some(previous) = result.as_ref() {
            tracing::debug!(ex_id = %self.inner.ex_id, "Execution controller was already shutdown");
            return previous.clone().map_err(SlicerError::Shutdown);
        }
        if flag(&self.inner.flags.shutdown) || !flag(&self.inner.flags.initialized) {
            return Ok(());
        }

        let outcome = self.inner.shutdown().await;
        *result = Some(outcome.clone());
        outcome.map_err(SlicerError::Shutdown)
    }

    pub fn ex_id(&self) -> &str {
        &self.inner.ex_id
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.inner.execution
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }

    pub fn server(&self) -> &ExecutionControllerServer {
        &self.inner.server
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn analytics(&self) -> &ExecutionAnalytics {
        &self.inner.analytics
    }

    pub fn events(&self) -> &EventHub<ControllerEvent> {
        &self.inner.events
    }

    pub fn pending_slices(&self) -> i64 {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        flag(&self.inner.flags.paused)
    }

    pub fn is_shutting_down(&self) -> bool {
        flag(&self.inner.flags.shutting_down)
    }

    pub fn is_execution_done(&self) -> bool {
        flag(&self.inner.flags.execution_done)
    }

    pub fn is_recovery_complete(&self) -> bool {
        flag(&self.inner.flags.recovery_complete)
    }

    pub async fn status(&self) -> Result<ExecutionStatus> {
        self.inner.ex_store.get_status(&self.inner.ex_id).await
    }
}

impl ControllerInner {
    fn is_once(&self) -> bool {
        self.execution.lifecycle == Lifecycle::Once && flag(&self.flags.recovery_complete)
    }

    fn is_recovering(&self) -> bool {
        self.execution.is_recovery() && !flag(&self.flags.recovery_complete)
    }

    async fn verify_execution(&self) -> Result<bool> {
        let status = self.ex_store.get_status(&self.ex_id).await?;

        let reason = if self.ex_store.terminal_statuses().contains(&status) {
            "terminal"
        } else if self.ex_store.running_statuses().contains(&status) {
            "running"
        } else {
            return Ok(true);
        };
        let msg = format!(
            "Execution {} was starting in {} status, sending execution:finished event to cluster master",
            self.ex_id, reason
        );

        self.cluster_master
            .send_execution_finished(Some(msg.clone()))
            .await?;
        tracing::warn!(ex_id = %self.ex_id, status = %status, error = %msg, "Unable to verify execution on initialization");
        Ok(false)
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::ClientOnline(worker_id) => {
                tracing::debug!(ex_id = %self.ex_id, worker_id = %worker_id, "Worker is online");
                self.adjust_queue_length();
                set(&self.flags.workers_have_connected, true);
                self.connect_watchdog.clear();
                self.analytics.increment(Metric::WorkersJoined);
            }
            ServerEvent::ClientAvailable(_) | ServerEvent::ClientUnavailable(_) => {
                self.update_worker_gauges();
            }
            ServerEvent::ClientDisconnect(worker_id) => {
                tracing::debug!(ex_id = %self.ex_id, worker_id = %worker_id, "Worker is disconnected but it may reconnect");
                self.analytics.increment(Metric::WorkersDisconnected);
                self.update_worker_gauges();
                self.start_worker_disconnect_watchdog();
            }
            ServerEvent::ClientOffline(worker_id) => {
                tracing::debug!(ex_id = %self.ex_id, worker_id = %worker_id, "Worker is offline");
                self.adjust_queue_length();
            }
            ServerEvent::ClientReconnect(worker_id) => {
                self.disconnect_watchdog.clear();
                set(&self.flags.workers_have_connected, true);
                self.connect_watchdog.clear();
                tracing::debug!(ex_id = %self.ex_id, worker_id = %worker_id, "Worker is reconnected");
                self.analytics.increment(Metric::WorkersReconnected);
            }
            ServerEvent::SliceSuccess(completion) => self.slice_success(completion).await,
            ServerEvent::SliceFailure(completion) => self.slice_failure(completion).await,
            ServerEvent::SlicesOrphaned { worker_id, slices } => {
                tracing::warn!(
                    ex_id = %self.ex_id,
                    worker_id = %worker_id,
                    count = slices.len(),
                    "Requeueing slices of offline worker"
                );
                for slice in slices {
                    self.scheduler.enqueue_slice(slice, true);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    async fn handle_controller_event(self: &Arc<Self>, event: ControllerEvent) {
        match event {
            ControllerEvent::SlicersFinished(Some(error)) => {
                tracing::error!(ex_id = %self.ex_id, error = %error, "Slicers finished due to failure");
                self.terminal_error(error).await;
            }
            ControllerEvent::SlicersFinished(None) => {
                if let Err(e) = self
                    .ex_store
                    .update(&self.ex_id, ExecutionUpdate::slicers_finished())
                    .await
                {
                    tracing::warn!(ex_id = %self.ex_id, error = %e, "Failed to record finished slicers");
                }
            }
            ControllerEvent::ExecutionUpdate(operations) => {
                tracing::debug!(ex_id = %self.ex_id, "Slicer sent an execution update");
                if let Err(e) = self
                    .ex_store
                    .update(&self.ex_id, ExecutionUpdate::operations(operations))
                    .await
                {
                    tracing::warn!(ex_id = %self.ex_id, error = %e, "Failed to persist execution update");
                }
            }
            ControllerEvent::ExecutionPause => self.pause().await,
            ControllerEvent::ExecutionResume => self.resume().await,
            ControllerEvent::ClusterMasterShutdown => {
                tracing::warn!(ex_id = %self.ex_id, "Cluster master shutdown, exiting");
                self.end_execution();
            }
        }
    }

    async fn slice_success(&self, completion: SliceCompletion) {
        let slice_id = &completion.slice.slice_id;
        tracing::debug!(ex_id = %self.ex_id, worker_id = %completion.worker_id, slice_id = %slice_id, "Worker completed its slice");

        if let Err(e) = self
            .state_store
            .update_state(&self.ex_id, slice_id, SliceState::Completed, None)
            .await
        {
            tracing::error!(ex_id = %self.ex_id, slice_id = %slice_id, error = %e, "Failed to record completed slice");
        }
        self.analytics.increment(Metric::Processed);
        self.hooks.slice_complete(&completion).await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    async fn slice_failure(self: &Arc<Self>, completion: SliceCompletion) {
        let slice_id = &completion.slice.slice_id;
        tracing::error!(
            ex_id = %self.ex_id,
            worker_id = %completion.worker_id,
            slice_id = %slice_id,
            error = completion.error.as_deref().unwrap_or_default(),
            "Worker failed to complete its slice"
        );

        if let Err(e) = self
            .state_store
            .update_state(&self.ex_id, slice_id, SliceState::Error, completion.error.clone())
            .await
        {
            tracing::error!(ex_id = %self.ex_id, slice_id = %slice_id, error = %e, "Failed to record failed slice");
        }
        self.analytics.increment(Metric::Processed);
        self.analytics.increment(Metric::Failed);
        self.hooks.slice_complete(&completion).await;

        if self.is_once() {
            self.set_failing_status().await;
        } else if self.is_recovering() {
            self.terminal_error("Slice failed while recovering".to_string())
                .await;
        } else {
            self.start_probation().await;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn update_worker_gauges(&self) {
        self.analytics.set(
            Metric::WorkersAvailable,
            self.server.messenger().available_client_count() as u64,
        );
        self.analytics
            .set(Metric::WorkersActive, self.server.active_worker_count() as u64);
    }

    fn adjust_queue_length(&self) {
        if !self.dynamic_queue_length {
            return;
        }
        let online = self.server.messenger().online_client_count();
        if online > self.scheduler.max_queue_length() {
            self.scheduler.set_max_queue_length(online);
            tracing::info!(ex_id = %self.ex_id, queue_length = online, "Adjusted queue length");
        }
    }

    async fn pause(&self) {
        if self.flags.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(ex_id = %self.ex_id, "Execution is pausing");
        self.scheduler.pause();
        self.swap_status(ExecutionStatus::Running, ExecutionStatus::Paused)
            .await;
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    async fn resume(&self) {
        if !self.flags.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(ex_id = %self.ex_id, "Execution is resuming");
        self.scheduler.resume();
        self.swap_status(ExecutionStatus::Paused, ExecutionStatus::Running)
            .await;
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    /// Set `to` only if the execution is currently in `from`.
    async fn swap_status(&self, from: ExecutionStatus, to: ExecutionStatus) {
        match self.ex_store.get_status(&self.ex_id).await {
            Ok(status) if status == from => {
                if let Err(e) = self.ex_store.set_status(&self.ex_id, to, None).await {
                    tracing::warn!(ex_id = %self.ex_id, status = %to, error = %e, "Failed to update execution status");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(ex_id = %self.ex_id, error = %e, "Failed to read execution status");
            }
        }
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    async fn set_failing_status(&self) {
        let msg = format!("slicer: {} has encountered a processing_error", self.ex_id);
        tracing::error!(ex_id = %self.ex_id, "{}", msg);

        let metadata = self.ex_store.execution_metadata(self.analytics.snapshot(), Some(msg));
        if let Err(e) = self
            .ex_store
            .set_status(&self.ex_id, ExecutionStatus::Failing, Some(metadata))
            .await
        {
            tracing::warn!(ex_id = %self.ex_id, error = %e, "Failed to set failing status");
        }
    }

    /// Fail the execution and end it. Only the first call has an effect.
    async fn terminal_error(&self, reason: String) {
        if flag(&self.flags.execution_done) || self.flags.slicer_failed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::error!(ex_id = %self.ex_id, error = %reason, "Slicer for execution had an error, shutting down execution");
        let msg = format!(
            "slicer for ex {} had an error, shutting down execution, caused by {}",
            self.ex_id, reason
        );
        let metadata = self.ex_store.execution_metadata(self.analytics.snapshot(), Some(msg));
        if let Err(e) = self
            .ex_store
            .set_status(&self.ex_id, ExecutionStatus::Failed, Some(metadata))
            .await
        {
            tracing::error!(ex_id = %self.ex_id, error = %e, "Failed to set failed status");
        }

        tracing::error!(ex_id = %self.ex_id, "Execution is done because of slice failure");
        self.end_execution();
    }

    /// Persistent-mode failure: mark the execution failing and watch for it to heal.
    async fn start_probation(self: &Arc<Self>) {
        let stats = self.analytics.snapshot();
        if self.probation_watchdog.is_armed() {
            let mut probation = lock(&self.probation);
            probation.failed = stats.failed;
            probation.processed = stats.processed;
            probation.clean = 0;
            return;
        }

        *lock(&self.probation) = Probation {
            failed: stats.failed,
            processed: stats.processed,
            clean: 0,
        };
        self.set_failing_status().await;

        let weak = Arc::downgrade(self);
        self.probation_watchdog
            .arm_interval(self.execution.probation_window(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.probation_tick().await,
                        None => false,
                    }
                }
            });
    }

    /// One probation poll. Returns false once the execution has healed.
    async fn probation_tick(&self) -> bool {
        let stats = self.analytics.snapshot();
        let healed = {
            let mut probation = lock(&self.probation);
            let clean = stats.failed == probation.failed && stats.processed > probation.processed;
            probation.clean = if clean { probation.clean + 1 } else { 0 };
            probation.failed = stats.failed;
            probation.processed = stats.processed;
            probation.clean >= self.execution.probation.clean_windows
        };
        if !healed {
            return true;
        }

        tracing::info!(ex_id = %self.ex_id, "No slice errors have occurred, execution will be set back to running");
        self.swap_status(ExecutionStatus::Failing, ExecutionStatus::Running)
            .await;
        false
    }

    fn start_worker_connect_watchdog(self: &Arc<Self>) {
        let timeout = self.config.slicer_timeout();
        let weak: Weak<Self> = Arc::downgrade(self);
        self.connect_watchdog.arm(timeout, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if flag(&inner.flags.shutting_down) || flag(&inner.flags.workers_have_connected) {
                return;
            }
            tracing::warn!(ex_id = %inner.ex_id, "No worker has connected, shutting down execution");
            let reason = format!(
                "No workers have connected to slicer in the allotted time: {} ms",
                timeout.as_millis()
            );
            tokio::spawn(async move { inner.terminal_error(reason).await });
        });
    }

    fn start_worker_disconnect_watchdog(self: &Arc<Self>) {
        self.disconnect_watchdog.clear();
        if flag(&self.flags.shutting_down) || self.server.messenger().online_client_count() > 0 {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        self.disconnect_watchdog
            .arm(self.config.worker_disconnect_timeout(), async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if flag(&inner.flags.shutting_down)
                    || inner.server.messenger().online_client_count() > 0
                {
                    return;
                }
                let reason = format!("All workers from {} have disconnected", inner.ex_id);
                tokio::spawn(async move { inner.terminal_error(reason).await });
            });
    }

    // ========================================================================
    // Run
    // ========================================================================

    async fn run_execution(self: &Arc<Self>) -> Result<()> {
        self.start_worker_connect_watchdog();

        if self.execution.analytics {
            self.analytics.start(AnalyticsReporter {
                cluster_master: self.cluster_master.clone(),
                hooks: self.hooks.clone(),
                scheduler: self.scheduler.clone(),
                interval: Duration::from_millis(self.config.analytics_interval_ms),
            });
        }

        tracing::info!(ex_id = %self.ex_id, lifecycle = %self.execution.lifecycle, "Starting execution");
        *lock(&self.start_time) = Some(Instant::now());

        self.ex_store
            .set_status(&self.ex_id, ExecutionStatus::Running, None)
            .await?;
        if let Err(e) = self.cluster_master.send_available().await {
            tracing::warn!(ex_id = %self.ex_id, error = %e, "Failed to report execution available");
        }
        set(&self.flags.started, true);

        if self.execution.is_recovery() {
            if let Err(e) = self.recover_slices_init().await {
                self.terminal_error(e.to_string()).await;
                return Err(e);
            }
            let (_, _, scheduled) = tokio::join!(
                self.wait_for_recovery(),
                self.run_dispatch(),
                self.scheduler.run(),
            );
            scheduled?;
        } else {
            if let Err(e) = self.slicer_init().await {
                self.terminal_error(e.to_string()).await;
                return Err(e);
            }
            let (_, scheduled) = tokio::join!(self.run_dispatch(), self.scheduler.run());
            scheduled?;
        }

        let scheduler_successful = self.scheduler.is_finished() && self.scheduler.slicers_done();
        if scheduler_successful && flag(&self.flags.done_dispatching) {
            tracing::debug!(ex_id = %self.ex_id, "Execution is done processing slices");
            set(&self.flags.done_processing, true);
            self.wait_for_pending_slices().await;
        } else if !flag(&self.flags.shutdown) {
            tracing::debug!(ex_id = %self.ex_id, "Execution did not finish correctly");
        }
        Ok(())
    }

    async fn slicer_init(&self) -> Result<()> {
        let max_tries = self.execution.max_retries.max(1);
        let ctx = slicer_context(&self.execution, &self.events);
        let starting_points = lock(&self.starting_points).clone();

        let mut attempt = 0;
        let slicers = loop {
            attempt += 1;
            match self.hooks.slicer().new_slicer(&ctx, &starting_points).await {
                Ok(slicers) => break slicers,
                Err(e) if attempt < max_tries => {
                    tracing::warn!(ex_id = %self.ex_id, attempt, error = %e, "Failed to create slicers, retrying");
                    tokio::time::sleep(SLICER_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.analytics.set(Metric::Slicers, slicers.len() as u64);
        self.scheduler.register_slicers(slicers);
        Ok(())
    }

    async fn recover_slices_init(&self) -> Result<()> {
        let recovery = ExecutionRecovery::new(
            &self.execution,
            self.state_store.clone(),
            self.ex_store.clone(),
        )?;
        recovery.initialize().await?;

        tracing::info!(ex_id = %self.ex_id, recover_ex_id = %recovery.recover_ex_id(), "Execution is starting in recovery mode");

        self.scheduler.set_recovering(true);
        self.scheduler.register_slicers(recovery.new_slicer());
        *lock(&self.recovery) = Some(recovery);
        Ok(())
    }

    async fn wait_for_recovery(&self) {
        let Some(recovery) = lock(&self.recovery).clone() else {
            return;
        };

        match recovery.wait_for_outcome().await {
            None => {}
            Some(RecoveryOutcome::Exit) => {
                set(&self.flags.recovery_complete, true);
                self.scheduler.set_recovering(false);
                tracing::warn!(ex_id = %self.ex_id, "Execution recovery has been marked as completed");
            }
            Some(RecoveryOutcome::StartingPoints(points)) => {
                tracing::debug!(ex_id = %self.ex_id, starting_points = points.len(), "Recovery starting points");
                *lock(&self.starting_points) = points;

                if let Err(e) = self.slicer_init().await {
                    self.terminal_error(e.to_string()).await;
                    self.scheduler.set_recovering(false);
                    return;
                }
                set(&self.flags.recovery_complete, recovery.recovery_complete());
                self.scheduler.set_recovering(false);
                tracing::info!(ex_id = %self.ex_id, "Execution finished its recovery");
            }
        }
    }

    fn dispatch_should_stop(&self) -> bool {
        flag(&self.flags.execution_done) || flag(&self.flags.shutting_down)
    }

    async fn run_dispatch(self: &Arc<Self>) {
        while !flag(&self.flags.workers_have_connected) {
            if self.dispatch_should_stop() {
                set(&self.flags.done_dispatching, true);
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        set(&self.flags.done_dispatching, false);
        self.dispatch.start();
        tracing::debug!(ex_id = %self.ex_id, "Dispatching slices");

        loop {
            if self.dispatch_should_stop() {
                break;
            }
            if self.scheduler.is_finished()
                && self.dispatch.outstanding() == 0
                && self.pending.load(Ordering::SeqCst) <= 0
            {
                break;
            }

            if flag(&self.flags.paused) {
                tokio::time::sleep(PAUSED_DELAY).await;
                continue;
            }

            let workers = self.server.worker_queue_size();
            let slices = self.scheduler.queue_length();
            if workers.min(slices) > 0 {
                self.dispatch_slices().await;
                continue;
            }

            if workers == 0 && !flag(&self.flags.shutting_down) {
                self.server_events
                    .once_with_timeout(
                        |event| {
                            matches!(
                                event,
                                ServerEvent::ClientAvailable(_)
                                    | ServerEvent::SliceSuccess(_)
                                    | ServerEvent::SliceFailure(_)
                                    | ServerEvent::SlicesOrphaned { .. }
                            )
                        },
                        WORKER_WAIT,
                    )
                    .await;
            } else {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        self.dispatch.on_idle().await;
        set(&self.flags.done_dispatching, true);
        tracing::debug!(ex_id = %self.ex_id, "Done dispatching slices");
    }

    async fn dispatch_slices(self: &Arc<Self>) {
        let slices = self.scheduler.get_slices(self.server.worker_queue_size());
        let mut added = 0;
        for slice in slices {
            let Some(worker_id) = self.server.dequeue_worker(&slice) else {
                self.scheduler.enqueue_slice(slice, true);
                continue;
            };
            tracing::trace!(ex_id = %self.ex_id, slice_id = %slice.slice_id, worker_id = %worker_id, "Queueing slice dispatch");
            let inner = self.clone();
            self.dispatch
                .add(async move { inner.dispatch_slice(slice, worker_id).await });
            added += 1;
        }

        if added > 0 && self.dispatch.pending() == 0 {
            self.dispatch.on_empty().await;
        } else {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn dispatch_slice(&self, mut slice: Slice, worker_id: String) {
        if slice.created.is_none() {
            slice.created = Some(Utc::now());
            if let Err(e) = self
                .state_store
                .create_state(&self.ex_id, &slice, SliceState::Start)
                .await
            {
                tracing::error!(ex_id = %self.ex_id, slice_id = %slice.slice_id, error = %e, "Failed to record slice start");
                slice.created = None;
                self.scheduler.enqueue_slice(slice, true);
                self.server.enqueue_available(&worker_id);
                return;
            }
        }

        // counted before sending so a fast completion cannot drive it negative
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.server.dispatch_slice(&slice, &worker_id).await {
            tracing::debug!(ex_id = %self.ex_id, slice_id = %slice.slice_id, worker_id = %worker_id, "Dispatched slice");
            self.analytics.increment(Metric::Dispatched);
            self.hooks.slice_dispatch(&slice, &worker_id).await;
        } else {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(ex_id = %self.ex_id, slice_id = %slice.slice_id, worker_id = %worker_id, "Worker is not available to process slice");
            self.scheduler.enqueue_slice(slice, true);
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    async fn finish_execution(&self) {
        if flag(&self.flags.execution_finished) {
            return;
        }

        // nothing may be handed to a worker once the final status is written
        self.dispatch.clear();

        self.log_finished_job();
        if let Err(e) = self.update_execution_status().await {
            tracing::error!(
                ex_id = %self.ex_id,
                error = %e,
                "Execution has run to completion but failed while updating the execution status"
            );
        }

        set(&self.flags.execution_finished, true);
        self.end_execution();
    }

    fn end_execution(&self) {
        set(&self.flags.execution_done, true);
        self.scheduler.cleanup();
        if let Some(recovery) = lock(&self.recovery).as_ref() {
            recovery.close();
        }
    }

    fn log_finished_job(&self) {
        let start = *lock(&self.start_time);
        let elapsed = start.map(|start| start.elapsed()).unwrap_or_default();
        let secs = if elapsed < Duration::from_secs(1) {
            1
        } else {
            elapsed.as_secs_f64().round() as u64
        };
        self.analytics.set(Metric::JobDuration, secs);
        tracing::info!(ex_id = %self.ex_id, seconds = secs, "Execution has finished");
    }

    async fn update_execution_status(&self) -> Result<()> {
        // already marked failed
        if flag(&self.flags.slicer_failed) {
            return Ok(());
        }

        let stats = self.analytics.snapshot();

        if !flag(&self.flags.done_processing) {
            let status = self.ex_store.get_status(&self.ex_id).await?;
            if matches!(status, ExecutionStatus::Stopping | ExecutionStatus::Stopped) {
                tracing::debug!(ex_id = %self.ex_id, status = %status, "Execution is stopping, status will not be updated");
                return self
                    .ex_store
                    .update(
                        &self.ex_id,
                        ExecutionUpdate::metadata(self.ex_store.execution_metadata(stats, None)),
                    )
                    .await;
            }

            let msg = format!(
                "execution {} received shutdown before the slicer could complete, setting status to \"terminated\"",
                self.ex_id
            );
            tracing::error!(ex_id = %self.ex_id, "{}", msg);
            return self
                .ex_store
                .set_status(
                    &self.ex_id,
                    ExecutionStatus::Terminated,
                    Some(self.ex_store.execution_metadata(stats, Some(msg))),
                )
                .await;
        }

        let (errors, started) = tokio::try_join!(
            self.state_store.count(&self.ex_id, SliceState::Error),
            self.state_store.count(&self.ex_id, SliceState::Start),
        )?;

        if errors > 0 || started > 0 {
            let msg = format_execution_failure(&self.ex_id, errors, started);
            tracing::error!(ex_id = %self.ex_id, errors, started, "{}", msg);
            return self
                .ex_store
                .set_status(
                    &self.ex_id,
                    ExecutionStatus::Failed,
                    Some(self.ex_store.execution_metadata(stats, Some(msg))),
                )
                .await;
        }

        tracing::info!(ex_id = %self.ex_id, processed = stats.processed, "Execution has completed");
        self.ex_store
            .set_status(
                &self.ex_id,
                ExecutionStatus::Completed,
                Some(self.ex_store.execution_metadata(stats, None)),
            )
            .await
    }

    async fn wait_for_pending_slices(&self) {
        let timeout = self.config.shutdown_timeout();
        let mut last = self.pending.load(Ordering::SeqCst);
        let mut deadline = Instant::now() + timeout;

        loop {
            if flag(&self.flags.shutting_down) {
                return;
            }
            let pending = self.pending.load(Ordering::SeqCst);
            if pending <= 0 {
                tracing::debug!(ex_id = %self.ex_id, "All pending slices are done");
                return;
            }
            if pending != last {
                last = pending;
                deadline = Instant::now() + timeout;
            }
            if Instant::now() > deadline {
                tracing::warn!(ex_id = %self.ex_id, pending, "Timed out waiting for pending slices");
                return;
            }
            tracing::trace!(ex_id = %self.ex_id, pending, "Waiting for slices to finish");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_workers_to_exit(&self) {
        let deadline = Instant::now() + self.config.worker_disconnect_timeout();
        loop {
            if !self.cluster_master.is_ready() {
                return;
            }
            let online = self.server.messenger().online_client_count();
            if online == 0 {
                tracing::trace!(ex_id = %self.ex_id, "All workers have disconnected");
                return;
            }
            if Instant::now() > deadline {
                tracing::warn!(ex_id = %self.ex_id, online, "Workers did not go offline in time");
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_execution_finished(&self) {
        if !flag(&self.flags.started) {
            return;
        }
        let timeout = self.config.shutdown_timeout().mul_f64(0.8);
        let deadline = Instant::now() + timeout;
        loop {
            if flag(&self.flags.execution_done) {
                tracing::trace!(ex_id = %self.ex_id, "Execution finished while shutting down");
                return;
            }
            if !self.cluster_master.is_ready() {
                return;
            }
            if Instant::now() > deadline {
                tracing::error!(
                    ex_id = %self.ex_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutdown timeout waiting for execution to finish"
                );
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    async fn shutdown(&self) -> std::result::Result<(), Vec<String>> {
        tracing::debug!(ex_id = %self.ex_id, "Execution shutdown was called");
        let mut errors = Vec::new();

        self.server.set_shutting_down(true);
        self.scheduler.stop();
        lock(&self.listeners).remove_all();

        set(&self.flags.shutting_down, true);
        set(&self.flags.paused, false);
        if let Some(recovery) = lock(&self.recovery).as_ref() {
            recovery.close();
        }

        self.probation_watchdog.clear();
        self.connect_watchdog.clear();
        self.disconnect_watchdog.clear();

        self.wait_for_execution_finished().await;

        self.dispatch.close();
        self.scheduler.cleanup();

        let recovery = lock(&self.recovery).clone();
        if let Some(recovery) = recovery {
            if let Err(e) = recovery.shutdown().await {
                errors.push(e.to_string());
            }
        }

        if let Err(e) = self.analytics.shutdown().await {
            tracing::error!(ex_id = %self.ex_id, error = %e, "Execution analytics error");
        }

        if let Err(e) = self.server.shutdown().await {
            errors.push(e.to_string());
        }
        if let Err(e) = self.cluster_master.shutdown().await {
            errors.push(e.to_string());
        }
        if let Err(e) = self.state_store.shutdown().await {
            errors.push(e.to_string());
        }
        if let Err(e) = self.ex_store.shutdown().await {
            errors.push(e.to_string());
        }

        set(&self.flags.shutdown, true);
        tracing::warn!(ex_id = %self.ex_id, "Execution controller is shutdown");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_counts_errors_and_started() {
        assert_eq!(
            format_execution_failure("ex-1", 1, 0),
            "execution: ex-1 had 1 slice failure during processing"
        );
        assert_eq!(
            format_execution_failure("ex-1", 3, 2),
            "execution: ex-1 had 3 slice failures, and had 2 slices stuck in started during processing"
        );
        assert_eq!(
            format_execution_failure("ex-1", 0, 1),
            "execution: ex-1 had 1 slice stuck in started during processing"
        );
    }
}
