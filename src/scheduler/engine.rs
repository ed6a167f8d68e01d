use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerEvent;
use crate::error::{Result, SlicerError};
use crate::events::EventHub;
use crate::scheduler::queue::SliceQueue;
use crate::scheduler::slice::Slice;
use crate::slicer::{SliceOutput, SlicerFn, SlicerHooks};

/// Delay before polling a slicer again after it reported no work.
const EMPTY_POLL_DELAY: Duration = Duration::from_millis(50);
/// Upper bound on waiting for queue space between checks.
const SPACE_POLL_DELAY: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SchedulerInner {
    ex_id: String,
    job_id: String,
    queue: Mutex<SliceQueue>,
    paused: watch::Sender<bool>,
    stop: CancellationToken,
    recovering: AtomicBool,
    registered: Mutex<Vec<(usize, Box<dyn SlicerFn>)>>,
    /// Next slicer order per slicer id
    orders: Mutex<HashMap<usize, u64>>,
    slicers_done: AtomicBool,
    failed: AtomicBool,
    running: AtomicBool,
    changed: Notify,
    space: Notify,
    hooks: SlicerHooks,
    events: EventHub<ControllerEvent>,
}

/// Runs slicer functions and buffers their output for dispatch.
///
/// Each registered slicer function gets its own task. Production pauses
/// while the ready queue is full or the scheduler is paused.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        ex_id: impl Into<String>,
        job_id: impl Into<String>,
        hooks: SlicerHooks,
        events: EventHub<ControllerEvent>,
        max_queue_length: usize,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                ex_id: ex_id.into(),
                job_id: job_id.into(),
                queue: Mutex::new(SliceQueue::with_capacity(max_queue_length)),
                paused,
                stop: CancellationToken::new(),
                recovering: AtomicBool::new(false),
                registered: Mutex::new(Vec::new()),
                orders: Mutex::new(HashMap::new()),
                slicers_done: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                changed: Notify::new(),
                space: Notify::new(),
                hooks,
                events,
            }),
        }
    }

    /// Add slicer functions; their index is their slicer id.
    pub fn register_slicers(&self, fns: Vec<Box<dyn SlicerFn>>) {
        let count = fns.len();
        lock(&self.inner.registered).extend(fns.into_iter().enumerate());
        tracing::debug!(ex_id = %self.inner.ex_id, count, "Registered slicers");
        self.inner.changed.notify_one();
    }

    /// While recovering, the scheduler keeps running after the registered
    /// slicers finish so the regular slicers can be added later.
    pub fn set_recovering(&self, recovering: bool) {
        self.inner.recovering.store(recovering, Ordering::SeqCst);
        self.inner.changed.notify_one();
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovering.load(Ordering::SeqCst)
    }

    /// Drive every registered slicer until all are done or the scheduler stops.
    pub async fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SlicerError::Slicer("scheduler is already running".into()));
        }

        let mut tasks = JoinSet::new();
        loop {
            let registered = std::mem::take(&mut *lock(&self.inner.registered));
            for (slicer_id, slicer_fn) in registered {
                let inner = self.inner.clone();
                tasks.spawn(async move { inner.run_slicer(slicer_id, slicer_fn).await });
            }

            if self.inner.stop.is_cancelled() {
                break;
            }
            if tasks.is_empty() && !self.is_recovering() && lock(&self.inner.registered).is_empty()
            {
                if !self.inner.failed.load(Ordering::SeqCst) {
                    self.inner.slicers_done.store(true, Ordering::SeqCst);
                    tracing::info!(ex_id = %self.inner.ex_id, "All slicers finished");
                    self.inner
                        .events
                        .emit(ControllerEvent::SlicersFinished(None));
                }
                break;
            }

            tokio::select! {
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(Err(e)) = joined {
                        if e.is_panic() {
                            self.inner.fail(format!("slicer panicked: {}", e));
                        }
                    }
                }
                _ = self.inner.changed.notified() => {}
                _ = self.inner.stop.cancelled() => break,
            }
        }

        tasks.abort_all();
        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Take up to `count` slices from the front of the queue.
    pub fn get_slices(&self, count: usize) -> Vec<Slice> {
        let slices = lock(&self.inner.queue).take(count);
        if !slices.is_empty() {
            self.inner.space.notify_waiters();
        }
        slices
    }

    /// Put a slice on the queue. Requeued slices go to the front.
    pub fn enqueue_slice(&self, slice: Slice, requeue: bool) {
        let mut queue = lock(&self.inner.queue);
        if requeue {
            queue.push_front(slice);
        } else {
            queue.push_back(slice);
        }
    }

    pub fn queue_length(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn max_queue_length(&self) -> usize {
        lock(&self.inner.queue).max_length()
    }

    pub fn set_max_queue_length(&self, max_length: usize) {
        lock(&self.inner.queue).set_max_length(max_length);
        self.inner.space.notify_waiters();
    }

    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn stop(&self) {
        self.inner.stop.cancel();
        self.inner.changed.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Stop producing and drop anything still queued.
    pub fn cleanup(&self) {
        self.stop();
        let dropped = lock(&self.inner.queue).clear();
        if dropped > 0 {
            tracing::debug!(ex_id = %self.inner.ex_id, dropped, "Dropped queued slices");
        }
    }

    pub fn slicers_done(&self) -> bool {
        self.inner.slicers_done.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// True once stopped, or once every slicer is done and the queue drained.
    pub fn is_finished(&self) -> bool {
        self.is_stopped() || (self.slicers_done() && self.queue_length() == 0)
    }
}

impl SchedulerInner {
    async fn run_slicer(self: Arc<Self>, slicer_id: usize, mut slicer_fn: Box<dyn SlicerFn>) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }
            if !self.wait_until_resumed().await || !self.wait_for_space().await {
                return;
            }

            let output = tokio::select! {
                output = slicer_fn.next_slice() => output,
                _ = self.stop.cancelled() => return,
            };

            match output {
                Ok(SliceOutput::Slice(request)) => {
                    let order = self.next_order(slicer_id);
                    let slice = Slice::new(&self.ex_id, &self.job_id, slicer_id, order, request);
                    self.push(slice).await;
                }
                Ok(SliceOutput::Recovered(mut slice)) => {
                    slice.ex_id = self.ex_id.clone();
                    slice.job_id = self.job_id.clone();
                    slice.slicer_id = slicer_id;
                    slice.slicer_order = self.next_order(slicer_id);
                    slice.created = None;
                    self.push(slice).await;
                }
                Ok(SliceOutput::Empty) => {
                    tokio::select! {
                        _ = tokio::time::sleep(EMPTY_POLL_DELAY) => {}
                        _ = self.stop.cancelled() => return,
                    }
                }
                Ok(SliceOutput::Done) => {
                    tracing::debug!(ex_id = %self.ex_id, slicer_id, "Slicer finished");
                    return;
                }
                Err(e) => {
                    self.fail(format!("slicer {} failed: {}", slicer_id, e));
                    return;
                }
            }
        }
    }

    async fn push(&self, slice: Slice) {
        lock(&self.queue).push_back(slice.clone());
        self.hooks.slice_enqueued(&slice).await;
    }

    fn next_order(&self, slicer_id: usize) -> u64 {
        let mut orders = lock(&self.orders);
        let next = orders.entry(slicer_id).or_insert(0);
        let order = *next;
        *next += 1;
        order
    }

    async fn wait_until_resumed(&self) -> bool {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            resumed = paused.wait_for(|p| !*p) => resumed.is_ok(),
            _ = self.stop.cancelled() => false,
        }
    }

    async fn wait_for_space(&self) -> bool {
        loop {
            if !lock(&self.queue).is_full() {
                return true;
            }
            tokio::select! {
                _ = self.space.notified() => {}
                _ = tokio::time::sleep(SPACE_POLL_DELAY) => {}
                _ = self.stop.cancelled() => return false,
            }
        }
    }

    fn fail(&self, reason: String) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(ex_id = %self.ex_id, error = %reason, "Slicer failure");
        self.events
            .emit(ControllerEvent::SlicersFinished(Some(reason)));
        self.stop.cancel();
        self.changed.notify_one();
    }
}
