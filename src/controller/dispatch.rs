use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Tasks waiting to start and tasks currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub running: usize,
}

impl QueueCounts {
    pub fn outstanding(&self) -> usize {
        self.waiting + self.running
    }
}

/// At most `cap` admissions per `interval`.
#[derive(Default)]
struct RateWindow {
    started: Option<Instant>,
    admitted: usize,
}

struct DispatchInner {
    tasks: Mutex<VecDeque<Task>>,
    counts: watch::Sender<QueueCounts>,
    started: watch::Sender<bool>,
    semaphore: Arc<Semaphore>,
    window: tokio::sync::Mutex<RateWindow>,
    interval: Duration,
    interval_cap: usize,
    wake: Notify,
    closed: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded-concurrency, rate-limited FIFO of dispatch tasks.
///
/// The queue starts paused; nothing runs until [`DispatchQueue::start`].
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<DispatchInner>,
}

impl DispatchQueue {
    pub fn new(concurrency: usize, interval_cap: usize, interval: Duration) -> Self {
        let (counts, _) = watch::channel(QueueCounts::default());
        let (started, _) = watch::channel(false);
        Self {
            inner: Arc::new(DispatchInner {
                tasks: Mutex::new(VecDeque::new()),
                counts,
                started,
                semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
                window: tokio::sync::Mutex::new(RateWindow::default()),
                interval,
                interval_cap: interval_cap.max(1),
                wake: Notify::new(),
                closed: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.inner.tasks);
        tasks.push_back(Box::pin(task));
        self.inner.counts.send_modify(|c| c.waiting += 1);
        drop(tasks);
        self.inner.wake.notify_one();
    }

    pub fn start(&self) {
        self.inner.started.send_replace(true);
        let mut driver = lock(&self.inner.driver);
        if driver.is_none() && !self.inner.closed.is_cancelled() {
            let inner = self.inner.clone();
            *driver = Some(tokio::spawn(async move { inner.drive().await }));
        }
    }

    pub fn pause(&self) {
        self.inner.started.send_replace(false);
    }

    /// Drop every task that has not started yet.
    pub fn clear(&self) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.clear();
        self.inner.counts.send_modify(|c| c.waiting = 0);
    }

    /// Tasks waiting to start.
    pub fn size(&self) -> usize {
        self.inner.counts.borrow().waiting
    }

    /// Tasks currently running.
    pub fn pending(&self) -> usize {
        self.inner.counts.borrow().running
    }

    pub fn outstanding(&self) -> usize {
        self.inner.counts.borrow().outstanding()
    }

    /// Resolves once nothing is waiting.
    pub async fn on_empty(&self) {
        let mut rx = self.inner.counts.subscribe();
        // The sender lives in `inner`, so the channel cannot close while we hold `self`.
        rx.wait_for(|c| c.waiting == 0).await.ok();
    }

    /// Resolves once nothing is waiting or running.
    pub async fn on_idle(&self) {
        let mut rx = self.inner.counts.subscribe();
        // Same as `on_empty`: the sender outlives this receiver.
        rx.wait_for(|c| c.outstanding() == 0).await.ok();
    }

    /// Stop the driver and drop waiting tasks. Running tasks finish on their own.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.clear();
        if let Some(driver) = lock(&self.inner.driver).take() {
            driver.abort();
        }
    }
}

impl DispatchInner {
    async fn drive(self: Arc<Self>) {
        let mut started = self.started.subscribe();
        loop {
            tokio::select! {
                ready = started.wait_for(|s| *s) => {
                    if ready.is_err() {
                        return;
                    }
                }
                _ = self.closed.cancelled() => return,
            }

            if lock(&self.tasks).is_empty() {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = self.closed.cancelled() => return,
                }
                continue;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = self.closed.cancelled() => return,
            };
            tokio::select! {
                _ = self.admit() => {}
                _ = self.closed.cancelled() => return,
            }

            let task = {
                let mut tasks = lock(&self.tasks);
                let task = tasks.pop_front();
                if task.is_some() {
                    self.counts.send_modify(|c| {
                        c.waiting = c.waiting.saturating_sub(1);
                        c.running += 1;
                    });
                }
                task
            };
            let Some(task) = task else {
                // cleared while waiting for a slot
                continue;
            };

            let inner = self.clone();
            tokio::spawn(async move {
                task.await;
                drop(permit);
                inner.counts.send_modify(|c| c.running = c.running.saturating_sub(1));
            });
        }
    }

    async fn admit(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                let started = match window.started {
                    Some(started) if now.duration_since(started) < self.interval => started,
                    _ => {
                        window.started = Some(now);
                        window.admitted = 0;
                        now
                    }
                };
                if window.admitted < self.interval_cap {
                    window.admitted += 1;
                    return;
                }
                started + self.interval - now
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_nothing_until_started() {
        let queue = DispatchQueue::new(2, 10, Duration::from_millis(10));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            queue.add(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.size(), 3);

        queue.start();
        queue.on_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let queue = DispatchQueue::new(2, 100, Duration::from_millis(10));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            queue.add(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        queue.start();
        queue.on_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn clear_drops_waiting_tasks() {
        let queue = DispatchQueue::new(1, 10, Duration::from_millis(10));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            queue.add(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.clear();
        assert_eq!(queue.size(), 0);

        queue.start();
        queue.on_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        queue.close();
    }

    #[tokio::test]
    async fn rate_limits_admissions() {
        let queue = DispatchQueue::new(10, 2, Duration::from_millis(100));
        let started = Instant::now();
        for _ in 0..5 {
            queue.add(async {});
        }
        queue.start();
        queue.on_idle().await;
        // 5 tasks at 2 per window need at least two full windows
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn waiters_return_once_closed() {
        let queue = DispatchQueue::new(1, 10, Duration::from_millis(10));
        tokio::time::timeout(Duration::from_millis(50), queue.on_idle())
            .await
            .expect("empty queue is already idle");

        for _ in 0..3 {
            queue.add(async {});
        }
        let waiter = queue.clone();
        let empty = tokio::spawn(async move { waiter.on_empty().await });
        queue.close();
        tokio::time::timeout(Duration::from_millis(200), empty)
            .await
            .expect("on_empty should resolve after close")
            .unwrap();
        tokio::time::timeout(Duration::from_millis(200), queue.on_idle())
            .await
            .expect("on_idle should resolve after close");
    }
}
