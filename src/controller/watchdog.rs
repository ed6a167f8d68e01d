use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// A single re-armable timer task.
#[derive(Debug, Default)]
pub struct Watchdog {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `on_fire` after `after` unless cleared first. Replaces any armed timer.
    pub fn arm<F>(&self, after: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire.await;
        });
        if let Some(previous) = self.slot().replace(task) {
            previous.abort();
        }
    }

    /// Call `tick` every `every` until it returns false or the watchdog is cleared.
    pub fn arm_interval<F, Fut>(&self, every: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            loop {
                ticker.tick().await;
                if !tick().await {
                    break;
                }
            }
        });
        if let Some(previous) = self.slot().replace(task) {
            previous.abort();
        }
    }

    pub fn clear(&self) {
        if let Some(task) = self.slot().take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot().as_ref().is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_once_unless_cleared() {
        let fired = Arc::new(AtomicUsize::new(0));
        let watchdog = Watchdog::new();

        let counter = fired.clone();
        watchdog.arm(Duration::from_millis(20), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(watchdog.is_armed());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());

        let counter = fired.clone();
        watchdog.arm(Duration::from_millis(20), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        watchdog.clear();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interval_stops_when_tick_returns_false() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let watchdog = Watchdog::new();

        let counter = ticks.clone();
        watchdog.arm_interval(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
