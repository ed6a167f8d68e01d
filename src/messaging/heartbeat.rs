use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Periodic ping used to detect a dead peer.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

impl Heartbeat {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Longest silence tolerated from a peer before it is considered gone.
    pub fn liveness_window(&self) -> Duration {
        self.interval + self.timeout
    }

    /// Ping every interval until a ping fails or `cancel` fires.
    ///
    /// Returns true if the peer stopped answering.
    pub async fn run<F, Fut>(&self, mut ping: F, cancel: CancellationToken) -> bool
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = interval.tick() => {
                    if let Err(e) = ping(self.timeout).await {
                        tracing::debug!(error = %e, "Heartbeat ping failed");
                        return true;
                    }
                }
            }
        }
    }
}

/// Random delay between reconnect attempts so clients do not retry in lockstep.
pub fn reconnect_delay(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let delay_ms = rng.gen_range(min_ms..=max_ms.max(min_ms));
    Duration::from_millis(delay_ms)
}
