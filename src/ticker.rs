//! Cancellable periodic timer shared by every supervisory loop
//!
//! Readiness polling, liveness probing, resource sampling and the store
//! expiry sweeper all run on a [`Ticker`], so one `CancellationToken`
//! cancel ends any of them at the next await point.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Ticker {
    interval: Interval,
    token: CancellationToken,
}

impl Ticker {
    /// First tick fires one `period` from now
    pub fn new(period: Duration, token: CancellationToken) -> Self {
        Self::starting_at(Instant::now() + period, period, token)
    }

    /// First tick fires immediately
    pub fn immediate(period: Duration, token: CancellationToken) -> Self {
        Self::starting_at(Instant::now(), period, token)
    }

    fn starting_at(start: Instant, period: Duration, token: CancellationToken) -> Self {
        let mut interval = time::interval_at(start, period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, token }
    }

    /// Wait for the next tick; false once the token is cancelled
    pub async fn tick(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Sleep for `delay` unless cancelled first; true if the full delay elapsed
pub async fn sleep_unless_cancelled(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = time::sleep(delay) => true,
    }
}

/// Run `task` every `period` until `token` is cancelled
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = Ticker::new(period, token);
        while ticker.tick().await {
            task().await;
        }
        debug!(task = name, "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_immediate_first_tick() {
        let mut ticker = Ticker::immediate(Duration::from_secs(60), CancellationToken::new());
        let started = std::time::Instant::now();
        assert!(ticker.tick().await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_stops_ticker() {
        let token = CancellationToken::new();
        let mut ticker = Ticker::new(Duration::from_secs(60), token.clone());
        token.cancel();
        assert!(!ticker.tick().await);
    }

    #[tokio::test]
    async fn test_spawn_periodic_runs_until_cancelled() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let handle = spawn_periodic("counter", Duration::from_millis(10), token.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        token.cancel();
        handle.await.unwrap();

        let runs = count.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected several runs, got {}", runs);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_sleep_unless_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_unless_cancelled(Duration::from_millis(5), &token).await);
        token.cancel();
        assert!(!sleep_unless_cancelled(Duration::from_secs(60), &token).await);
    }
}
