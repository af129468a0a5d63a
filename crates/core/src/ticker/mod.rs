//! Cancellable fixed-rate loop shared by playback and animations.

use std::{future::Future, ops::ControlFlow, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Calls a handler once per interval until the handler breaks or the
/// ticker is stopped. Ticks missed while the handler runs long are skipped
/// rather than replayed in a burst.
#[derive(Debug, Clone)]
pub struct PeriodicTicker {
    interval: Duration,
    token: CancellationToken,
}

impl PeriodicTicker {
    pub fn new(interval: Duration) -> Self {
        Self::with_token(interval, CancellationToken::new())
    }

    /// Uses `token` so a parent can stop several tickers at once.
    pub fn with_token(interval: Duration, token: CancellationToken) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            token,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Ends the loop before its next tick.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs until stopped or `on_tick` returns `ControlFlow::Break`. The
    /// handler receives the tick number, starting at 0 on the first
    /// (immediate) tick.
    pub async fn run<F, Fut>(&self, mut on_tick: F)
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = ControlFlow<()>>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let flow = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                flow = on_tick(tick) => flow,
            };
            if flow.is_break() {
                break;
            }
            tick += 1;
        }
        tracing::trace!(ticks = tick, "ticker finished");
    }

    /// [`PeriodicTicker::run`] on a new task.
    pub fn spawn<F, Fut>(&self, on_tick: F) -> JoinHandle<()>
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let ticker = self.clone();
        tokio::spawn(async move { ticker.run(on_tick).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let ticker = PeriodicTicker::new(Duration::from_millis(20));
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let handle = ticker.spawn(move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(Duration::from_millis(110)).await;
        ticker.stop();
        handle.await.unwrap();

        // Ticks at 0, 20, 40, 60, 80, 100.
        assert_eq!(count.load(Ordering::SeqCst), 6);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_can_end_the_loop() {
        let ticker = PeriodicTicker::new(Duration::from_millis(10));
        let mut last = 0;
        ticker
            .run(|tick| {
                last = tick;
                async move {
                    if tick == 3 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            })
            .await;
        assert_eq!(last, 3);
        assert!(!ticker.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_before_start_never_ticks() {
        let ticker = PeriodicTicker::new(Duration::from_millis(10));
        ticker.stop();
        let mut ticks = 0;
        ticker
            .run(|_| {
                ticks += 1;
                async { ControlFlow::Continue(()) }
            })
            .await;
        assert_eq!(ticks, 0);
    }
}
