//! Live progress of an in-flight drain.
//!
//! The engine writes, observers read. Observers have no way to steer the
//! drain through this channel; cancellation travels on its own token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::drain::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainProgress {
    pub time_elapsed_ms: u64,
    pub strategy: Strategy,
    pub poll_count: u32,
}

impl Default for DrainProgress {
    fn default() -> Self {
        Self {
            time_elapsed_ms: 0,
            strategy: Strategy::StatusCheck,
            poll_count: 0,
        }
    }
}

/// Read side of the progress channel.
pub type ProgressWatch = watch::Receiver<DrainProgress>;

/// Write side of the progress channel, owned by one drain call.
pub struct ProgressReporter {
    tx: Arc<watch::Sender<DrainProgress>>,
    started: Instant,
}

impl ProgressReporter {
    pub fn channel() -> (Self, ProgressWatch) {
        let (tx, rx) = watch::channel(DrainProgress::default());
        (
            Self {
                tx: Arc::new(tx),
                started: Instant::now(),
            },
            rx,
        )
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Resets the clock and starts refreshing the elapsed time every `every`
    /// until the returned guard is dropped.
    pub(crate) fn start(&mut self, started: Instant, every: Duration) -> TickerGuard {
        self.started = started;
        let tx = Arc::clone(&self.tx);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                publish(&tx, started, |_| {});
            }
        });
        TickerGuard(handle)
    }

    pub(crate) fn report(&self, strategy: Strategy, poll_count: u32) {
        publish(&self.tx, self.started, |p| {
            p.strategy = strategy;
            p.poll_count = poll_count;
        });
    }
}

fn publish(tx: &watch::Sender<DrainProgress>, started: Instant, update: impl FnOnce(&mut DrainProgress)) {
    // elapsed is read under the channel lock, so concurrent writers cannot
    // publish it out of order
    tx.send_modify(|p| {
        let elapsed = started.elapsed().as_millis() as u64;
        p.time_elapsed_ms = p.time_elapsed_ms.max(elapsed);
        update(p);
    });
}

/// Stops the elapsed-time ticker when dropped.
pub(crate) struct TickerGuard(JoinHandle<()>);

impl Drop for TickerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticker_advances_elapsed_time() {
        let (mut reporter, rx) = ProgressReporter::channel();
        let guard = reporter.start(Instant::now(), Duration::from_millis(250));
        reporter.report(Strategy::LongPoll, 3);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let progress = *rx.borrow();
        assert_eq!(progress.strategy, Strategy::LongPoll);
        assert_eq!(progress.poll_count, 3);
        assert!(progress.time_elapsed_ms >= 1_000);

        drop(guard);
        let frozen = rx.borrow().time_elapsed_ms;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.borrow().time_elapsed_ms, frozen);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(DrainProgress {
            time_elapsed_ms: 1500,
            strategy: Strategy::LongPoll,
            poll_count: 2,
        })
        .unwrap();

        assert_eq!(json, serde_json::json!({"timeElapsedMs": 1500, "strategy": "long-poll", "pollCount": 2}));
    }
}
