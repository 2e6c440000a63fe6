//! Restart-with-backoff supervision for the long-lived ingestion tasks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A run that survived this long resets the backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(30);

/// One supervised unit of work. `run_once` is expected to run for a long
/// time; returning an error (or at all, before shutdown) gets it restarted.
#[async_trait]
pub trait Supervised: Send {
    fn name(&self) -> &str;
    async fn run_once(&mut self, shutdown: &CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the next delay and doubles it, capped at `max`.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Runs the task until shutdown, restarting it after failures with an
/// exponentially growing delay.
pub fn spawn(mut task: impl Supervised + 'static, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let started = Instant::now();
            if let Err(err) = task.run_once(&shutdown).await {
                if shutdown.is_cancelled() {
                    return;
                }
                error!(
                    task = task.name(),
                    error = format!("{err:#}"),
                    "task failed (will be restarted)"
                );
            }
            if shutdown.is_cancelled() {
                return;
            }
            if started.elapsed() >= HEALTHY_RUN {
                backoff.reset();
            }
            let delay = backoff.next();
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    })
}
