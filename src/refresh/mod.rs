//! Background credential refresh.

mod retry;

pub use retry::StartupRetry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Result of one refresh pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The installed pool's credential is still good.
    Unchanged,
    /// A new pool was installed under this generation.
    Rotated { generation: u64 },
    /// Another caller already replaced the failing pool.
    AlreadyRecovered { generation: u64 },
}

/// Something the scheduler can refresh.
#[async_trait]
pub trait Refreshable: Send + Sync + 'static {
    /// Make sure the installed credential stays valid for at least `horizon`.
    async fn refresh(&self, horizon: Duration) -> Result<RefreshOutcome>;
}

/// Fixed-interval refresh loop.
///
/// The first tick fires one period after spawning. Ticks never overlap: a refresh that
/// overruns its period causes the missed ticks to be skipped. Failures are logged and
/// retried at the next tick. The loop ends when the scheduler is stopped or dropped, or
/// when the target reports that it has shut down.
pub struct RefreshScheduler {
    period: Duration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RefreshScheduler {
    /// Spawn the loop on the current runtime. `period` must be non-zero.
    pub fn spawn(target: Arc<dyn Refreshable>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(target, period, cancel.clone()));
        tracing::debug!(period_secs = period.as_secs(), "Refresh scheduler started");
        Self {
            period,
            cancel,
            task,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel and wait for an in-progress refresh to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await
            && e.is_panic()
        {
            tracing::error!("Refresh scheduler panicked: {}", e);
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("period", &self.period)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run(target: Arc<dyn Refreshable>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match target.refresh(period).await {
            Ok(RefreshOutcome::Unchanged) => {
                tracing::debug!("Scheduled refresh: credential still valid");
            }
            Ok(RefreshOutcome::Rotated { generation }) => {
                tracing::info!(generation, "Scheduled refresh rotated the pool");
            }
            Ok(RefreshOutcome::AlreadyRecovered { generation }) => {
                tracing::debug!(generation, "Scheduled refresh found a newer pool");
            }
            Err(Error::ShutDown) => break,
            Err(e) => {
                tracing::warn!(
                    category = ?e.category(),
                    "Scheduled refresh failed, keeping current pool: {}",
                    e
                );
            }
        }
    }
    tracing::debug!("Refresh scheduler stopped");
}
