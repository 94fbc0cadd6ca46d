//! Background idle reaper.
//!
//! Every `check_interval` it asks the manager to evict models that have had
//! no references for `idle_timeout`. Sweeps never overlap: each one is awaited
//! before the next tick is taken, and ticks missed meanwhile are skipped.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::model_manager::ModelManager;

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// Zero disables reaping.
    pub idle_timeout: Duration,
    pub check_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Anything that can evict idle entries.
pub trait Sweep: Clone + Send + Sync + 'static {
    fn sweep(&self, idle_timeout: Duration) -> impl Future<Output = Vec<String>> + Send;
}

impl Sweep for ModelManager {
    fn sweep(&self, idle_timeout: Duration) -> impl Future<Output = Vec<String>> + Send {
        ModelManager::sweep(self, idle_timeout)
    }
}

pub struct IdleReaper;

impl IdleReaper {
    pub fn spawn<S: Sweep>(
        target: S,
        config: ReaperConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(run(target, config, shutdown))
    }
}

async fn run<S: Sweep>(target: S, config: ReaperConfig, shutdown: CancellationToken) {
    if config.idle_timeout.is_zero() {
        info!("Idle reaper disabled (idle timeout is 0)");
        return;
    }
    let period = config.check_interval.max(Duration::from_millis(10));
    info!(
        idle_timeout = ?config.idle_timeout,
        check_interval = ?period,
        "Idle reaper started"
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sweeper = target.clone();
        let idle_timeout = config.idle_timeout;
        match tokio::spawn(async move { sweeper.sweep(idle_timeout).await }).await {
            Ok(evicted) if evicted.is_empty() => debug!("Idle sweep: nothing to evict"),
            Ok(evicted) => info!(count = evicted.len(), models = ?evicted, "Idle sweep evicted models"),
            Err(e) => error!(error = %e, "Idle sweep failed; will retry next tick"),
        }
    }

    info!("Idle reaper stopped");
}
