use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::errors::OnboardingError;
use super::orchestrator::Orchestrator;
use super::types::ExecutionId;
use crate::config::WatchdogConfig;
use crate::shutdown::wait_for_shutdown;

/// Timeout firer.
///
/// Deadlines live in the persisted executions, so a fresh watchdog after a
/// restart picks up exactly where the previous process left off. Firing is
/// idempotent; overlapping sweeps from several instances are harmless.
pub struct TimeoutWatchdog {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl TimeoutWatchdog {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &WatchdogConfig) -> Self {
        Self {
            orchestrator,
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    pub async fn sweep_once(&self) -> Result<Vec<ExecutionId>, OnboardingError> {
        self.orchestrator.expire_overdue().await
    }

    /// Sweep on every tick until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Timeout watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Timeout sweep failed");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        info!("Timeout watchdog stopped");
    }
}
