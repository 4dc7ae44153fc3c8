//! Housekeeping ticker: periodically sweeps expired approval requests so
//! that a request nobody ever resolves still eventually dispatches its
//! continuation as `Expired` instead of sitting parked forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::governance::facade::AutonomyFacade;

#[derive(Debug, Clone, Copy)]
pub struct HousekeepingConfig {
    pub sweep_interval: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Runs until `shutdown` fires, sweeping expired approvals on
/// `config.sweep_interval`.
pub async fn run_housekeeping(
    facade: Arc<AutonomyFacade>,
    config: HousekeepingConfig,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("housekeeping ticker shutting down");
                return;
            }
            _ = interval.tick() => {
                let expired = facade.sweep_expired(Utc::now()).await;
                if expired > 0 {
                    debug!(count = expired, "swept expired approval requests");
                }
            }
        }
    }
}
