//! `CoreContext` threads every component through explicitly instead of
//! reaching for module-level singletons. A test builds its own
//! `CoreContext` out of fakes; the server binary builds one out of the
//! real sync bridge and task registry at startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::dispatch::{DispatcherConfig, TaskDispatcher};
use crate::governance::facade::AutonomyFacade;
use crate::housekeeping::{self, HousekeepingConfig};
use crate::registry::ExperimentRegistry;
use crate::sync::SyncBridge;
use crate::task::TaskRegistry;
use crate::ticker::{self, TickerConfig};

/// Top-level configuration for assembling a [`CoreContext`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub worker_pool_width: usize,
    pub ticker_interval: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_pool_width: 5,
            ticker_interval: Duration::from_secs(5),
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

/// Owns every long-lived component of the agent core and the background
/// tasks (metrics ticker, housekeeping sweep) that run against them.
/// Dropping the `shutdown` token stops the background tasks; dropping the
/// `CoreContext` itself drops every component.
pub struct CoreContext {
    pub registry: Arc<ExperimentRegistry>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub governance: Arc<AutonomyFacade>,
    pub sync: Arc<dyn SyncBridge>,
    shutdown: CancellationToken,
}

impl CoreContext {
    /// Build a context, restore whatever state the sync bridge has on
    /// file from a previous run, and spawn its background tickers.
    /// `tasks` is the fully populated task capability registry; it is
    /// never mutated after this call.
    ///
    /// Cold-start recovery order matters: experiments and notifications
    /// are restored first since they have no cross-references, then
    /// pending approvals (which may reference a notification id), then
    /// the expiry sweep runs once against the now-complete picture so any
    /// approval that lapsed while the agent was down resolves
    /// immediately rather than sitting stale.
    pub async fn build(config: CoreConfig, tasks: TaskRegistry, sync: Arc<dyn SyncBridge>) -> Self {
        let governance = AutonomyFacade::with_defaults(sync.clone());
        let registry = Arc::new(ExperimentRegistry::new(governance.clone(), sync.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            DispatcherConfig {
                worker_pool_width: config.worker_pool_width,
            },
            registry.clone(),
            Arc::new(tasks),
        ));

        match sync.restore_experiments().await {
            Ok(experiments) => {
                for experiment in experiments {
                    registry.restore(experiment).await;
                }
            }
            Err(err) => warn!(error = %err, "failed to restore experiments from sync bridge"),
        }

        match sync.restore_notifications().await {
            Ok(notifications) => {
                for notification in notifications {
                    governance.notifications.restore(notification).await;
                }
            }
            Err(err) => warn!(error = %err, "failed to restore notifications from sync bridge"),
        }

        match sync.restore_pending_approvals().await {
            Ok(approvals) => {
                for approval in approvals {
                    governance.restore_approval(approval).await;
                }
            }
            Err(err) => warn!(error = %err, "failed to restore pending approvals from sync bridge"),
        }

        governance.sweep_expired(Utc::now()).await;

        let shutdown = CancellationToken::new();

        tokio::spawn(ticker::run_ticker(
            registry.clone(),
            TickerConfig {
                interval: config.ticker_interval,
            },
            shutdown.clone(),
        ));
        tokio::spawn(housekeeping::run_housekeeping(
            governance.clone(),
            HousekeepingConfig {
                sweep_interval: config.housekeeping_interval,
            },
            shutdown.clone(),
        ));

        Self {
            registry,
            dispatcher,
            governance,
            sync,
            shutdown,
        }
    }

    /// Signal the background tickers to stop. Does not wait for them to
    /// actually exit; callers that need that guarantee should pair this
    /// with a small grace period before process exit.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NullSyncBridge;

    #[tokio::test]
    async fn build_wires_up_a_usable_context() {
        let ctx = CoreContext::build(CoreConfig::default(), TaskRegistry::new(), Arc::new(NullSyncBridge)).await;
        assert_eq!(ctx.dispatcher.worker_pool_width(), 5);
        ctx.shutdown();
    }
}
