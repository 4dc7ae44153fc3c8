//! Fakes shared by `agent-core`'s integration tests and `agent-server`'s
//! handler tests: a recording sync bridge and a handful of task
//! capabilities with controllable timing/outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use agent_core::experiment::{Experiment, Metrics, ParameterBag};
use agent_core::governance::approval::{ApprovalRecord, ApprovalStatus};
use agent_core::governance::notification::{Notification, NotificationStatus};
use agent_core::sync::{SyncBridge, SyncError};
use agent_core::task::{ProgressSink, Task, TaskOutcome, TaskOutcomeStatus};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Records every call made to it, for assertions like "exactly one
/// experiment sync happened" or "the bridge never sees an approval
/// before the registry creates one".
#[derive(Default)]
pub struct FakeSyncBridge {
    pub experiments: Mutex<Vec<Experiment>>,
    pub notifications: Mutex<Vec<Notification>>,
    pub approvals: Mutex<Vec<ApprovalRecord>>,
    pub logs: Mutex<Vec<(Uuid, String)>>,
    pub metrics: Mutex<Vec<(Uuid, Metrics)>>,
    pub approval_status_updates: Mutex<Vec<(Uuid, ApprovalStatus)>>,
    pub notification_status_updates: Mutex<Vec<(Uuid, NotificationStatus)>>,
    /// Seed data returned by `restore_*` on cold start. Populate before
    /// handing the bridge to `CoreContext::build` to exercise recovery.
    pub seed_experiments: Mutex<Vec<Experiment>>,
    pub seed_pending_approvals: Mutex<Vec<ApprovalRecord>>,
    pub seed_notifications: Mutex<Vec<Notification>>,
    failures: AtomicU64,
    /// When set, every call returns an error instead of recording. Used
    /// to exercise the "sync resilience under forced bridge failure"
    /// property: local state must keep advancing even when every
    /// replication attempt fails.
    pub force_failure: std::sync::atomic::AtomicBool,
}

impl FakeSyncBridge {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncBridge for FakeSyncBridge {
    async fn sync_experiment(&self, experiment: &Experiment) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.experiments.lock().unwrap().push(experiment.clone());
        Ok(())
    }

    async fn sync_log(&self, experiment_id: Uuid, line: &str) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.logs.lock().unwrap().push((experiment_id, line.to_string()));
        Ok(())
    }

    async fn sync_notification(&self, notification: &Notification) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn sync_approval(&self, approval: &ApprovalRecord) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.approvals.lock().unwrap().push(approval.clone());
        Ok(())
    }

    async fn sync_metrics(&self, experiment_id: Uuid, metrics: &Metrics) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.metrics.lock().unwrap().push((experiment_id, metrics.clone()));
        Ok(())
    }

    async fn update_approval_status(&self, approval_id: Uuid, status: ApprovalStatus) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.approval_status_updates.lock().unwrap().push((approval_id, status));
        Ok(())
    }

    async fn update_notification(&self, notification_id: Uuid, status: NotificationStatus) -> Result<(), SyncError> {
        if self.force_failure.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Transport("forced failure".into()));
        }
        self.notification_status_updates
            .lock()
            .unwrap()
            .push((notification_id, status));
        Ok(())
    }

    async fn restore_experiments(&self) -> Result<Vec<Experiment>, SyncError> {
        Ok(self.seed_experiments.lock().unwrap().clone())
    }

    async fn restore_pending_approvals(&self) -> Result<Vec<ApprovalRecord>, SyncError> {
        Ok(self.seed_pending_approvals.lock().unwrap().clone())
    }

    async fn restore_notifications(&self) -> Result<Vec<Notification>, SyncError> {
        Ok(self.seed_notifications.lock().unwrap().clone())
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Completes immediately with a fixed outcome.
pub struct InstantTask {
    kind: String,
    status: TaskOutcomeStatus,
}

impl InstantTask {
    pub fn succeeding(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: TaskOutcomeStatus::Completed,
        }
    }

    pub fn failing(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: TaskOutcomeStatus::Failed,
        }
    }
}

#[async_trait]
impl Task for InstantTask {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, _params: &ParameterBag, progress: ProgressSink, _cancel: CancellationToken) -> TaskOutcome {
        progress.report(100.0);
        TaskOutcome {
            status: self.status,
            result: None,
            message: Some("instant task finished".into()),
        }
    }
}

/// Reports progress in steps and only finishes once cancelled or once
/// `steps` ticks have elapsed, whichever comes first. Useful for
/// exercising the dispatcher's cancellation handling and the ticker's
/// progress-monotonicity guarantee together.
pub struct SteppedTask {
    kind: String,
    steps: u32,
    step_delay: Duration,
}

impl SteppedTask {
    pub fn new(kind: impl Into<String>, steps: u32, step_delay: Duration) -> Self {
        Self {
            kind: kind.into(),
            steps,
            step_delay,
        }
    }
}

#[async_trait]
impl Task for SteppedTask {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, _params: &ParameterBag, progress: ProgressSink, cancel: CancellationToken) -> TaskOutcome {
        for step in 1..=self.steps {
            if cancel.is_cancelled() {
                return TaskOutcome {
                    status: TaskOutcomeStatus::Failed,
                    result: None,
                    message: Some("cancelled mid-run".into()),
                };
            }
            progress.report((step as f64 / self.steps as f64) * 100.0);
            tokio::select! {
                _ = tokio::time::sleep(self.step_delay) => {}
                _ = cancel.cancelled() => {
                    return TaskOutcome {
                        status: TaskOutcomeStatus::Failed,
                        result: None,
                        message: Some("cancelled mid-run".into()),
                    };
                }
            }
        }
        TaskOutcome {
            status: TaskOutcomeStatus::Completed,
            result: None,
            message: Some("stepped task finished".into()),
        }
    }
}

/// A manually advanceable clock for exercising approval expiry without a
/// real sleep. Not a fake of any core trait; tests that need "time
/// passes" construct `chrono::DateTime` values relative to a fixed
/// origin returned by this struct instead of depending on wall clock
/// time.
pub struct FakeClock {
    origin: chrono::DateTime<chrono::Utc>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { origin: chrono::Utc::now() }
    }

    pub fn at(&self, offset: chrono::Duration) -> chrono::DateTime<chrono::Utc> {
        self.origin + offset
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}
