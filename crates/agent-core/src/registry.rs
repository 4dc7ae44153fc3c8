//! Experiment Registry: the sole writer of every experiment record and
//! the owner of the lifecycle state machine. `start` is gated through an
//! [`AutonomyGate`]; everything else (create/stop/get/list) is
//! unconditional, matching the decision matrix's own defaults for those
//! actions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::experiment::{metric_keys, Experiment, ExperimentDefinition, ExperimentId, ExperimentState};
use crate::governance::facade::{ActionResult, AutonomyGate};
use crate::governance::Context;
use crate::sync::SyncBridge;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("experiment {0} not found")]
    NotFound(ExperimentId),
    #[error("invalid transition for experiment {id}: {from} -> {to}")]
    InvalidTransition {
        id: ExperimentId,
        from: ExperimentState,
        to: ExperimentState,
    },
    #[error("experiment kind {0:?} is not registered")]
    UnknownKind(String),
    #[error("start was not granted autonomously: {0}")]
    StartNotAutonomous(String),
}

/// Whether a transition between two lifecycle states is allowed. Terminal
/// states are absorbing: nothing leaves `Completed`, `Failed`, or
/// `Stopped`.
fn is_valid_transition(from: ExperimentState, to: ExperimentState) -> bool {
    use ExperimentState::*;
    matches!(
        (from, to),
        (Defined, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Stopped)
            | (Defined, Stopped)
    )
}

struct Inner {
    experiments: HashMap<ExperimentId, Experiment>,
}

/// Owns every experiment record. Mutations go through a single `Mutex`,
/// so there is no interleaving between (for instance) two concurrent
/// `start` calls racing the same experiment into `Running` twice.
pub struct ExperimentRegistry {
    inner: tokio::sync::Mutex<Inner>,
    gate: Arc<dyn AutonomyGate>,
    sync: Arc<dyn SyncBridge>,
}

impl ExperimentRegistry {
    pub fn new(gate: Arc<dyn AutonomyGate>, sync: Arc<dyn SyncBridge>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner {
                experiments: HashMap::new(),
            }),
            gate,
            sync,
        }
    }

    pub async fn create(&self, definition: ExperimentDefinition) -> Experiment {
        let experiment = Experiment::new(Uuid::new_v4(), definition, Utc::now());
        self.inner
            .lock()
            .await
            .experiments
            .insert(experiment.id, experiment.clone());

        let sync = self.sync.clone();
        let to_sync = experiment.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.sync_experiment(&to_sync).await {
                warn!(experiment_id = %to_sync.id, error = %err, "failed to sync new experiment");
            }
        });

        info!(experiment_id = %experiment.id, kind = %experiment.kind, "experiment created");
        experiment
    }

    pub async fn get(&self, id: ExperimentId) -> Option<Experiment> {
        self.inner.lock().await.experiments.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Experiment> {
        let mut all: Vec<_> = self.inner.lock().await.experiments.values().cloned().collect();
        all.sort_by_key(|e| e.last_update_time);
        all
    }

    async fn transition(
        &self,
        id: ExperimentId,
        to: ExperimentState,
        status_message: impl Into<String>,
    ) -> Result<Experiment, RegistryError> {
        let mut inner = self.inner.lock().await;
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;

        if !is_valid_transition(experiment.state, to) {
            return Err(RegistryError::InvalidTransition {
                id,
                from: experiment.state,
                to,
            });
        }

        experiment.state = to;
        experiment.status_message = status_message.into();
        experiment.last_update_time = Utc::now();
        if to == ExperimentState::Running {
            experiment.start_time = Some(experiment.last_update_time);
        }
        if to == ExperimentState::Completed {
            experiment
                .metrics
                .insert(metric_keys::PROGRESS_PERCENT.to_string(), 100.0.into());
            experiment
                .metrics
                .insert(metric_keys::ESTIMATED_REMAINING_SECONDS.to_string(), 0.0.into());
        }
        let updated = experiment.clone();
        drop(inner);

        let sync = self.sync.clone();
        let to_sync = updated.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.sync_experiment(&to_sync).await {
                warn!(experiment_id = %to_sync.id, error = %err, "failed to sync experiment transition");
            }
        });

        Ok(updated)
    }

    /// Request that an experiment move from `Defined` to `Running`. Gated
    /// through the autonomy facade: a `Prohibited` verdict rejects the
    /// call outright with no state change and no continuation ever runs.
    /// An `ApprovalRequired` verdict leaves the experiment in `Defined`
    /// until a human resolves the parked approval, at which point the
    /// continuation (captured here) performs the actual transition and
    /// hands the dispatcher handle to the caller via `on_running`.
    pub async fn start(
        registry: &Arc<Self>,
        id: ExperimentId,
        context: Context,
        on_running: impl Fn(ExperimentId) + Send + Sync + 'static,
    ) -> Result<ActionResult, RegistryError> {
        let experiment = registry.get(id).await.ok_or(RegistryError::NotFound(id))?;

        let gate = registry.gate.clone();
        let registry = registry.clone();
        let execute: crate::governance::facade::ExecuteFn = Box::new(move |outcome| {
            Box::pin(async move {
                use crate::governance::approval::ApprovalOutcome;
                match outcome {
                    ApprovalOutcome::Approved => {
                        if let Err(err) = registry.transition(id, ExperimentState::Running, "running").await {
                            warn!(experiment_id = %id, error = %err, "deferred start failed to transition");
                            return;
                        }
                        on_running(id);
                    }
                    ApprovalOutcome::Rejected => {
                        info!(experiment_id = %id, "deferred start rejected by approver");
                    }
                    ApprovalOutcome::Expired => {
                        info!(experiment_id = %id, "deferred start expired unresolved");
                    }
                    ApprovalOutcome::Cancelled => {
                        info!(experiment_id = %id, "deferred start cancelled");
                    }
                }
            })
        });

        let result = gate
            .execute_action(
                &format!("Start experiment {}", experiment.name),
                &experiment.description,
                "experiment_management",
                "start_experiment",
                context,
                None,
                None,
                execute,
            )
            .await;

        Ok(result)
    }

    /// Insert a record fetched from the sync bridge directly, bypassing
    /// `create`'s sync write-back (the record already exists remotely).
    /// Used only during cold-start recovery.
    pub async fn restore(&self, experiment: Experiment) {
        self.inner.lock().await.experiments.insert(experiment.id, experiment);
    }

    pub async fn mark_completed(&self, id: ExperimentId, status_message: impl Into<String>) -> Result<Experiment, RegistryError> {
        self.transition(id, ExperimentState::Completed, status_message).await
    }

    pub async fn mark_failed(&self, id: ExperimentId, status_message: impl Into<String>) -> Result<Experiment, RegistryError> {
        self.transition(id, ExperimentState::Failed, status_message).await
    }

    /// Stop an experiment. Idempotent: stopping an experiment that is
    /// already in a terminal state is a no-op success rather than an
    /// error, so a racing dispatcher completion and an operator's stop
    /// request never fight over who gets to return `Err`.
    pub async fn stop(&self, id: ExperimentId) -> Result<Experiment, RegistryError> {
        let current = self.get(id).await.ok_or(RegistryError::NotFound(id))?;
        if current.state.is_terminal() {
            return Ok(current);
        }
        self.transition(id, ExperimentState::Stopped, "stopped").await
    }

    pub async fn update_metrics(
        &self,
        id: ExperimentId,
        f: impl FnOnce(&mut Experiment),
    ) -> Result<Experiment, RegistryError> {
        let mut inner = self.inner.lock().await;
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        f(experiment);
        experiment.last_update_time = Utc::now();
        let updated = experiment.clone();
        drop(inner);

        let sync = self.sync.clone();
        let metrics = updated.metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.sync_metrics(id, &metrics).await {
                warn!(experiment_id = %id, error = %err, "failed to sync experiment metrics");
            }
        });

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::facade::AutonomyFacade;
    use crate::sync::NullSyncBridge;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn definition() -> ExperimentDefinition {
        ExperimentDefinition {
            kind: "ebook".into(),
            name: "n".into(),
            description: "d".into(),
            parameters: Default::default(),
        }
    }

    fn registry() -> Arc<ExperimentRegistry> {
        let facade = AutonomyFacade::with_defaults(Arc::new(NullSyncBridge));
        Arc::new(ExperimentRegistry::new(facade, Arc::new(NullSyncBridge)))
    }

    #[tokio::test]
    async fn create_then_autonomous_start_transitions_immediately() {
        let registry = registry();
        let experiment = registry.create(definition()).await;

        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        ExperimentRegistry::start(&registry, experiment.id, Context::new(), move |_| {
            called2.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        for _ in 0..50 {
            if called.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let started = registry.get(experiment.id).await.unwrap();
        assert_eq!(started.state, ExperimentState::Running);
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_terminal_state() {
        let registry = registry();
        let experiment = registry.create(definition()).await;
        registry.stop(experiment.id).await.unwrap();
        let second = registry.stop(experiment.id).await.unwrap();
        assert_eq!(second.state, ExperimentState::Stopped);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let registry = registry();
        let experiment = registry.create(definition()).await;
        let err = registry
            .mark_completed(experiment.id, "done")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn prohibited_start_never_transitions() {
        let registry = registry();
        let experiment = registry.create(definition()).await;

        let mut context = Context::new();
        context.insert("amount".into(), serde_json::json!(2000.0));

        let result = ExperimentRegistry::start(&registry, experiment.id, context, |_| {})
            .await
            .unwrap();
        assert!(matches!(result, ActionResult::Prohibited { .. }));

        let still_defined = registry.get(experiment.id).await.unwrap();
        assert_eq!(still_defined.state, ExperimentState::Defined);
    }
}
