//! Task Dispatcher: a bounded worker pool that runs one [`Task`] per
//! running experiment, reports completion back to the registry, and
//! tracks a cancellation handle per experiment so `stop` can request a
//! cooperative shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::experiment::{metric_keys, ExperimentId, MetricValue, ParameterBag};
use crate::registry::ExperimentRegistry;
use crate::task::{ProgressSink, Task, TaskOutcome, TaskOutcomeStatus, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum number of tasks running concurrently.
    pub worker_pool_width: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { worker_pool_width: 5 }
    }
}

struct Completion {
    experiment_id: ExperimentId,
    outcome: TaskOutcome,
}

/// Owns the concurrency limit and the set of cancellation handles for
/// currently running experiments. Submitting a task that exceeds the
/// pool width simply waits for a permit; it does not queue rejections.
pub struct TaskDispatcher {
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
    cancellations: tokio::sync::Mutex<HashMap<ExperimentId, CancellationToken>>,
    registry: Arc<ExperimentRegistry>,
    tasks: Arc<TaskRegistry>,
}

impl TaskDispatcher {
    pub fn new(config: DispatcherConfig, registry: Arc<ExperimentRegistry>, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.worker_pool_width)),
            config,
            cancellations: tokio::sync::Mutex::new(HashMap::new()),
            registry,
            tasks,
        }
    }

    pub fn worker_pool_width(&self) -> usize {
        self.config.worker_pool_width
    }

    pub async fn active_count(&self) -> usize {
        self.cancellations.lock().await.len()
    }

    /// Spawn the task for `experiment_id` once a permit is available.
    /// Reported completion discards itself if the experiment has already
    /// left `Running` (e.g. it was stopped while the task was finishing),
    /// matching the requirement that late task results never resurrect a
    /// stopped experiment.
    pub async fn submit(
        dispatcher: &Arc<Self>,
        experiment_id: ExperimentId,
        kind: String,
        params: ParameterBag,
    ) -> Result<(), DispatchError> {
        if !dispatcher.tasks.is_known_kind(&kind) {
            return Err(DispatchError::UnknownKind(kind));
        }

        let cancel = CancellationToken::new();
        dispatcher.cancellations.lock().await.insert(experiment_id, cancel.clone());

        let semaphore = dispatcher.semaphore.clone();
        let registry = dispatcher.registry.clone();
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let (progress, mut progress_rx) = ProgressSink::new();
            let experiment_id_for_progress = experiment_id;
            let registry_for_progress = registry.clone();
            let progress_task = tokio::spawn(async move {
                while progress_rx.changed().await.is_ok() {
                    let value = *progress_rx.borrow();
                    let _ = registry_for_progress
                        .update_metrics(experiment_id_for_progress, |experiment| {
                            let current = experiment
                                .metrics
                                .get(crate::experiment::metric_keys::PROGRESS_PERCENT)
                                .and_then(|m| m.as_f64())
                                .unwrap_or(0.0);
                            // Progress only ever moves forward: a task's own
                            // report is never allowed to regress a value the
                            // ticker or an earlier report already published.
                            let next = value.max(current);
                            experiment.metrics.insert(
                                crate::experiment::metric_keys::PROGRESS_PERCENT.to_string(),
                                next.into(),
                            );
                        })
                        .await;
                }
            });

            let outcome = match dispatcher.tasks.get(&kind) {
                Some(task) => task.execute(&params, progress, cancel.clone()).await,
                None => TaskOutcome {
                    status: TaskOutcomeStatus::Failed,
                    result: None,
                    message: Some(format!("task kind {kind:?} vanished from registry")),
                },
            };

            progress_task.abort();
            drop(permit);
            dispatcher.complete(Completion { experiment_id, outcome }).await;
        });

        Ok(())
    }

    /// Request cooperative cancellation for a running experiment. Has no
    /// effect if the experiment is not currently tracked (already
    /// finished, or never submitted).
    pub async fn cancel(&self, experiment_id: ExperimentId) {
        if let Some(token) = self.cancellations.lock().await.get(&experiment_id) {
            token.cancel();
        }
    }

    async fn complete(&self, completion: Completion) {
        self.cancellations.lock().await.remove(&completion.experiment_id);

        let current = match self.registry.get(completion.experiment_id).await {
            Some(e) => e,
            None => return,
        };
        if current.state.is_terminal() {
            info!(
                experiment_id = %completion.experiment_id,
                state = %current.state,
                "discarding task completion for experiment no longer running"
            );
            return;
        }

        if let Some(fields) = completion.outcome.result.clone() {
            let flattened: Vec<(String, MetricValue)> = fields
                .into_iter()
                .filter_map(|(key, value)| scalar_metric(value).map(|v| (format!("{}{key}", metric_keys::RESULT_PREFIX), v)))
                .collect();
            if !flattened.is_empty() {
                let _ = self
                    .registry
                    .update_metrics(completion.experiment_id, move |experiment| {
                        for (key, value) in flattened {
                            experiment.metrics.insert(key, value);
                        }
                    })
                    .await;
            }
        }

        let result = match completion.outcome.status {
            TaskOutcomeStatus::Completed => {
                self.registry
                    .mark_completed(
                        completion.experiment_id,
                        completion.outcome.message.unwrap_or_else(|| "completed".to_string()),
                    )
                    .await
            }
            TaskOutcomeStatus::Failed => {
                self.registry
                    .mark_failed(
                        completion.experiment_id,
                        completion.outcome.message.unwrap_or_else(|| "failed".to_string()),
                    )
                    .await
            }
        };

        if let Err(err) = result {
            warn!(experiment_id = %completion.experiment_id, error = %err, "failed to record task completion");
        }
    }
}

/// Convert a task result field to a metric value. Only scalar shapes
/// survive the flattening; nested objects and arrays are dropped.
fn scalar_metric(value: serde_json::Value) -> Option<MetricValue> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(MetricValue::Number),
        serde_json::Value::String(s) => Some(MetricValue::Text(s)),
        serde_json::Value::Bool(b) => Some(MetricValue::Bool(b)),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no task capability registered for kind {0:?}")]
    UnknownKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentDefinition;
    use crate::governance::facade::AutonomyFacade;
    use crate::sync::NullSyncBridge;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct InstantTask;

    #[async_trait]
    impl Task for InstantTask {
        fn kind(&self) -> &str {
            "instant"
        }

        async fn execute(
            &self,
            _params: &ParameterBag,
            progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> TaskOutcome {
            progress.report(100.0);
            TaskOutcome {
                status: TaskOutcomeStatus::Completed,
                result: None,
                message: Some("done".into()),
            }
        }
    }

    struct BlockingTask {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Task for BlockingTask {
        fn kind(&self) -> &str {
            "blocking"
        }

        async fn execute(
            &self,
            _params: &ParameterBag,
            _progress: ProgressSink,
            cancel: CancellationToken,
        ) -> TaskOutcome {
            cancel.cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            TaskOutcome {
                status: TaskOutcomeStatus::Failed,
                result: None,
                message: Some("cancelled".into()),
            }
        }
    }

    async fn harness(width: usize) -> (Arc<ExperimentRegistry>, Arc<TaskDispatcher>) {
        let facade = AutonomyFacade::with_defaults(Arc::new(NullSyncBridge));
        let registry = Arc::new(ExperimentRegistry::new(facade, Arc::new(NullSyncBridge)));
        let mut tasks = TaskRegistry::new();
        tasks.register(InstantTask);
        tasks.register(BlockingTask {
            cancelled: Arc::new(AtomicBool::new(false)),
        });
        let dispatcher = Arc::new(TaskDispatcher::new(
            DispatcherConfig { worker_pool_width: width },
            registry.clone(),
            Arc::new(tasks),
        ));
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let (_registry, dispatcher) = harness(5).await;
        let err = TaskDispatcher::submit(&dispatcher, uuid::Uuid::new_v4(), "nope".into(), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn completion_marks_experiment_completed() {
        let (registry, dispatcher) = harness(5).await;
        let experiment = registry
            .create(ExperimentDefinition {
                kind: "instant".into(),
                name: "n".into(),
                description: "d".into(),
                parameters: Default::default(),
            })
            .await;
        registry.update_metrics(experiment.id, |e| e.state = crate::experiment::ExperimentState::Running).await.unwrap();

        TaskDispatcher::submit(&dispatcher, experiment.id, "instant".into(), Default::default())
            .await
            .unwrap();

        for _ in 0..100 {
            let current = registry.get(experiment.id).await.unwrap();
            if current.state == crate::experiment::ExperimentState::Completed {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("experiment never reached Completed");
    }

    #[tokio::test]
    async fn late_completion_is_discarded_for_stopped_experiment() {
        let (registry, dispatcher) = harness(5).await;
        let experiment = registry
            .create(ExperimentDefinition {
                kind: "instant".into(),
                name: "n".into(),
                description: "d".into(),
                parameters: Default::default(),
            })
            .await;
        registry.update_metrics(experiment.id, |e| e.state = crate::experiment::ExperimentState::Running).await.unwrap();
        registry.stop(experiment.id).await.unwrap();

        dispatcher.complete(Completion {
            experiment_id: experiment.id,
            outcome: TaskOutcome {
                status: TaskOutcomeStatus::Completed,
                result: None,
                message: None,
            },
        }).await;

        let current = registry.get(experiment.id).await.unwrap();
        assert_eq!(current.state, crate::experiment::ExperimentState::Stopped);
    }
}
