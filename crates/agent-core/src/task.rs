//! The `Task` trait -- the adapter interface for opaque experiment
//! capabilities (ebook generator, writing assistant, affiliate-site
//! planner, Pinterest planner, ...).
//!
//! Each concrete task kind implements this trait and registers itself with
//! a [`TaskRegistry`] at startup. The core never links against a task's
//! internals; it only ever holds `Box<dyn Task>`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::experiment::ParameterBag;

/// Outcome reported by a task capability when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskOutcomeStatus,
    pub result: Option<HashMap<String, serde_json::Value>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcomeStatus {
    Completed,
    Failed,
}

/// A channel a task may use to publish real progress. When present, the
/// ticker prefers the task's reported value over its own synthesized
/// estimate (see `agent_core::ticker`), but never regresses below a value
/// it has already published.
#[derive(Clone)]
pub struct ProgressSink {
    tx: tokio::sync::watch::Sender<f64>,
}

impl ProgressSink {
    pub fn new() -> (Self, tokio::sync::watch::Receiver<f64>) {
        let (tx, rx) = tokio::sync::watch::channel(0.0);
        (Self { tx }, rx)
    }

    /// Report progress as a percentage in `[0, 100]`. Values outside the
    /// range are clamped.
    pub fn report(&self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0);
        // A closed receiver just means nobody is listening anymore; that is
        // not an error condition for the task.
        let _ = self.tx.send(clamped);
    }
}

/// Adapter interface for an opaque experiment capability.
///
/// Implementors wrap a specific kind of background job (an ebook
/// generator, a writing assistant, ...) and run it to completion or
/// cancellation.
///
/// # Object safety
///
/// This trait is object-safe so it can be stored as `Box<dyn Task>` in
/// [`TaskRegistry`].
#[async_trait]
pub trait Task: Send + Sync {
    /// The experiment kind this task implements (e.g. `"ebook"`).
    fn kind(&self) -> &str;

    /// Run the task to completion.
    ///
    /// `params` is the experiment's parameter bag. `progress` may be used
    /// to publish real progress as the task runs; a task that never calls
    /// it simply falls back to the ticker's synthesized estimate.
    /// `cancel` resolves when the dispatcher has requested cancellation;
    /// implementations are expected to wind down promptly but are not
    /// required to observe it (cancellation is cooperative, not forced).
    async fn execute(
        &self,
        params: &ParameterBag,
        progress: ProgressSink,
        cancel: tokio_util::sync::CancellationToken,
    ) -> TaskOutcome;
}

/// A named collection of registered [`Task`] capabilities, keyed by
/// experiment kind.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Box<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task capability. Replaces any existing capability for
    /// the same kind and returns it.
    pub fn register(&mut self, task: impl Task + 'static) -> Option<Box<dyn Task>> {
        let kind = task.kind().to_string();
        self.tasks.insert(kind, Box::new(task))
    }

    pub fn get(&self, kind: &str) -> Option<&dyn Task> {
        self.tasks.get(kind).map(|b| b.as_ref())
    }

    pub fn is_known_kind(&self, kind: &str) -> bool {
        self.tasks.contains_key(kind)
    }

    pub fn list(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTask {
        kind: String,
    }

    #[async_trait]
    impl Task for NoopTask {
        fn kind(&self) -> &str {
            &self.kind
        }

        async fn execute(
            &self,
            _params: &ParameterBag,
            _progress: ProgressSink,
            _cancel: tokio_util::sync::CancellationToken,
        ) -> TaskOutcome {
            TaskOutcome {
                status: TaskOutcomeStatus::Completed,
                result: None,
                message: None,
            }
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = TaskRegistry::new();
        assert!(registry.list().is_empty());
        assert!(!registry.is_known_kind("ebook"));
    }

    #[test]
    fn register_and_get() {
        let mut registry = TaskRegistry::new();
        registry.register(NoopTask {
            kind: "ebook".to_string(),
        });
        assert!(registry.get("ebook").is_some());
        assert!(registry.is_known_kind("ebook"));
        assert!(registry.get("writing").is_none());
    }

    #[tokio::test]
    async fn progress_sink_clamps_and_delivers() {
        let (sink, mut rx) = ProgressSink::new();
        sink.report(150.0);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 100.0);

        sink.report(-10.0);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 0.0);
    }
}
