//! Experiment data model: identity, lifecycle state, parameters, and the
//! metrics snapshot.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of an experiment.
pub type ExperimentId = Uuid;

/// Canonical metric keys. Tasks and the ticker both write into the same
/// flat map; these constants keep the well-known keys from drifting.
pub mod metric_keys {
    pub const PROGRESS_PERCENT: &str = "progress_percent";
    pub const ELAPSED_SECONDS: &str = "elapsed_seconds";
    pub const ESTIMATED_REMAINING_SECONDS: &str = "estimated_remaining_seconds";
    pub const CPU_PERCENT: &str = "cpu_percent";
    pub const MEMORY_MB: &str = "memory_mb";
    pub const ERROR_COUNT: &str = "error_count";
    pub const RESULT_PREFIX: &str = "result_";
}

/// A scalar metric value. Task results are flattened into the metrics map;
/// only these shapes survive the flattening (nested maps/lists are dropped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

/// String-keyed map of scalar metrics.
pub type Metrics = HashMap<String, MetricValue>;

/// Build a fresh metrics snapshot with the canonical keys zeroed out.
pub fn empty_metrics() -> Metrics {
    let mut m = Metrics::new();
    m.insert(metric_keys::PROGRESS_PERCENT.to_string(), 0.0.into());
    m.insert(metric_keys::ELAPSED_SECONDS.to_string(), 0.0.into());
    m.insert(
        metric_keys::ESTIMATED_REMAINING_SECONDS.to_string(),
        0.0.into(),
    );
    m.insert(metric_keys::CPU_PERCENT.to_string(), 0.0.into());
    m.insert(metric_keys::MEMORY_MB.to_string(), 0.0.into());
    m.insert(metric_keys::ERROR_COUNT.to_string(), 0.0.into());
    m
}

/// A single parameter value in an experiment's parameter bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

/// String-keyed bag of typed parameters.
pub type ParameterBag = HashMap<String, ParameterValue>;

/// Lifecycle state of an experiment. See `agent_core::registry` for the
/// transition graph this enum participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Defined,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExperimentState {
    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentState::Completed | ExperimentState::Failed | ExperimentState::Stopped
        )
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Defined => "defined",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for ExperimentState {
    type Err = ExperimentStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "defined" => Ok(Self::Defined),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(ExperimentStateParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentStateParseError(pub String);

impl fmt::Display for ExperimentStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid experiment state: {:?}", self.0)
    }
}

impl std::error::Error for ExperimentStateParseError {}

/// The verbatim definition a caller submitted to create an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: ParameterBag,
}

/// The full experiment record owned exclusively by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub kind: String,
    pub description: String,
    pub parameters: ParameterBag,
    pub state: ExperimentState,
    pub status_message: String,
    pub start_time: Option<DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
    pub estimated_completion_time: Option<DateTime<Utc>>,
    pub metrics: Metrics,
    pub definition: ExperimentDefinition,
}

impl Experiment {
    pub fn new(id: ExperimentId, definition: ExperimentDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: definition.name.clone(),
            kind: definition.kind.clone(),
            description: definition.description.clone(),
            parameters: definition.parameters.clone(),
            state: ExperimentState::Defined,
            status_message: "defined".to_string(),
            start_time: None,
            last_update_time: now,
            estimated_completion_time: None,
            metrics: empty_metrics(),
            definition,
        }
    }
}
