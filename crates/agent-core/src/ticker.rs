//! Metrics Ticker: periodically refreshes elapsed time and a synthesized
//! progress estimate for every running experiment, so that an experiment
//! whose task never calls [`crate::task::ProgressSink::report`] still
//! shows forward motion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::experiment::{metric_keys, ExperimentId, ExperimentState};
use crate::registry::ExperimentRegistry;

#[derive(Debug, Clone, Copy)]
pub struct TickerConfig {
    pub interval: Duration,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Synthesized progress curve: asymptotic toward 95%, never claiming
/// completion on its own (only a task outcome or an operator stop can
/// move an experiment out of `Running`). `elapsed` and the 30-second
/// shape constant are both in seconds.
fn synthesize_progress(elapsed_seconds: f64) -> f64 {
    (95.0 * elapsed_seconds / (elapsed_seconds + 30.0)).min(95.0)
}

fn estimate_remaining(elapsed_seconds: f64, progress_percent: f64) -> f64 {
    if progress_percent <= 0.0 {
        return 0.0;
    }
    let total_estimate = elapsed_seconds * (100.0 / progress_percent);
    (total_estimate - elapsed_seconds).max(0.0)
}

/// Spawn a background task that refreshes every running experiment's
/// `elapsed_seconds`, synthesized `progress_percent`, and
/// `estimated_remaining_seconds` metrics on `config.interval`. The task
/// runs until `shutdown` fires; per-experiment work happens inline
/// (there is no separate task per experiment) since a refresh tick is a
/// cheap, non-blocking metrics update.
pub async fn run_ticker(
    registry: Arc<ExperimentRegistry>,
    config: TickerConfig,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("metrics ticker shutting down");
                return;
            }
            _ = interval.tick() => {
                tick_once(&registry).await;
            }
        }
    }
}

async fn tick_once(registry: &Arc<ExperimentRegistry>) {
    let now = Utc::now();
    for experiment in registry.list().await {
        if experiment.state != ExperimentState::Running {
            continue;
        }
        let Some(start_time) = experiment.start_time else {
            continue;
        };

        let elapsed = (now - start_time).num_milliseconds().max(0) as f64 / 1000.0;
        refresh_experiment_metrics(registry, experiment.id, elapsed).await;
    }
}

async fn refresh_experiment_metrics(registry: &Arc<ExperimentRegistry>, id: ExperimentId, elapsed: f64) {
    let _ = registry
        .update_metrics(id, |experiment| {
            let reported = experiment
                .metrics
                .get(metric_keys::PROGRESS_PERCENT)
                .and_then(|m| m.as_f64())
                .unwrap_or(0.0);
            let synthesized = synthesize_progress(elapsed);
            // Never regress: a task that has reported real progress always
            // wins over the synthesized curve.
            let progress = reported.max(synthesized);

            experiment
                .metrics
                .insert(metric_keys::ELAPSED_SECONDS.to_string(), elapsed.into());
            experiment
                .metrics
                .insert(metric_keys::PROGRESS_PERCENT.to_string(), progress.into());
            experiment.metrics.insert(
                metric_keys::ESTIMATED_REMAINING_SECONDS.to_string(),
                estimate_remaining(elapsed, progress).into(),
            );
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_progress_is_monotonic_and_bounded() {
        let a = synthesize_progress(0.0);
        let b = synthesize_progress(30.0);
        let c = synthesize_progress(3000.0);
        assert!(a < b);
        assert!(b < c);
        assert!(c <= 95.0);
    }

    #[test]
    fn estimate_remaining_is_zero_with_no_progress() {
        assert_eq!(estimate_remaining(100.0, 0.0), 0.0);
    }

    #[test]
    fn estimate_remaining_shrinks_as_progress_grows() {
        let early = estimate_remaining(10.0, 10.0);
        let late = estimate_remaining(10.0, 90.0);
        assert!(late < early);
    }

    #[tokio::test]
    async fn tick_never_regresses_reported_progress() {
        use crate::experiment::ExperimentDefinition;
        use crate::governance::facade::AutonomyFacade;
        use crate::sync::NullSyncBridge;
        use std::sync::Arc;

        let facade = AutonomyFacade::with_defaults(Arc::new(NullSyncBridge));
        let registry = Arc::new(ExperimentRegistry::new(facade, Arc::new(NullSyncBridge)));
        let experiment = registry
            .create(ExperimentDefinition {
                kind: "ebook".into(),
                name: "n".into(),
                description: "d".into(),
                parameters: Default::default(),
            })
            .await;
        registry
            .update_metrics(experiment.id, |e| {
                e.state = ExperimentState::Running;
                e.start_time = Some(Utc::now() - chrono::Duration::seconds(1));
                e.metrics
                    .insert(metric_keys::PROGRESS_PERCENT.to_string(), 99.0.into());
            })
            .await
            .unwrap();

        tick_once(&registry).await;

        let after = registry.get(experiment.id).await.unwrap();
        let progress = after.metrics[metric_keys::PROGRESS_PERCENT].as_f64().unwrap();
        assert_eq!(progress, 99.0);
    }
}
