//! Durable Sync Bridge: write-through replication of agent state to a
//! remote store over TLS. The bridge is best-effort from the agent's
//! point of view: a failed sync is logged and counted, never surfaced as
//! a failure of the operation that triggered it. The local in-memory
//! state is always the source of truth for anything currently running.
//!
//! Inbound operations (`restore_*`) are used exactly once, at cold start,
//! to repopulate in-memory state after a restart; they default to
//! returning nothing, so a bridge with no remote store to restore from
//! (like [`NullSyncBridge`]) just starts empty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::experiment::{Experiment, Metrics};
use crate::governance::approval::{ApprovalRecord, ApprovalStatus};
use crate::governance::notification::{Notification, NotificationStatus};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote store returned an error status: {0}")]
    RemoteStatus(u16),
    #[error("request to remote store failed: {0}")]
    Transport(String),
}

/// Everything the agent core replicates to the remote store. Implementors
/// must not block indefinitely; callers invoke these from `tokio::spawn`
/// fire-and-forget tasks and only log the result.
#[async_trait]
pub trait SyncBridge: Send + Sync {
    async fn sync_experiment(&self, experiment: &Experiment) -> Result<(), SyncError>;
    async fn sync_log(&self, experiment_id: Uuid, line: &str) -> Result<(), SyncError>;
    async fn sync_metrics(&self, experiment_id: Uuid, metrics: &Metrics) -> Result<(), SyncError>;
    async fn sync_notification(&self, notification: &Notification) -> Result<(), SyncError>;
    async fn sync_approval(&self, approval: &ApprovalRecord) -> Result<(), SyncError>;
    async fn update_approval_status(&self, approval_id: Uuid, status: ApprovalStatus) -> Result<(), SyncError>;
    async fn update_notification(&self, notification_id: Uuid, status: NotificationStatus) -> Result<(), SyncError>;

    /// Fetch every experiment the remote store has on file. Optional:
    /// a bridge with no durable experiment store (or nothing to restore
    /// from) returns an empty list.
    async fn restore_experiments(&self) -> Result<Vec<Experiment>, SyncError> {
        Ok(Vec::new())
    }

    /// Fetch every still-pending approval request, for re-attaching a
    /// fresh continuation dispatcher at cold start.
    async fn restore_pending_approvals(&self) -> Result<Vec<ApprovalRecord>, SyncError> {
        Ok(Vec::new())
    }

    /// Fetch every notification the remote store has on file.
    async fn restore_notifications(&self) -> Result<Vec<Notification>, SyncError> {
        Ok(Vec::new())
    }

    /// Number of sync failures observed so far, for the agent status RPC.
    fn failure_count(&self) -> u64;
}

/// No-op bridge used when sync is disabled or in tests that don't care
/// about replication.
pub struct NullSyncBridge;

#[async_trait]
impl SyncBridge for NullSyncBridge {
    async fn sync_experiment(&self, _experiment: &Experiment) -> Result<(), SyncError> {
        Ok(())
    }

    async fn sync_log(&self, _experiment_id: Uuid, _line: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn sync_metrics(&self, _experiment_id: Uuid, _metrics: &Metrics) -> Result<(), SyncError> {
        Ok(())
    }

    async fn sync_notification(&self, _notification: &Notification) -> Result<(), SyncError> {
        Ok(())
    }

    async fn sync_approval(&self, _approval: &ApprovalRecord) -> Result<(), SyncError> {
        Ok(())
    }

    async fn update_approval_status(&self, _approval_id: Uuid, _status: ApprovalStatus) -> Result<(), SyncError> {
        Ok(())
    }

    async fn update_notification(&self, _notification_id: Uuid, _status: NotificationStatus) -> Result<(), SyncError> {
        Ok(())
    }

    fn failure_count(&self) -> u64 {
        0
    }
}

/// Configuration for reaching the remote sync store.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

/// HTTP(S) sync bridge, talking to the remote store's write-through RPC
/// surface over TLS via `reqwest`. A failed request increments
/// `failures` and returns `Err`; the caller is expected to log and move
/// on rather than retry inline, since the next periodic sync or the next
/// mutation will carry the same state forward.
pub struct HttpSyncBridge {
    client: reqwest::Client,
    base_url: String,
    failures: AtomicU64,
}

impl HttpSyncBridge {
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url,
            failures: AtomicU64::new(0),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let result = self.client.post(&url).json(body).send().await;

        match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(SyncError::RemoteStatus(resp.status().as_u16()))
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(SyncError::Transport(err.to_string()))
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let result = self.client.get(&url).send().await;

        match result {
            Ok(resp) if resp.status().is_success() => resp
                .json::<T>()
                .await
                .map_err(|err| SyncError::Transport(err.to_string())),
            Ok(resp) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(SyncError::RemoteStatus(resp.status().as_u16()))
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(SyncError::Transport(err.to_string()))
            }
        }
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    experiment_id: Uuid,
    line: &'a str,
}

#[derive(Serialize)]
struct MetricsUpdate<'a> {
    experiment_id: Uuid,
    metrics: &'a Metrics,
}

#[derive(Serialize)]
struct ApprovalStatusUpdate {
    approval_id: Uuid,
    status: ApprovalStatus,
}

#[derive(Serialize)]
struct NotificationStatusUpdate {
    notification_id: Uuid,
    status: NotificationStatus,
}

#[async_trait]
impl SyncBridge for HttpSyncBridge {
    async fn sync_experiment(&self, experiment: &Experiment) -> Result<(), SyncError> {
        self.post("/v1/experiments", experiment).await
    }

    async fn sync_log(&self, experiment_id: Uuid, line: &str) -> Result<(), SyncError> {
        self.post("/v1/logs", &LogLine { experiment_id, line }).await
    }

    async fn sync_metrics(&self, experiment_id: Uuid, metrics: &Metrics) -> Result<(), SyncError> {
        self.post("/v1/metrics", &MetricsUpdate { experiment_id, metrics }).await
    }

    async fn sync_notification(&self, notification: &Notification) -> Result<(), SyncError> {
        self.post("/v1/notifications", notification).await
    }

    async fn sync_approval(&self, approval: &ApprovalRecord) -> Result<(), SyncError> {
        self.post("/v1/approvals", approval).await
    }

    async fn update_approval_status(&self, approval_id: Uuid, status: ApprovalStatus) -> Result<(), SyncError> {
        self.post("/v1/approvals/status", &ApprovalStatusUpdate { approval_id, status })
            .await
    }

    async fn update_notification(&self, notification_id: Uuid, status: NotificationStatus) -> Result<(), SyncError> {
        self.post(
            "/v1/notifications/status",
            &NotificationStatusUpdate { notification_id, status },
        )
        .await
    }

    async fn restore_experiments(&self) -> Result<Vec<Experiment>, SyncError> {
        self.get("/v1/experiments").await
    }

    async fn restore_pending_approvals(&self) -> Result<Vec<ApprovalRecord>, SyncError> {
        self.get("/v1/approvals?status=pending").await
    }

    async fn restore_notifications(&self) -> Result<Vec<Notification>, SyncError> {
        self.get("/v1/notifications").await
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_bridge_never_fails_and_never_counts() {
        let bridge = NullSyncBridge;
        let experiment = crate::experiment::Experiment::new(
            Uuid::new_v4(),
            crate::experiment::ExperimentDefinition {
                kind: "ebook".into(),
                name: "n".into(),
                description: "d".into(),
                parameters: Default::default(),
            },
            chrono::Utc::now(),
        );
        assert!(bridge.sync_experiment(&experiment).await.is_ok());
        assert_eq!(bridge.failure_count(), 0);
    }

    #[tokio::test]
    async fn null_bridge_restores_nothing() {
        let bridge = NullSyncBridge;
        assert!(bridge.restore_experiments().await.unwrap().is_empty());
        assert!(bridge.restore_pending_approvals().await.unwrap().is_empty());
        assert!(bridge.restore_notifications().await.unwrap().is_empty());
    }
}
