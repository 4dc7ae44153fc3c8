//! Approval Workflow: one-shot PENDING -> {APPROVED, REJECTED, EXPIRED,
//! CANCELLED} requests. A request's callback fires exactly once, driven by
//! the [`super::facade::AutonomyFacade`] continuation dispatcher rather
//! than by a direct re-entrant call out of `approve`/`reject`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::Context;
use crate::sync::SyncBridge;

pub type ApprovalId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

/// Outcome handed to a continuation once a request resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

/// An approval request's wire shape, mirroring
/// `approval_workflow.py::ApprovalRequest.to_dict`. The actual resumption
/// closure lives only in the facade's pending-continuation table and is
/// never part of this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: ApprovalId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub action: String,
    pub context: Context,
    pub target_user: Option<String>,
    pub created_time: DateTime<Utc>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
    pub decision_time: Option<DateTime<Utc>>,
    pub decision_user_id: Option<String>,
    pub decision_reason: Option<String>,
    pub notification_id: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(ApprovalId),
    #[error("approval request {id} is already resolved as {status:?}")]
    AlreadyResolved {
        id: ApprovalId,
        status: ApprovalStatus,
    },
}

struct Inner {
    requests: HashMap<ApprovalId, ApprovalRecord>,
}

/// Owns every approval request's lifecycle state. Resolution
/// (`resolve_approved`/`resolve_rejected`/`cancel`/expiry sweep) is the
/// only place status transitions out of `Pending`; callers observe the
/// result but the facade's continuation dispatcher is what actually acts
/// on it.
pub struct ApprovalWorkflow {
    inner: Mutex<Inner>,
    sync: Arc<dyn SyncBridge>,
}

impl ApprovalWorkflow {
    pub fn new(sync: Arc<dyn SyncBridge>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
            }),
            sync,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        action: impl Into<String>,
        context: Context,
        target_user: Option<String>,
        expiry_time: Option<DateTime<Utc>>,
        notification_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> ApprovalRecord {
        let record = ApprovalRecord {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            category: category.into(),
            action: action.into(),
            context,
            target_user,
            created_time: now,
            expiry_time,
            status: ApprovalStatus::Pending,
            decision_time: None,
            decision_user_id: None,
            decision_reason: None,
            notification_id,
        };

        self.inner.lock().await.requests.insert(record.id, record.clone());

        let sync = self.sync.clone();
        let to_sync = record.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.sync_approval(&to_sync).await {
                warn!(approval_id = %to_sync.id, error = %err, "failed to sync new approval request");
            }
        });

        record
    }

    pub async fn get(&self, id: ApprovalId) -> Option<ApprovalRecord> {
        self.inner.lock().await.requests.get(&id).cloned()
    }

    pub async fn list_pending(&self) -> Vec<ApprovalRecord> {
        self.inner
            .lock()
            .await
            .requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    async fn resolve(
        &self,
        id: ApprovalId,
        status: ApprovalStatus,
        user_id: Option<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let mut inner = self.inner.lock().await;
        let record = inner.requests.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;

        if record.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id,
                status: record.status,
            });
        }

        record.status = status;
        record.decision_time = Some(now);
        record.decision_user_id = user_id;
        record.decision_reason = reason;
        let updated = record.clone();
        drop(inner);

        let sync = self.sync.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.update_approval_status(id, status).await {
                warn!(approval_id = %id, error = %err, "failed to sync approval status");
            }
        });

        Ok(updated)
    }

    pub async fn approve(
        &self,
        id: ApprovalId,
        user_id: impl Into<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        self.resolve(id, ApprovalStatus::Approved, Some(user_id.into()), reason, now)
            .await
    }

    pub async fn reject(
        &self,
        id: ApprovalId,
        user_id: impl Into<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        self.resolve(id, ApprovalStatus::Rejected, Some(user_id.into()), reason, now)
            .await
    }

    pub async fn cancel(&self, id: ApprovalId, now: DateTime<Utc>) -> Result<ApprovalRecord, ApprovalError> {
        self.resolve(id, ApprovalStatus::Cancelled, None, None, now).await
    }

    /// Scan every pending request and expire the ones past their
    /// `expiry_time`. Returns the records that were just expired, for the
    /// caller to feed to the continuation dispatcher.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ApprovalRecord> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for record in inner.requests.values_mut() {
            if record.status == ApprovalStatus::Pending {
                if let Some(expiry) = record.expiry_time {
                    if now >= expiry {
                        record.status = ApprovalStatus::Expired;
                        record.decision_time = Some(now);
                        expired.push(record.clone());
                    }
                }
            }
        }
        drop(inner);

        for record in &expired {
            let sync = self.sync.clone();
            let id = record.id;
            tokio::spawn(async move {
                if let Err(err) = sync.update_approval_status(id, ApprovalStatus::Expired).await {
                    warn!(approval_id = %id, error = %err, "failed to sync approval expiry");
                }
            });
        }

        expired
    }

    /// Restore a record from the remote store (used when bootstrapping
    /// after a restart, or in tests).
    pub async fn restore(&self, record: ApprovalRecord) {
        self.inner.lock().await.requests.insert(record.id, record);
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl ApprovalStatus {
    pub fn into_outcome(self) -> Option<ApprovalOutcome> {
        match self {
            ApprovalStatus::Approved => Some(ApprovalOutcome::Approved),
            ApprovalStatus::Rejected => Some(ApprovalOutcome::Rejected),
            ApprovalStatus::Expired => Some(ApprovalOutcome::Expired),
            ApprovalStatus::Cancelled => Some(ApprovalOutcome::Cancelled),
            ApprovalStatus::Pending => None,
        }
    }
}
