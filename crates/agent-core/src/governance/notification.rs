//! Notification Store: a durable record of things the agent has told a
//! human about, some of which accept a follow-up action.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::sync::SyncBridge;

pub type NotificationId = Uuid;

/// Mirrors `notification_system.py::NotificationType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Info,
    Warning,
    Error,
    ApprovalRequest,
    StatusUpdate,
}

/// Mirrors `notification_system.py::NotificationPriority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Read,
    Actioned,
    Expired,
}

/// A single notification raised for a human. `action_required` and
/// `allowed_actions` describe whether and how it can be resolved;
/// notifications with `action_required = false` are informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub message: String,
    pub category: String,
    pub notification_type: NotificationType,
    pub priority: NotificationPriority,
    pub target_user: Option<String>,
    pub created_time: DateTime<Utc>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    pub action_required: bool,
    pub allowed_actions: Vec<String>,
    pub action_taken: Option<String>,
    pub action_time: Option<DateTime<Utc>>,
    pub related_experiment_id: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification {0} not found")]
    NotFound(NotificationId),
    #[error("notification {0} does not accept actions")]
    NoActionRequired(NotificationId),
    #[error("notification {0} has expired")]
    Expired(NotificationId),
    #[error("action {action:?} is not allowed for notification {id}")]
    ActionNotAllowed {
        id: NotificationId,
        action: String,
    },
    #[error("notification {0} has already had an action taken")]
    AlreadyActedOn(NotificationId),
}

struct Inner {
    notifications: HashMap<NotificationId, Notification>,
}

/// In-memory notification store, write-through replicated to the sync
/// bridge. Failures to replicate are logged, not propagated: the store is
/// the source of truth locally and the remote copy is best-effort.
pub struct NotificationStore {
    inner: Mutex<Inner>,
    sync: Arc<dyn SyncBridge>,
}

impl NotificationStore {
    pub fn new(sync: Arc<dyn SyncBridge>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                notifications: HashMap::new(),
            }),
            sync,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        category: impl Into<String>,
        notification_type: NotificationType,
        priority: NotificationPriority,
        target_user: Option<String>,
        action_required: bool,
        allowed_actions: Vec<String>,
        related_experiment_id: Option<Uuid>,
        expiry_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.into(),
            category: category.into(),
            notification_type,
            priority,
            target_user,
            created_time: now,
            expiry_time,
            status: NotificationStatus::Pending,
            action_required,
            allowed_actions,
            action_taken: None,
            action_time: None,
            related_experiment_id,
        };

        {
            let mut inner = self.inner.lock().await;
            inner
                .notifications
                .insert(notification.id, notification.clone());
        }

        let sync = self.sync.clone();
        let to_sync = notification.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.sync_notification(&to_sync).await {
                warn!(notification_id = %to_sync.id, error = %err, "failed to sync notification");
            }
        });

        notification
    }

    pub async fn get(&self, id: NotificationId) -> Option<Notification> {
        self.inner.lock().await.notifications.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Notification> {
        let mut all: Vec<_> = self.inner.lock().await.notifications.values().cloned().collect();
        all.sort_by_key(|n| n.created_time);
        all
    }

    pub async fn mark_read(&self, id: NotificationId) -> Result<Notification, NotificationError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            let n = inner
                .notifications
                .get_mut(&id)
                .ok_or(NotificationError::NotFound(id))?;
            if n.status == NotificationStatus::Pending || n.status == NotificationStatus::Delivered {
                n.status = NotificationStatus::Read;
            }
            n.clone()
        };

        let sync = self.sync.clone();
        let (id, status) = (updated.id, updated.status);
        tokio::spawn(async move {
            if let Err(err) = sync.update_notification(id, status).await {
                warn!(notification_id = %id, error = %err, "failed to sync notification read state");
            }
        });

        Ok(updated)
    }

    /// Record that a human took `action` on this notification. Enforces
    /// that the notification accepts actions, is not expired, that
    /// `action` is one of its `allowed_actions`, and that no action has
    /// already been taken.
    pub async fn take_action(
        &self,
        id: NotificationId,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<Notification, NotificationError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            let n = inner
                .notifications
                .get_mut(&id)
                .ok_or(NotificationError::NotFound(id))?;

            if !n.action_required {
                return Err(NotificationError::NoActionRequired(id));
            }
            if n.status == NotificationStatus::Expired {
                return Err(NotificationError::Expired(id));
            }
            if n.action_taken.is_some() {
                return Err(NotificationError::AlreadyActedOn(id));
            }
            if !n.allowed_actions.iter().any(|a| a == action) {
                return Err(NotificationError::ActionNotAllowed {
                    id,
                    action: action.to_string(),
                });
            }

            n.status = NotificationStatus::Actioned;
            n.action_taken = Some(action.to_string());
            n.action_time = Some(now);
            n.clone()
        };

        let sync = self.sync.clone();
        let (id, status) = (updated.id, updated.status);
        tokio::spawn(async move {
            if let Err(err) = sync.update_notification(id, status).await {
                warn!(notification_id = %id, error = %err, "failed to sync notification action");
            }
        });

        Ok(updated)
    }

    /// Record that `action` resolved this notification without checking
    /// `allowed_actions`. Used by the continuation dispatcher to reflect an
    /// approval outcome that a human didn't directly act on through this
    /// notification (e.g. a cancellation initiated elsewhere), where
    /// `take_action`'s allow-list is meant to gate direct human input, not
    /// internal resolution.
    pub async fn mark_actioned(
        &self,
        id: NotificationId,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<Notification, NotificationError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            let n = inner
                .notifications
                .get_mut(&id)
                .ok_or(NotificationError::NotFound(id))?;
            n.status = NotificationStatus::Actioned;
            n.action_taken = Some(action.to_string());
            n.action_time = Some(now);
            n.clone()
        };

        let sync = self.sync.clone();
        let (id, status) = (updated.id, updated.status);
        tokio::spawn(async move {
            if let Err(err) = sync.update_notification(id, status).await {
                warn!(notification_id = %id, error = %err, "failed to sync notification action");
            }
        });

        Ok(updated)
    }

    /// Force a notification straight to `EXPIRED`, bypassing the
    /// `allowed_actions` check `take_action` enforces. Used when the
    /// notification's linked approval request expires with nobody having
    /// acted on it.
    pub async fn mark_expired(&self, id: NotificationId, now: DateTime<Utc>) -> Result<Notification, NotificationError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            let n = inner
                .notifications
                .get_mut(&id)
                .ok_or(NotificationError::NotFound(id))?;
            n.status = NotificationStatus::Expired;
            n.action_time = Some(now);
            n.clone()
        };

        let sync = self.sync.clone();
        let (id, status) = (updated.id, updated.status);
        tokio::spawn(async move {
            if let Err(err) = sync.update_notification(id, status).await {
                warn!(notification_id = %id, error = %err, "failed to sync notification expiry");
            }
        });

        Ok(updated)
    }

    /// Restore a record from the remote store (used when bootstrapping
    /// after a restart, or in tests).
    pub async fn restore(&self, notification: Notification) {
        self.inner.lock().await.notifications.insert(notification.id, notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NullSyncBridge;

    fn store() -> NotificationStore {
        NotificationStore::new(Arc::new(NullSyncBridge))
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = store();
        let n = store
            .create(
                "Title",
                "Body",
                "general",
                NotificationType::Info,
                NotificationPriority::Low,
                None,
                false,
                vec![],
                None,
                None,
                Utc::now(),
            )
            .await;
        let fetched = store.get(n.id).await.unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn take_action_enforces_allow_list() {
        let store = store();
        let n = store
            .create(
                "Approve?",
                "body",
                "financial",
                NotificationType::ApprovalRequest,
                NotificationPriority::High,
                Some("alice".to_string()),
                true,
                vec!["approve".into(), "reject".into()],
                None,
                None,
                Utc::now(),
            )
            .await;

        let err = store.take_action(n.id, "snooze", Utc::now()).await.unwrap_err();
        assert!(matches!(err, NotificationError::ActionNotAllowed { .. }));

        let ok = store.take_action(n.id, "approve", Utc::now()).await.unwrap();
        assert_eq!(ok.status, NotificationStatus::Actioned);

        let err = store.take_action(n.id, "approve", Utc::now()).await.unwrap_err();
        assert!(matches!(err, NotificationError::AlreadyActedOn(_)));
    }

    #[tokio::test]
    async fn take_action_rejects_informational_notification() {
        let store = store();
        let n = store
            .create(
                "FYI",
                "body",
                "general",
                NotificationType::Info,
                NotificationPriority::Low,
                None,
                false,
                vec![],
                None,
                None,
                Utc::now(),
            )
            .await;
        let err = store.take_action(n.id, "anything", Utc::now()).await.unwrap_err();
        assert!(matches!(err, NotificationError::NoActionRequired(_)));
    }

    #[tokio::test]
    async fn mark_expired_blocks_further_action() {
        let store = store();
        let n = store
            .create(
                "Approve?",
                "body",
                "financial",
                NotificationType::ApprovalRequest,
                NotificationPriority::High,
                None,
                true,
                vec!["approve".into(), "reject".into()],
                None,
                None,
                Utc::now(),
            )
            .await;
        store.mark_expired(n.id, Utc::now()).await.unwrap();
        let err = store.take_action(n.id, "approve", Utc::now()).await.unwrap_err();
        assert!(matches!(err, NotificationError::Expired(_)));
    }
}
