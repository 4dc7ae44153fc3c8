//! Autonomy Facade: the single surface the experiment registry talks to
//! for governance decisions. Composes the decision matrix, risk assessor,
//! notification store, and approval workflow behind one narrow trait so
//! the registry never depends on governance internals directly (see the
//! module-level note on breaking the registry/governance reference cycle).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use super::approval::{ApprovalOutcome, ApprovalRecord, ApprovalWorkflow};
use super::matrix::DecisionMatrix;
use super::notification::{NotificationPriority, NotificationStore, NotificationType};
use super::risk::RiskAssessor;
use super::{Context, Level};
use crate::sync::SyncBridge;

/// A boxed async closure run once an approval resolves. Takes the final
/// outcome and returns nothing observable; side effects happen through
/// whatever the closure captured (typically a registry handle).
pub type ExecuteFn =
    Box<dyn FnOnce(ApprovalOutcome) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// The narrow interface the experiment registry (and anything else that
/// needs a gating decision) consumes. Kept as a trait so the registry can
/// depend on this instead of on `AutonomyFacade` concretely, which is what
/// breaks the cyclic reference the original autonomy/experimentation
/// frameworks had.
#[async_trait]
pub trait AutonomyGate: Send + Sync {
    /// Synchronous-feeling yes/no check: is this action currently
    /// permitted without any human in the loop? Returns the reason when
    /// the answer is no.
    async fn can_execute(&self, category: &str, action: &str, context: &Context) -> (bool, Option<String>);

    /// Evaluate and, if gated, register a continuation to run once a
    /// human resolves it. `execute` runs immediately if the verdict is
    /// `Autonomous` or `Notify`; for `ApprovalRequired` it is parked until
    /// [`AutonomyFacade::resolve`] fires; for `Prohibited` it never runs.
    /// `user`, when given, is who this action is being taken on behalf of
    /// and is attached to any notification or approval request raised.
    #[allow(clippy::too_many_arguments)]
    async fn execute_action(
        &self,
        title: &str,
        description: &str,
        category: &str,
        action: &str,
        context: Context,
        expiry: Option<DateTime<Utc>>,
        user: Option<String>,
        execute: ExecuteFn,
    ) -> ActionResult;
}

/// What happened to a requested action immediately after evaluation. The
/// `ApprovalRequired` arm means `execute` has not run yet; it runs later,
/// asynchronously, from the continuation dispatcher.
#[derive(Debug, Clone)]
pub enum ActionResult {
    Executed { level: Level },
    Notified,
    PendingApproval { approval_id: Uuid },
    Prohibited { reason: String },
}

enum Decision {
    Run(Level),
    PendingApproval,
    Prohibited(String),
}

struct PendingContinuation {
    execute: ExecuteFn,
}

struct Inner {
    pending: HashMap<Uuid, PendingContinuation>,
}

/// Composes the decision matrix, risk assessor, approval workflow, and
/// notification store into the single governance entry point.
///
/// Continuations never run as a direct call out of `resolve`/sweep code
/// while a lock is held. Instead resolution sends `(approval_id, outcome,
/// notification_id)` over an unbounded channel to a background task that
/// owns the actual pending-continuation removal and invocation; removing
/// from the map and running the closure happen atomically from that
/// task's point of view, which is what gives "exactly once" even if an
/// expiry sweep and a human decision race. The same message also carries
/// the approval's linked notification id so the dispatcher can mark it
/// resolved and raise the matching outcome notification.
pub struct AutonomyFacade {
    matrix: Mutex<DecisionMatrix>,
    risk: Mutex<RiskAssessor>,
    pub approvals: ApprovalWorkflow,
    pub notifications: Arc<NotificationStore>,
    inner: Arc<Mutex<Inner>>,
    dispatch_tx: mpsc::UnboundedSender<(Uuid, ApprovalOutcome, Option<Uuid>)>,
}

impl AutonomyFacade {
    pub fn new(matrix: DecisionMatrix, risk: RiskAssessor, sync: Arc<dyn SyncBridge>) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(Inner {
            pending: HashMap::new(),
        }));
        let notifications = Arc::new(NotificationStore::new(sync.clone()));

        let facade = Arc::new(Self {
            matrix: Mutex::new(matrix),
            risk: Mutex::new(risk),
            approvals: ApprovalWorkflow::new(sync),
            notifications: notifications.clone(),
            inner: inner.clone(),
            dispatch_tx,
        });

        tokio::spawn(run_dispatcher(inner, notifications, dispatch_rx));
        facade
    }

    pub fn with_defaults(sync: Arc<dyn SyncBridge>) -> Arc<Self> {
        Self::new(DecisionMatrix::seeded(), RiskAssessor::with_balanced_default(), sync)
    }

    async fn decide(&self, category: &str, action: &str, context: &Context) -> Decision {
        let level = self.matrix.lock().await.approval_level(category, action, context);
        if level == Level::Prohibited {
            return Decision::Prohibited("Action prohibited by decision matrix".to_string());
        }

        let assessment = self.risk.lock().await.assess(context);
        if let Err(score) = self.risk.lock().await.within_tolerance(&assessment) {
            return Decision::Prohibited(format!(
                "Risk exceeds tolerance: {} risk is {}",
                score.category, score.level
            ));
        }

        match level {
            Level::Prohibited => unreachable!("handled above"),
            Level::ApprovalRequired => Decision::PendingApproval,
            other => Decision::Run(other),
        }
    }

    /// Resolve a pending approval, dispatching its continuation exactly
    /// once. Safe to call concurrently with [`Self::sweep_expired`]:
    /// whichever resolution wins the approval workflow's one-shot
    /// transition is the one whose continuation actually runs.
    pub async fn resolve(
        &self,
        approval_id: Uuid,
        user_id: impl Into<String>,
        approved: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, super::approval::ApprovalError> {
        let record = if approved {
            self.approvals.approve(approval_id, user_id, reason, now).await?
        } else {
            self.approvals.reject(approval_id, user_id, reason, now).await?
        };

        if let Some(outcome) = record.status.into_outcome() {
            let _ = self.dispatch_tx.send((approval_id, outcome, record.notification_id));
        }
        Ok(record)
    }

    /// Sweep expired approvals and dispatch their continuations as
    /// `Expired`. Intended to be driven periodically by
    /// `agent_core::housekeeping`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired = self.approvals.sweep_expired(now).await;
        let count = expired.len();
        for record in expired {
            let _ = self
                .dispatch_tx
                .send((record.id, ApprovalOutcome::Expired, record.notification_id));
        }
        count
    }

    /// Restore an approval request fetched from the sync bridge at cold
    /// start. The original `execute_fn` closure lived only in this
    /// process's memory and cannot be reconstructed, so the reattached
    /// continuation is a logging no-op: on resolution it records the
    /// outcome but performs no side effect. This is a deliberate
    /// limitation of a single-process restart recovery model.
    pub async fn restore_approval(&self, record: ApprovalRecord) {
        let id = record.id;
        let status = record.status;
        self.approvals.restore(record).await;
        if status == super::approval::ApprovalStatus::Pending {
            self.park(
                id,
                Box::new(move |outcome| {
                    Box::pin(async move {
                        warn!(approval_id = %id, ?outcome, "resolved a restored approval with no live continuation to run");
                    })
                }),
            )
            .await;
        }
    }

    async fn park(&self, approval_id: Uuid, execute: ExecuteFn) {
        self.inner
            .lock()
            .await
            .pending
            .insert(approval_id, PendingContinuation { execute });
    }
}

/// Background loop owning `pending`. Removing the entry and invoking the
/// closure happen under the same `recv` iteration without holding the
/// lock across the `.await` of the closure itself, so a duplicate message
/// for an already-removed id is simply a no-op. Once the continuation has
/// run (or been skipped because the approval was never parked, e.g. it
/// was swept before `execute_action` returned), the linked notification
/// is marked resolved and an outcome notification is raised.
async fn run_dispatcher(
    inner: Arc<Mutex<Inner>>,
    notifications: Arc<NotificationStore>,
    mut rx: mpsc::UnboundedReceiver<(Uuid, ApprovalOutcome, Option<Uuid>)>,
) {
    while let Some((approval_id, outcome, notification_id)) = rx.recv().await {
        let continuation = inner.lock().await.pending.remove(&approval_id);
        match continuation {
            Some(PendingContinuation { execute }) => {
                info!(approval_id = %approval_id, ?outcome, "running parked continuation");
                execute(outcome).await;
            }
            None => {
                warn!(approval_id = %approval_id, "continuation dispatch for unknown or already-run approval");
            }
        }

        let now = Utc::now();
        if let Some(notification_id) = notification_id {
            let result = match outcome {
                ApprovalOutcome::Approved => notifications.mark_actioned(notification_id, "approve", now).await,
                ApprovalOutcome::Rejected => notifications.mark_actioned(notification_id, "reject", now).await,
                ApprovalOutcome::Cancelled => notifications.mark_actioned(notification_id, "cancel", now).await,
                ApprovalOutcome::Expired => notifications.mark_expired(notification_id, now).await,
            };
            if let Err(err) = result {
                warn!(notification_id = %notification_id, error = %err, "failed to mark linked notification resolved");
            }
        }

        let (title, message) = match outcome {
            ApprovalOutcome::Approved => (
                "Approval request approved".to_string(),
                format!("Approval {approval_id} was approved and has run."),
            ),
            ApprovalOutcome::Rejected => (
                "Approval request rejected".to_string(),
                format!("Approval {approval_id} was rejected."),
            ),
            ApprovalOutcome::Expired => (
                "Approval request expired".to_string(),
                format!("Approval {approval_id} expired with no decision."),
            ),
            ApprovalOutcome::Cancelled => (
                "Approval request cancelled".to_string(),
                format!("Approval {approval_id} was cancelled."),
            ),
        };
        notifications
            .create(
                title,
                message,
                "approval_workflow",
                NotificationType::StatusUpdate,
                NotificationPriority::Low,
                None,
                false,
                vec![],
                None,
                None,
                now,
            )
            .await;
    }
}

#[async_trait]
impl AutonomyGate for AutonomyFacade {
    async fn can_execute(&self, category: &str, action: &str, context: &Context) -> (bool, Option<String>) {
        match self.decide(category, action, context).await {
            Decision::Prohibited(reason) => (false, Some(reason)),
            Decision::Run(_) | Decision::PendingApproval => (true, None),
        }
    }

    async fn execute_action(
        &self,
        title: &str,
        description: &str,
        category: &str,
        action: &str,
        context: Context,
        expiry: Option<DateTime<Utc>>,
        user: Option<String>,
        execute: ExecuteFn,
    ) -> ActionResult {
        match self.decide(category, action, &context).await {
            Decision::Prohibited(reason) => {
                self.notifications
                    .create(
                        format!("Blocked: {title}"),
                        reason.clone(),
                        category,
                        NotificationType::Error,
                        NotificationPriority::High,
                        user,
                        false,
                        vec![],
                        None,
                        None,
                        Utc::now(),
                    )
                    .await;
                ActionResult::Prohibited { reason }
            }
            Decision::Run(Level::Notify) => {
                self.notifications
                    .create(
                        title,
                        description,
                        category,
                        NotificationType::Info,
                        NotificationPriority::Medium,
                        user,
                        false,
                        vec![],
                        None,
                        None,
                        Utc::now(),
                    )
                    .await;
                execute(ApprovalOutcome::Approved).await;
                ActionResult::Notified
            }
            Decision::Run(level) => {
                execute(ApprovalOutcome::Approved).await;
                ActionResult::Executed { level }
            }
            Decision::PendingApproval => {
                let notification = self
                    .notifications
                    .create(
                        title,
                        description,
                        category,
                        NotificationType::ApprovalRequest,
                        NotificationPriority::High,
                        user.clone(),
                        true,
                        vec!["approve".to_string(), "reject".to_string()],
                        None,
                        expiry,
                        Utc::now(),
                    )
                    .await;
                let record = self
                    .approvals
                    .create(
                        title,
                        description,
                        category,
                        action,
                        context,
                        user,
                        expiry,
                        Some(notification.id),
                        Utc::now(),
                    )
                    .await;
                self.park(record.id, execute).await;
                ActionResult::PendingApproval { approval_id: record.id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NullSyncBridge;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> Context {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn facade() -> Arc<AutonomyFacade> {
        AutonomyFacade::with_defaults(Arc::new(NullSyncBridge))
    }

    #[tokio::test]
    async fn autonomous_action_runs_immediately() {
        let facade = facade();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let result = facade
            .execute_action(
                "Generate ebook",
                "desc",
                "experiment_management",
                "create_experiment",
                ctx(&[("estimated_cost", json!(5.0))]),
                None,
                None,
                Box::new(move |_| {
                    Box::pin(async move {
                        ran2.store(true, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        assert!(matches!(result, ActionResult::Executed { .. }));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn prohibited_never_runs_execute() {
        let facade = facade();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let result = facade
            .execute_action(
                "Spend",
                "desc",
                "financial",
                "spend_money",
                ctx(&[("amount", json!(100.0))]),
                None,
                None,
                Box::new(move |_| Box::pin(async move { ran2.store(true, Ordering::SeqCst) })),
            )
            .await;

        assert!(matches!(result, ActionResult::Prohibited { .. }));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn approval_required_parks_then_runs_on_resolve() {
        let facade = facade();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let result = facade
            .execute_action(
                "Spend",
                "desc",
                "financial",
                "spend_money",
                ctx(&[("amount", json!(30.0))]),
                None,
                Some("alice".to_string()),
                Box::new(move |outcome| {
                    Box::pin(async move {
                        assert_eq!(outcome, ApprovalOutcome::Approved);
                        ran2.store(true, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        let approval_id = match result {
            ActionResult::PendingApproval { approval_id } => approval_id,
            other => panic!("expected PendingApproval, got {other:?}"),
        };
        assert!(!ran.load(Ordering::SeqCst));

        let record = facade.approvals.get(approval_id).await.unwrap();
        assert!(record.notification_id.is_some());

        facade.resolve(approval_id, "alice", true, None, Utc::now()).await.unwrap();

        for _ in 0..50 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(ran.load(Ordering::SeqCst));

        let notification_id = record.notification_id.unwrap();
        let mut status = facade.notifications.get(notification_id).await.unwrap().status;
        for _ in 0..50 {
            if status == super::notification::NotificationStatus::Actioned {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            status = facade.notifications.get(notification_id).await.unwrap().status;
        }
        assert_eq!(status, super::notification::NotificationStatus::Actioned);
    }

    #[tokio::test]
    async fn risk_veto_overrides_autonomous_matrix_verdict() {
        // create_experiment defaults to AUTONOMOUS in the matrix, but a
        // financial amount over 1000 is CRITICAL risk, which the balanced
        // profile does not tolerate (max MEDIUM).
        let facade = facade();
        let (can, reason) = facade
            .can_execute(
                "experiment_management",
                "create_experiment",
                &ctx(&[("amount", json!(2000.0))]),
            )
            .await;
        assert!(!can);
        assert!(reason.unwrap().contains("Risk exceeds tolerance"));
    }
}
