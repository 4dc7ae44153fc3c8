//! Autonomy governance layer: the two-stage gate (decision matrix + risk
//! assessment), the approval workflow, and the notification store.
//!
//! `matrix` and `risk` are pure query layers; `notification` and `approval`
//! own mutable state and talk to the sync bridge; `facade` composes all
//! four into the single [`facade::AutonomyGate`] surface the experiment
//! registry consumes.

pub mod approval;
pub mod facade;
pub mod matrix;
pub mod notification;
pub mod risk;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The context a governed action is evaluated against: an arbitrary bag of
/// named values supplied by the caller (`amount`, `public`,
/// `contains_sensitive_topics`, `id`, `kind`, ...).
pub type Context = HashMap<String, serde_json::Value>;

/// The governance verdict on a requested action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Autonomous,
    Notify,
    ApprovalRequired,
    Prohibited,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Autonomous => "autonomous",
            Self::Notify => "notify",
            Self::ApprovalRequired => "approval_required",
            Self::Prohibited => "prohibited",
        };
        f.write_str(s)
    }
}

/// A category of risk an action may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Financial,
    Reputation,
    Operational,
    Compliance,
    Security,
    Performance,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 6] = [
        RiskCategory::Financial,
        RiskCategory::Reputation,
        RiskCategory::Operational,
        RiskCategory::Compliance,
        RiskCategory::Security,
        RiskCategory::Performance,
    ];
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Financial => "financial",
            Self::Reputation => "reputation",
            Self::Operational => "operational",
            Self::Compliance => "compliance",
            Self::Security => "security",
            Self::Performance => "performance",
        };
        f.write_str(s)
    }
}

/// Ordinal risk level. Declaration order is the ordering used for
/// tolerance comparisons (`minimal < low < medium < high < critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}
