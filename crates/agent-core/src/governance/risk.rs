//! Risk Assessment: scores an action across fixed risk categories and
//! checks the result against a configurable tolerance profile.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Context, RiskCategory, RiskLevel};

/// Per-category maximum tolerated [`RiskLevel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskToleranceProfile {
    pub name: String,
    pub tolerance: HashMap<RiskCategory, RiskLevel>,
}

impl RiskToleranceProfile {
    fn max_for(&self, category: RiskCategory) -> RiskLevel {
        self.tolerance
            .get(&category)
            .copied()
            .unwrap_or(RiskLevel::Minimal)
    }
}

/// The three built-in profiles, carried over verbatim from
/// `risk_tolerance.py::create_default_profiles`.
pub fn conservative_profile() -> RiskToleranceProfile {
    use RiskCategory::*;
    use RiskLevel::*;
    RiskToleranceProfile {
        name: "conservative".to_string(),
        tolerance: HashMap::from([
            (Financial, Low),
            (Reputation, Low),
            (Operational, Low),
            (Compliance, Minimal),
            (Security, Minimal),
            (Performance, Medium),
        ]),
    }
}

pub fn balanced_profile() -> RiskToleranceProfile {
    use RiskCategory::*;
    use RiskLevel::*;
    RiskToleranceProfile {
        name: "balanced".to_string(),
        tolerance: HashMap::from([
            (Financial, Medium),
            (Reputation, Medium),
            (Operational, Medium),
            (Compliance, Low),
            (Security, Low),
            (Performance, Medium),
        ]),
    }
}

pub fn aggressive_profile() -> RiskToleranceProfile {
    use RiskCategory::*;
    use RiskLevel::*;
    RiskToleranceProfile {
        name: "aggressive".to_string(),
        tolerance: HashMap::from([
            (Financial, High),
            (Reputation, High),
            (Operational, High),
            (Compliance, Medium),
            (Security, Medium),
            (Performance, High),
        ]),
    }
}

/// A single category/level pair produced by an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScore {
    pub category: RiskCategory,
    pub level: RiskLevel,
}

/// The full risk picture for one action: every category that was
/// triggered, and the overall level (the highest among them).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub scores: Vec<RiskScore>,
}

impl RiskAssessment {
    /// The highest risk level across all triggered categories, or
    /// `Minimal` if nothing was triggered.
    pub fn overall_level(&self) -> RiskLevel {
        self.scores
            .iter()
            .map(|s| s.level)
            .max()
            .unwrap_or(RiskLevel::Minimal)
    }
}

/// Scores actions against context flags and holds the active tolerance
/// profile used to judge whether a score is acceptable.
pub struct RiskAssessor {
    profile: RiskToleranceProfile,
}

impl RiskAssessor {
    pub fn new(profile: RiskToleranceProfile) -> Self {
        Self { profile }
    }

    pub fn with_balanced_default() -> Self {
        Self::new(balanced_profile())
    }

    pub fn profile_name(&self) -> &str {
        &self.profile.name
    }

    pub fn set_profile(&mut self, profile: RiskToleranceProfile) {
        self.profile = profile;
    }

    pub fn update_tolerance(&mut self, category: RiskCategory, level: RiskLevel) {
        self.profile.tolerance.insert(category, level);
    }

    /// Score an action's context. Thresholds are carried over from
    /// `risk_tolerance.py::RiskAssessment.assess_risk`.
    pub fn assess(&self, context: &Context) -> RiskAssessment {
        let mut scores = Vec::new();

        if let Some(amount) = context.get("amount").and_then(|v| v.as_f64()) {
            let level = if amount > 1000.0 {
                Some(RiskLevel::Critical)
            } else if amount > 500.0 {
                Some(RiskLevel::High)
            } else if amount > 100.0 {
                Some(RiskLevel::Medium)
            } else if amount > 10.0 {
                Some(RiskLevel::Low)
            } else {
                None
            };
            if let Some(level) = level {
                scores.push(RiskScore {
                    category: RiskCategory::Financial,
                    level,
                });
            }
        }

        if flag(context, "public") {
            scores.push(RiskScore {
                category: RiskCategory::Reputation,
                level: RiskLevel::Medium,
            });
        }
        if flag(context, "regulated") {
            scores.push(RiskScore {
                category: RiskCategory::Compliance,
                level: RiskLevel::High,
            });
        }
        if flag(context, "sensitive_data") {
            scores.push(RiskScore {
                category: RiskCategory::Security,
                level: RiskLevel::High,
            });
        }
        if flag(context, "critical_system") {
            scores.push(RiskScore {
                category: RiskCategory::Operational,
                level: RiskLevel::High,
            });
        }
        if flag(context, "resource_intensive") {
            scores.push(RiskScore {
                category: RiskCategory::Performance,
                level: RiskLevel::Medium,
            });
        }

        RiskAssessment { scores }
    }

    /// Whether every scored category falls within the active profile's
    /// tolerance. Returns the first category/level pair that exceeds
    /// tolerance, if any.
    pub fn within_tolerance(&self, assessment: &RiskAssessment) -> Result<(), RiskScore> {
        for score in &assessment.scores {
            if score.level > self.profile.max_for(score.category) {
                return Err(*score);
            }
        }
        Ok(())
    }
}

fn flag(context: &Context, key: &str) -> bool {
    context.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
