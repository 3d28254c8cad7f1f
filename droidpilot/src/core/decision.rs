//! Stage 2 decision policy: PLAN vs RESPONSE, strict priority, first match wins.

use serde::Serialize;

use crate::core::progress::ObjectiveProgress;
use crate::core::types::{Decision, DecisionResult, StateAnalysis};

/// Which policy rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    /// A blocking obstacle must be cleared first.
    Obstacle,
    /// Crash, freeze or repeated no-op with no obstacle in the way.
    AppDefect,
    /// The active step still needs work.
    NotAchieved,
    /// The active step is achieved and was the last unsatisfied objective.
    FinalObjectiveAchieved,
    /// The active step is achieved and more objectives remain.
    ObjectiveAchieved,
    /// Every objective was already satisfied before this pass.
    AllSatisfied,
}

/// Policy decision plus the rule that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub rule: DecisionRule,
    pub result: DecisionResult,
}

impl PolicyDecision {
    fn new(rule: DecisionRule, decision: Decision, reason: String) -> Self {
        Self {
            rule,
            result: DecisionResult { decision, reason },
        }
    }

    pub fn decision(&self) -> Decision {
        self.result.decision
    }
}

/// Evaluate the decision policy without mutating `progress`.
///
/// Rules 4 and 5 preview completion through
/// [`ObjectiveProgress::is_satisfied`] with the active step overridden; the
/// caller applies `mark_completed` afterwards.
pub fn decide(analysis: &StateAnalysis, progress: &ObjectiveProgress) -> PolicyDecision {
    if let Some(obstacle) = analysis.obstacle() {
        return PolicyDecision::new(
            DecisionRule::Obstacle,
            Decision::Plan,
            format!("blocking obstacle must be cleared first: {obstacle}"),
        );
    }
    if analysis.defect_signal() {
        return PolicyDecision::new(
            DecisionRule::AppDefect,
            Decision::Response,
            analysis.defect_reason(),
        );
    }
    if progress.is_satisfied(false) {
        return PolicyDecision::new(
            DecisionRule::AllSatisfied,
            Decision::Response,
            "all objective steps are satisfied".to_string(),
        );
    }
    let Some(step) = progress.current() else {
        return PolicyDecision::new(
            DecisionRule::NotAchieved,
            Decision::Plan,
            "no active objective step; activating the next one".to_string(),
        );
    };
    if !analysis.current_step_achieved {
        return PolicyDecision::new(
            DecisionRule::NotAchieved,
            Decision::Plan,
            format!(
                "step {} not yet achieved: {}",
                step.index(),
                analysis.current_step_evidence.trim()
            ),
        );
    }
    if progress.is_satisfied(true) {
        return PolicyDecision::new(
            DecisionRule::FinalObjectiveAchieved,
            Decision::Response,
            format!(
                "final objective step {} achieved: {}",
                step.index(),
                analysis.current_step_evidence.trim()
            ),
        );
    }
    PolicyDecision::new(
        DecisionRule::ObjectiveAchieved,
        Decision::Plan,
        format!(
            "step {} achieved, moving to the next objective: {}",
            step.index(),
            analysis.current_step_evidence.trim()
        ),
    )
}
