//! Shared deterministic types for the replan engine.
//!
//! These are the structured contracts exchanged with the reasoning oracle and
//! between engine stages. They carry no behavior beyond small accessors.

use serde::{Deserialize, Serialize};

/// Origin of an objective step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Authored by the user as part of the test procedure.
    Objective,
    /// Synthesized by the engine to clear a blocking obstacle.
    Recovery,
}

/// Lifecycle status of an objective step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// `completed`, `failed` and `skipped` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Per-iteration screen judgment produced by Stage 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAnalysis {
    pub screen_changes: String,
    pub screen_type: String,
    pub main_elements: String,
    #[serde(default)]
    pub blocking_obstacle: Option<String>,
    #[serde(default)]
    pub perception_inconsistency: Option<String>,
    pub app_defect_detected: bool,
    #[serde(default)]
    pub app_defect_reason: Option<String>,
    pub is_stuck: bool,
    pub current_step_achieved: bool,
    pub current_step_evidence: String,
    #[serde(default)]
    pub suggested_next_action: Option<String>,
}

impl StateAnalysis {
    /// Blocking obstacle description, ignoring blank strings.
    pub fn obstacle(&self) -> Option<&str> {
        non_blank(self.blocking_obstacle.as_deref())
    }

    /// Perception inconsistency description, ignoring blank strings.
    pub fn inconsistency(&self) -> Option<&str> {
        non_blank(self.perception_inconsistency.as_deref())
    }

    /// True when the screen shows a crash, freeze or repeated no-op.
    pub fn defect_signal(&self) -> bool {
        self.app_defect_detected || self.is_stuck
    }

    pub fn defect_reason(&self) -> String {
        if let Some(reason) = non_blank(self.app_defect_reason.as_deref()) {
            return reason.to_string();
        }
        if self.is_stuck {
            return format!("screen is stuck: {}", self.screen_changes.trim());
        }
        "application defect detected".to_string()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Stage 2 outcome: keep working or conclude the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Plan,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub decision: Decision,
    pub reason: String,
}

/// Ordered action descriptions for the active step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

/// Verdict requested from the oracle when the engine decides `RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pass,
    NeedsReview,
    Fail,
}

/// Independent verification of a pass verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub status: EvaluationStatus,
    pub reason: String,
}

/// Root-cause report attached to failed runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub category: FailureCategory,
    pub facts: Vec<String>,
    pub root_cause: String,
    pub recommended_actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TestCase,
    Application,
    Framework,
}

impl FailureAnalysis {
    pub fn render(&self) -> String {
        let category = match self.category {
            FailureCategory::TestCase => "test case problem",
            FailureCategory::Application => "application problem",
            FailureCategory::Framework => "framework problem",
        };
        let mut out = format!("category: {category}\nroot cause: {}\n", self.root_cause);
        if !self.facts.is_empty() {
            out.push_str("facts:\n");
            for fact in &self.facts {
                out.push_str(&format!("- {fact}\n"));
            }
        }
        if !self.recommended_actions.is_empty() {
            out.push_str("recommended actions:\n");
            for action in &self.recommended_actions {
                out.push_str(&format!("- {action}\n"));
            }
        }
        out
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Pass,
    Fail,
    NeedsReview,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::NeedsReview => "needs-review",
        }
    }
}

/// Which path ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The oracle verdict was accepted as-is (or corrected to fail).
    Verdict,
    /// A pass verdict could not be confirmed by independent verification.
    VerificationDowngrade,
    AppDefect,
    PersistentInconsistency,
    ReplanLimit,
    DialogLimit,
    ActionFailed,
    CollaboratorError,
}

/// Concluding verdict emitted by Stage 3 or forced by the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalVerdict {
    pub status: OutcomeStatus,
    pub reason: String,
    pub termination: Termination,
}

impl FinalVerdict {
    pub fn fail(termination: Termination, reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Fail,
            reason: reason.into(),
            termination,
        }
    }
}

/// Output of one replan pass: the loop branches on this at a single site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplanOutput {
    Plan(Plan),
    Verdict(FinalVerdict),
}

/// Purpose of an oracle call; selects the prompt template and result schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Decompose,
    Analyze,
    Decide,
    Plan,
    Dismiss,
    Verdict,
    Verify,
    FailureAnalysis,
    Act,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decompose => "decompose",
            Self::Analyze => "analyze",
            Self::Decide => "decide",
            Self::Plan => "plan",
            Self::Dismiss => "dismiss",
            Self::Verdict => "verdict",
            Self::Verify => "verify",
            Self::FailureAnalysis => "failure_analysis",
            Self::Act => "act",
        }
    }
}
