//! Objective progress tracker: the single-writer aggregate for one run.
//!
//! [`ObjectiveProgress`] owns the ordered step list, the active step pointer,
//! and each step's execution plan cursor. Fields are private; every mutation
//! goes through the methods below so the ordering invariants hold for all
//! reachable states (see [`crate::core::invariants::validate_progress`]).

use serde::Serialize;

use crate::core::types::{OutcomeStatus, StepKind, StepStatus};

/// One action dispatched while a step was active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedAction {
    pub action: String,
    pub outcome: String,
    pub success: bool,
    /// Executed in dialog mode; did not advance the plan cursor.
    pub obstacle_clearing: bool,
}

/// One atomic unit of the user's goal, or a synthesized recovery unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectiveStep {
    index: usize,
    description: String,
    kind: StepKind,
    status: StepStatus,
    execution_plan: Vec<String>,
    plan_cursor: usize,
    dialog_mode: bool,
    dialog_count: u32,
    parent_index: Option<usize>,
    blocking_reason: Option<String>,
    completion_evidence: Option<String>,
    failure_reason: Option<String>,
    executed_actions: Vec<ExecutedAction>,
}

impl ObjectiveStep {
    fn new(index: usize, description: String, kind: StepKind) -> Self {
        Self {
            index,
            description,
            kind,
            status: StepStatus::Pending,
            execution_plan: Vec::new(),
            plan_cursor: 0,
            dialog_mode: false,
            dialog_count: 0,
            parent_index: None,
            blocking_reason: None,
            completion_evidence: None,
            failure_reason: None,
            executed_actions: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn execution_plan(&self) -> &[String] {
        &self.execution_plan
    }

    pub fn plan_cursor(&self) -> usize {
        self.plan_cursor
    }

    pub fn dialog_mode(&self) -> bool {
        self.dialog_mode
    }

    pub fn dialog_count(&self) -> u32 {
        self.dialog_count
    }

    pub fn parent_index(&self) -> Option<usize> {
        self.parent_index
    }

    pub fn blocking_reason(&self) -> Option<&str> {
        self.blocking_reason.as_deref()
    }

    pub fn completion_evidence(&self) -> Option<&str> {
        self.completion_evidence.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn executed_actions(&self) -> &[ExecutedAction] {
        &self.executed_actions
    }

    /// Unconsumed actions of this step's plan.
    pub fn remaining_plan(&self) -> &[String] {
        let cursor = self.plan_cursor.min(self.execution_plan.len());
        &self.execution_plan[cursor..]
    }

    fn is_objective(&self) -> bool {
        self.kind == StepKind::Objective
    }
}

/// Aggregate root tracking the ordered objective steps of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectiveProgress {
    original_input: String,
    steps: Vec<ObjectiveStep>,
    current_index: usize,
}

impl ObjectiveProgress {
    /// Create a tracker with every step `pending`. Call
    /// [`advance_to_next_objective`](Self::advance_to_next_objective) to activate the first.
    pub fn new(original_input: impl Into<String>, objectives: Vec<String>) -> Self {
        let steps = objectives
            .into_iter()
            .enumerate()
            .map(|(index, description)| ObjectiveStep::new(index, description, StepKind::Objective))
            .collect();
        Self {
            original_input: original_input.into(),
            steps,
            current_index: 0,
        }
    }

    pub fn original_input(&self) -> &str {
        &self.original_input
    }

    pub fn steps(&self) -> &[ObjectiveStep] {
        &self.steps
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// The active (`in_progress`) step, or `None` before start and after exhaustion.
    pub fn current(&self) -> Option<&ObjectiveStep> {
        self.steps
            .get(self.current_index)
            .filter(|step| step.status == StepStatus::InProgress)
    }

    fn current_mut(&mut self) -> Option<&mut ObjectiveStep> {
        self.steps
            .get_mut(self.current_index)
            .filter(|step| step.status == StepStatus::InProgress)
    }

    /// Replace the active step's plan and rewind its cursor.
    pub fn set_plan(&mut self, steps: Vec<String>) {
        if let Some(step) = self.current_mut() {
            step.execution_plan = steps;
            step.plan_cursor = 0;
        }
    }

    /// Unconsumed actions of the active step; empty when there is no active step.
    pub fn remaining_plan(&self) -> &[String] {
        self.current().map(ObjectiveStep::remaining_plan).unwrap_or(&[])
    }

    /// Freeze the active step's plan cursor while an obstacle is cleared.
    ///
    /// Idempotent: the first reason is kept while the mode stays on.
    pub fn enter_dialog_mode(&mut self, reason: &str) {
        if let Some(step) = self.current_mut()
            && !step.dialog_mode
        {
            step.dialog_mode = true;
            step.blocking_reason = Some(reason.to_string());
        }
    }

    /// Resume plan progress on the active step. Idempotent.
    pub fn exit_dialog_mode(&mut self) {
        if let Some(step) = self.current_mut() {
            step.dialog_mode = false;
        }
    }

    /// True when the active step is clearing an obstacle.
    pub fn in_dialog_mode(&self) -> bool {
        self.current().is_some_and(|step| step.dialog_mode)
    }

    /// Record one executed action against the active step.
    ///
    /// Outside dialog mode the plan cursor advances by one (never past the plan
    /// end). In dialog mode the cursor stays put, `dialog_count` grows and the
    /// open recovery step's dismissal cursor advances instead.
    pub fn record_action(&mut self, action: &str, outcome: &str, success: bool) {
        let recovery = self.open_recovery_position();
        let Some(step) = self.current_mut() else {
            return;
        };
        let obstacle_clearing = step.dialog_mode;
        if obstacle_clearing {
            step.dialog_count += 1;
        } else if step.plan_cursor < step.execution_plan.len() {
            step.plan_cursor += 1;
        }
        step.executed_actions.push(ExecutedAction {
            action: action.to_string(),
            outcome: outcome.to_string(),
            success,
            obstacle_clearing,
        });

        if obstacle_clearing && let Some(position) = recovery {
            let recovery = &mut self.steps[position];
            if recovery.plan_cursor < recovery.execution_plan.len() {
                recovery.plan_cursor += 1;
            }
        }
    }

    /// Mark the active step completed. No-op when there is no active step.
    pub fn mark_completed(&mut self, evidence: &str) {
        if let Some(step) = self.current_mut() {
            step.status = StepStatus::Completed;
            step.dialog_mode = false;
            step.completion_evidence = Some(evidence.to_string());
        }
    }

    /// Mark the active step failed. No-op when there is no active step.
    pub fn mark_failed(&mut self, reason: &str) {
        if let Some(step) = self.current_mut() {
            step.status = StepStatus::Failed;
            step.dialog_mode = false;
            step.failure_reason = Some(reason.to_string());
        }
    }

    /// Activate the next `pending`/`in_progress` objective step at or after the
    /// current position. Returns false when none remain.
    pub fn advance_to_next_objective(&mut self) -> bool {
        let start = self.current_index.min(self.steps.len());
        let next = self.steps[start..]
            .iter()
            .position(|step| {
                step.is_objective()
                    && matches!(step.status, StepStatus::Pending | StepStatus::InProgress)
            })
            .map(|offset| start + offset);
        match next {
            Some(index) => {
                self.steps[index].status = StepStatus::InProgress;
                self.current_index = index;
                true
            }
            None => false,
        }
    }

    /// Insert a recovery step right after the active step and renumber the tail.
    ///
    /// Returns the new step's index. `current_index` is unchanged.
    pub fn insert_recovery(
        &mut self,
        parent_index: usize,
        description: &str,
        reason: &str,
        plan: Vec<String>,
    ) -> Result<usize, String> {
        if self.steps.is_empty() {
            return Err("cannot insert a recovery step into an empty step list".to_string());
        }
        let insert_at = self.current_index + 1;
        if parent_index >= insert_at {
            return Err(format!(
                "recovery parent {parent_index} must precede insertion index {insert_at}"
            ));
        }

        for step in &mut self.steps[insert_at..] {
            step.index += 1;
        }
        for step in &mut self.steps {
            if let Some(parent) = step.parent_index.as_mut()
                && *parent >= insert_at
            {
                *parent += 1;
            }
        }

        let mut recovery =
            ObjectiveStep::new(insert_at, description.to_string(), StepKind::Recovery);
        recovery.parent_index = Some(parent_index);
        recovery.blocking_reason = Some(reason.to_string());
        recovery.execution_plan = plan;
        self.steps.insert(insert_at, recovery);
        Ok(insert_at)
    }

    /// Position of the most recent open recovery step protecting the active step.
    fn open_recovery_position(&self) -> Option<usize> {
        let parent = self.current()?.index;
        self.steps.iter().rposition(|step| {
            step.kind == StepKind::Recovery
                && step.parent_index == Some(parent)
                && !step.status.is_terminal()
        })
    }

    /// The open recovery step protecting the active step, if any.
    pub fn open_recovery(&self) -> Option<&ObjectiveStep> {
        self.open_recovery_position()
            .map(|position| &self.steps[position])
    }

    /// Dismissal actions of the open recovery step not yet executed.
    pub fn remaining_dismissal(&self) -> &[String] {
        self.open_recovery()
            .map(ObjectiveStep::remaining_plan)
            .unwrap_or(&[])
    }

    /// Append freshly planned dismissal actions to the open recovery step.
    ///
    /// Returns false when no recovery step is open.
    pub fn extend_dismissal(&mut self, actions: Vec<String>) -> bool {
        match self.open_recovery_position() {
            Some(position) => {
                self.steps[position].execution_plan.extend(actions);
                true
            }
            None => false,
        }
    }

    /// Close the most recent open recovery step protecting the active step.
    ///
    /// Its cursor keeps the number of dismissal actions that actually ran.
    /// Returns the closed step's index, if any.
    pub fn resolve_recovery(&mut self, evidence: &str) -> Option<usize> {
        let position = self.open_recovery_position()?;
        let step = &mut self.steps[position];
        step.status = StepStatus::Completed;
        step.completion_evidence = Some(evidence.to_string());
        Some(step.index)
    }

    /// True iff every objective step is completed.
    ///
    /// With `override_current_achieved`, the active step counts as completed for
    /// this check only. An empty objective list is never satisfied.
    pub fn is_satisfied(&self, override_current_achieved: bool) -> bool {
        let active = self.current().map(ObjectiveStep::index);
        let mut objectives = self.steps.iter().filter(|step| step.is_objective()).peekable();
        if objectives.peek().is_none() {
            return false;
        }
        objectives.all(|step| {
            step.status == StepStatus::Completed
                || (override_current_achieved && Some(step.index) == active)
        })
    }

    pub fn completed_objectives(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.is_objective() && step.status == StepStatus::Completed)
            .count()
    }

    pub fn total_objectives(&self) -> usize {
        self.steps.iter().filter(|step| step.is_objective()).count()
    }

    /// Terminate the run: settle the active step according to `status` and mark
    /// every other non-terminal step skipped.
    pub fn close(&mut self, status: OutcomeStatus, reason: &str) {
        match status {
            OutcomeStatus::Pass => self.mark_completed(reason),
            OutcomeStatus::Fail => self.mark_failed(reason),
            OutcomeStatus::NeedsReview => {}
        }
        for step in &mut self.steps {
            if !step.status.is_terminal() {
                step.status = StepStatus::Skipped;
                step.dialog_mode = false;
            }
        }
    }

    /// One-line progress summary for logs and diagnostics.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{}/{} objectives completed",
            self.completed_objectives(),
            self.total_objectives()
        );
        if let Some(step) = self.current() {
            out.push_str(&format!(
                ", active [{}] {} (plan {}/{}",
                step.index,
                step.description,
                step.plan_cursor,
                step.execution_plan.len()
            ));
            if step.dialog_mode {
                out.push_str(", clearing obstacle");
            }
            out.push(')');
        }
        out
    }

    /// Step list with statuses, as shown to the oracle.
    pub fn format_steps(&self) -> String {
        let mut lines = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let marker = match step.status {
                StepStatus::Completed => "[x]",
                StepStatus::InProgress => "[>]",
                StepStatus::Failed => "[!]",
                StepStatus::Skipped => "[-]",
                StepStatus::Pending => "[ ]",
            };
            let mut line = format!("{marker} {}. {}", step.index, step.description);
            if step.kind == StepKind::Recovery {
                line.push_str(" (recovery)");
            }
            if let Some(evidence) = &step.completion_evidence {
                line.push_str(&format!(" -- {evidence}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Plan progress of the active step with done/current/pending markers.
    pub fn format_plan_progress(&self) -> Option<String> {
        let step = self.current()?;
        if step.execution_plan.is_empty() {
            return Some("(no plan yet)".to_string());
        }
        let mut lines = Vec::with_capacity(step.execution_plan.len() + 1);
        lines.push(format!(
            "{} of {} actions done",
            step.plan_cursor,
            step.execution_plan.len()
        ));
        for (i, action) in step.execution_plan.iter().enumerate() {
            let marker = if i < step.plan_cursor {
                "done"
            } else if i == step.plan_cursor {
                "current"
            } else {
                "pending"
            };
            lines.push(format!("[{marker}] {}. {action}", i + 1));
        }
        if let Some(reason) = step.blocking_reason.as_deref().filter(|_| step.dialog_mode) {
            lines.push(format!("plan frozen while clearing obstacle: {reason}"));
        }
        Some(lines.join("\n"))
    }

    /// Executed actions across all steps, oldest first.
    pub fn format_history(&self, limit: usize) -> String {
        let entries: Vec<String> = self
            .steps
            .iter()
            .flat_map(|step| {
                step.executed_actions.iter().map(move |action| {
                    let tag = if action.obstacle_clearing {
                        " (obstacle)"
                    } else {
                        ""
                    };
                    let result = if action.success { "ok" } else { "failed" };
                    format!(
                        "[{}] {}{tag}: {result}: {}",
                        step.index, action.action, action.outcome
                    )
                })
            })
            .collect();
        let skip = entries.len().saturating_sub(limit);
        entries[skip..].join("\n")
    }
}
