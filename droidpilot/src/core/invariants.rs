//! Structural invariants of [`ObjectiveProgress`] not enforced by the type system.

use crate::core::progress::ObjectiveProgress;
use crate::core::types::{StepKind, StepStatus};

/// Check tracker invariants and return one message per violation:
/// - Indices are dense and match list positions
/// - At most one step is `in_progress`, and only at `current_index`
/// - No `in_progress` step means all steps pending (start) or every objective
///   step terminal (end)
/// - Recovery steps reference a strictly smaller parent index
/// - Plan cursors never exceed their plan length
/// - Terminal steps are frozen: no dialog mode left on
pub fn validate_progress(progress: &ObjectiveProgress) -> Vec<String> {
    let mut errors = Vec::new();
    let steps = progress.steps();

    for (position, step) in steps.iter().enumerate() {
        if step.index() != position {
            errors.push(format!(
                "step at position {position} has index {}",
                step.index()
            ));
        }
        if step.plan_cursor() > step.execution_plan().len() {
            errors.push(format!(
                "step {}: plan_cursor {} exceeds plan length {}",
                position,
                step.plan_cursor(),
                step.execution_plan().len()
            ));
        }
        if step.status().is_terminal() && step.dialog_mode() {
            errors.push(format!(
                "terminal step {position} ({}) is still in dialog mode",
                step.status().as_str()
            ));
        }
        match (step.kind(), step.parent_index()) {
            (StepKind::Recovery, None) => {
                errors.push(format!("recovery step {position} has no parent"));
            }
            (StepKind::Recovery, Some(parent)) if parent >= position => {
                errors.push(format!(
                    "recovery step {position}: parent {parent} must precede it"
                ));
            }
            (StepKind::Objective, Some(parent)) => {
                errors.push(format!(
                    "objective step {position} must not have a parent (got {parent})"
                ));
            }
            _ => {}
        }
    }

    let active: Vec<usize> = steps
        .iter()
        .filter(|step| step.status() == StepStatus::InProgress)
        .map(|step| step.index())
        .collect();
    match active.as_slice() {
        [] => {
            let all_pending = steps.iter().all(|s| s.status() == StepStatus::Pending);
            let objectives_terminal = steps
                .iter()
                .filter(|s| s.kind() == StepKind::Objective)
                .all(|s| s.status().is_terminal());
            if !all_pending && !objectives_terminal {
                errors.push(
                    "no step is in_progress but objective steps remain unfinished".to_string(),
                );
            }
        }
        [index] => {
            if *index != progress.current_index() {
                errors.push(format!(
                    "in_progress step {index} differs from current_index {}",
                    progress.current_index()
                ));
            }
        }
        many => {
            errors.push(format!("multiple steps in_progress: {many:?}"));
        }
    }

    errors
}
