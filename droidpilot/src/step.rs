//! Execution step runner: performs the head action of a plan and records it.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::progress::{ExecutedAction, ObjectiveProgress};
use crate::io::device::{ActionExecutor, ActionReport, ActionRequest, Snapshot};

/// The action executor errored or reported `success: false`.
///
/// Fatal to the run; retries belong to the executor's own primitives.
#[derive(Debug, Clone, Error)]
#[error("action failed: {action}: {outcome}")]
pub struct ActionFailedError {
    pub action: String,
    pub outcome: String,
}

pub struct StepRunner<'a, A: ?Sized> {
    executor: &'a A,
    settle_delay: Duration,
}

impl<'a, A: ActionExecutor + ?Sized> StepRunner<'a, A> {
    pub fn new(executor: &'a A, settle_delay: Duration) -> Self {
        Self {
            executor,
            settle_delay,
        }
    }

    /// Perform `action` against `snapshot` and record the outcome on the active step.
    ///
    /// A failed action is still recorded before [`ActionFailedError`] is returned.
    #[instrument(skip_all, fields(action = %action))]
    pub fn run(
        &self,
        progress: &mut ObjectiveProgress,
        action: &str,
        snapshot: &Snapshot,
    ) -> Result<ExecutedAction> {
        let obstacle_clearing = progress.in_dialog_mode();
        let objective = progress
            .current()
            .map(|step| step.description().to_string())
            .unwrap_or_default();
        let request = ActionRequest {
            action,
            objective: &objective,
            goal: progress.original_input(),
            snapshot,
            obstacle_clearing,
        };

        let (success, outcome) = match self.executor.perform(&request) {
            Ok(ActionReport {
                success, outcome, ..
            }) => (success, outcome),
            Err(err) => (false, format!("{err:#}")),
        };
        progress.record_action(action, &outcome, success);
        let executed = progress
            .current()
            .and_then(|step| step.executed_actions().last().cloned())
            .unwrap_or_else(|| ExecutedAction {
                action: action.to_string(),
                outcome: outcome.clone(),
                success,
                obstacle_clearing,
            });

        if !success {
            warn!(%outcome, "action failed");
            return Err(ActionFailedError {
                action: action.to_string(),
                outcome,
            }
            .into());
        }
        info!(obstacle_clearing, %outcome, "action executed");

        if !self.settle_delay.is_zero() {
            debug!(
                settle_ms = self.settle_delay.as_millis() as u64,
                "waiting for screen to settle"
            );
            thread::sleep(self.settle_delay);
        }
        Ok(executed)
    }
}
