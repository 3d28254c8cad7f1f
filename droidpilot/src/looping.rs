//! Orchestration loop for `droidpilot run`.
//!
//! `Planning → Executing → Replanning → {Executing | Terminated}`. Every
//! termination path produces a [`FinalVerdict`] with a reason; `Err` is reserved
//! for setup failures before the loop starts.

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::analyzer::PersistentInconsistencyError;
use crate::agents::decomposer::DecomposerAgent;
use crate::agents::replanner::{ReplanEngine, ReplanPass};
use crate::core::budget::{BudgetExhausted, IterationBudget};
use crate::core::invariants::validate_progress;
use crate::core::progress::{ExecutedAction, ObjectiveProgress};
use crate::core::types::{
    FinalVerdict, OutcomeStatus, Plan, ReplanOutput, StateAnalysis, Termination,
};
use crate::io::config::EngineConfig;
use crate::io::device::{ActionExecutor, ScreenProvider, Snapshot};
use crate::io::oracle::Oracle;
use crate::io::prompt::PromptBuilder;
use crate::io::report::{IterationRecord, Phase, ReportEvent, ReportSink, record_best_effort};
use crate::step::{ActionFailedError, StepRunner};

/// Summary of one test run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: OutcomeStatus,
    pub reason: String,
    pub termination: Termination,
    /// Replanning passes charged to `max_replan_count`.
    pub replan_count: u32,
    /// Replanning passes charged to `max_dialog_iterations`.
    pub dialog_iterations: u32,
    /// Screen re-captures spent on perception inconsistencies, summed over the run.
    pub inconsistency_retries: u32,
    /// Stage 1–3 passes, including the initial planning pass.
    pub iterations: u32,
    pub progress: ObjectiveProgress,
    pub failure_analysis: Option<String>,
}

enum LoopState {
    Planning,
    Executing(Plan),
    Replanning,
    Terminated(FinalVerdict),
}

/// Collaborators for one run.
pub struct Collaborators<'a, O: ?Sized, S: ?Sized, A: ?Sized, R: ?Sized> {
    pub oracle: &'a O,
    pub screen: &'a S,
    pub actor: &'a A,
    pub sink: &'a R,
}

/// Run `procedure` to a verdict.
#[instrument(skip_all)]
pub fn run_test<O, S, A, R>(
    procedure: &str,
    collaborators: &Collaborators<'_, O, S, A, R>,
    config: &EngineConfig,
) -> Result<RunOutcome>
where
    O: Oracle + ?Sized,
    S: ScreenProvider + ?Sized,
    A: ActionExecutor + ?Sized,
    R: ReportSink + ?Sized,
{
    if procedure.trim().is_empty() {
        bail!("test procedure is empty");
    }
    let Collaborators {
        oracle,
        screen,
        actor,
        sink,
    } = *collaborators;
    let prompts = PromptBuilder::new(config.prompt_budget_bytes)?;
    let engine = ReplanEngine::new(oracle, screen, &prompts, config);
    let runner = StepRunner::new(actor, config.settle_delay());
    let mut budget = IterationBudget::new(
        config.max_replan_count,
        config.count_dialog_iterations,
        config.max_dialog_iterations,
    );

    let mut progress = match DecomposerAgent::new(&prompts, config.knowhow()).run(oracle, procedure)
    {
        Ok(progress) => progress,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "decomposition failed");
            let verdict = FinalVerdict::fail(
                Termination::CollaboratorError,
                format!("decompose procedure: {err:#}"),
            );
            let outcome = RunOutcome {
                status: verdict.status,
                reason: verdict.reason,
                termination: verdict.termination,
                replan_count: 0,
                dialog_iterations: 0,
                inconsistency_retries: 0,
                iterations: 0,
                progress: ObjectiveProgress::new(procedure.trim(), Vec::new()),
                failure_analysis: None,
            };
            record_best_effort(sink, &ReportEvent::RunFinished(Box::new(outcome.clone())));
            return Ok(outcome);
        }
    };
    progress.advance_to_next_objective();
    record_best_effort(
        sink,
        &ReportEvent::RunStarted {
            goal: progress.original_input().to_string(),
            objectives: progress
                .steps()
                .iter()
                .map(|step| step.description().to_string())
                .collect(),
        },
    );

    let mut state = LoopState::Planning;
    let mut iterations = 0u32;
    let mut inconsistency_retries = 0u32;
    // `observed` is the latest analyzed snapshot; `previous` the one before the last action.
    let mut observed: Option<Snapshot> = None;
    let mut previous: Option<Snapshot> = None;
    let mut last_action: Option<ExecutedAction> = None;
    let mut last_analysis: Option<StateAnalysis> = None;

    let verdict = loop {
        state = match state {
            LoopState::Terminated(verdict) => break verdict,
            LoopState::Executing(plan) => {
                let (Some(action), Some(snapshot)) = (plan.steps.first(), observed.take()) else {
                    info!("no action to execute; replanning");
                    last_action = None;
                    state = LoopState::Replanning;
                    continue;
                };
                match runner.run(&mut progress, action, &snapshot) {
                    Ok(executed) => {
                        last_action = Some(executed);
                        previous = Some(snapshot);
                        LoopState::Replanning
                    }
                    Err(err) => LoopState::Terminated(classify_error(&err)),
                }
            }
            pass_state @ (LoopState::Planning | LoopState::Replanning) => {
                let phase = match pass_state {
                    LoopState::Planning => Phase::Planning,
                    _ => Phase::Replanning,
                };
                if phase == Phase::Replanning {
                    let after_dialog = last_action.as_ref().is_some_and(|a| a.obstacle_clearing);
                    if let Err(exhausted) = budget.charge(after_dialog) {
                        break budget_verdict(exhausted, &progress);
                    }
                }
                iterations += 1;

                match engine.replan(&mut progress, previous.as_ref()) {
                    Ok(pass) => {
                        inconsistency_retries += pass.inconsistency_retries;
                        info!(
                            iteration = iterations,
                            replans = budget.replans(),
                            snapshot = pass.snapshot.id,
                            "replan pass complete"
                        );
                        let record = iteration_record(
                            iterations,
                            phase,
                            last_action.clone(),
                            &pass,
                            &progress,
                        );
                        record_best_effort(sink, &ReportEvent::Iteration(Box::new(record)));

                        let violations = validate_progress(&progress);
                        let ReplanPass {
                            snapshot,
                            analysis,
                            output,
                            ..
                        } = pass;
                        observed = Some(snapshot);
                        last_analysis = Some(analysis);
                        if !violations.is_empty() {
                            LoopState::Terminated(FinalVerdict::fail(
                                Termination::CollaboratorError,
                                format!("progress invariants violated: {}", violations.join("; ")),
                            ))
                        } else {
                            match output {
                                ReplanOutput::Plan(plan) => LoopState::Executing(plan),
                                ReplanOutput::Verdict(verdict) => LoopState::Terminated(verdict),
                            }
                        }
                    }
                    Err(err) => LoopState::Terminated(classify_error(&err)),
                }
            }
        };
    };

    progress.close(verdict.status, &verdict.reason);
    let failure_analysis = (verdict.status == OutcomeStatus::Fail
        && config.analyze_failures
        && matches!(
            verdict.termination,
            Termination::Verdict
                | Termination::AppDefect
                | Termination::PersistentInconsistency
                | Termination::ActionFailed
        ))
    .then(|| engine.analyze_failure(&progress, last_analysis.as_ref(), &verdict));

    info!(
        status = verdict.status.as_str(),
        termination = ?verdict.termination,
        iterations,
        reason = %verdict.reason,
        "run finished"
    );
    let outcome = RunOutcome {
        status: verdict.status,
        reason: verdict.reason,
        termination: verdict.termination,
        replan_count: budget.replans(),
        dialog_iterations: budget.dialog_iterations(),
        inconsistency_retries,
        iterations,
        progress,
        failure_analysis,
    };
    record_best_effort(sink, &ReportEvent::RunFinished(Box::new(outcome.clone())));
    Ok(outcome)
}

fn iteration_record(
    iteration: u32,
    phase: Phase,
    last_action: Option<ExecutedAction>,
    pass: &ReplanPass,
    progress: &ObjectiveProgress,
) -> IterationRecord {
    IterationRecord {
        iteration,
        phase,
        snapshot_id: pass.snapshot.id,
        last_action,
        analysis: pass.analysis.clone(),
        inconsistency_retries: pass.inconsistency_retries,
        rule: pass.rule,
        decision: pass.decision.clone(),
        output: pass.output.clone(),
        progress: progress.clone(),
    }
}

fn budget_verdict(exhausted: BudgetExhausted, progress: &ObjectiveProgress) -> FinalVerdict {
    let termination = match exhausted {
        BudgetExhausted::Replans { .. } => Termination::ReplanLimit,
        BudgetExhausted::DialogIterations { .. } => Termination::DialogLimit,
    };
    warn!(?exhausted, "iteration budget exhausted");
    FinalVerdict::fail(
        termination,
        format!("{}; {}", exhausted.describe(), progress.summary()),
    )
}

/// Map a fatal pass or action error onto a fail verdict.
fn classify_error(err: &anyhow::Error) -> FinalVerdict {
    if let Some(inconsistency) = err.downcast_ref::<PersistentInconsistencyError>() {
        return FinalVerdict::fail(Termination::PersistentInconsistency, inconsistency.to_string());
    }
    if let Some(failed) = err.downcast_ref::<ActionFailedError>() {
        return FinalVerdict::fail(Termination::ActionFailed, failed.to_string());
    }
    warn!(err = %format!("{err:#}"), "collaborator failed");
    FinalVerdict::fail(Termination::CollaboratorError, format!("{err:#}"))
}
