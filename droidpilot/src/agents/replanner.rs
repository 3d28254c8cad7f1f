//! One replanning pass: Stage 1 analysis, Stage 2 decision and Stage 3 output.
//!
//! The pass owns every tracker mutation driven by the analysis (completion,
//! advancement, dialog mode, recovery steps, plan replacement). The loop only
//! executes what comes back and records the action outcome.

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::decision::{DecisionRule, decide};
use crate::core::progress::ObjectiveProgress;
use crate::core::types::{
    CallKind, Decision, DecisionResult, Evaluation, EvaluationStatus, FailureAnalysis,
    FinalVerdict, OutcomeStatus, Plan, ReplanOutput, StateAnalysis, Termination, Verdict,
    VerdictStatus,
};
use crate::io::config::{DecisionMode, EngineConfig};
use crate::io::device::{ScreenProvider, Snapshot, capture_with_retry};
use crate::io::oracle::{Oracle, OracleRequest, infer_json};
use crate::io::prompt::{PromptBuilder, PromptInputs};

use super::analyzer::AnalyzerAgent;
use super::{
    DECISION_SCHEMA, EVALUATION_SCHEMA, FAILURE_ANALYSIS_SCHEMA, PLAN_SCHEMA, VERDICT_SCHEMA,
    clean_lines,
};

/// Everything one pass observed and produced.
#[derive(Debug, Clone)]
pub struct ReplanPass {
    pub snapshot: Snapshot,
    pub analysis: StateAnalysis,
    pub inconsistency_retries: u32,
    /// Policy rule behind the decision; `None` when the oracle decided.
    pub rule: Option<DecisionRule>,
    pub decision: DecisionResult,
    pub output: ReplanOutput,
}

/// Stages 1–3 over shared collaborators.
pub struct ReplanEngine<'a, O: ?Sized, S: ?Sized> {
    oracle: &'a O,
    screen: &'a S,
    prompts: &'a PromptBuilder,
    config: &'a EngineConfig,
}

impl<'a, O: Oracle + ?Sized, S: ScreenProvider + ?Sized> ReplanEngine<'a, O, S> {
    pub fn new(
        oracle: &'a O,
        screen: &'a S,
        prompts: &'a PromptBuilder,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            oracle,
            screen,
            prompts,
            config,
        }
    }

    /// Capture the screen and run one full pass against `progress`.
    ///
    /// `previous` is the snapshot observed before the last action; its
    /// screenshot is attached for change detection.
    #[instrument(skip_all, fields(step = progress.current_index()))]
    pub fn replan(
        &self,
        progress: &mut ObjectiveProgress,
        previous: Option<&Snapshot>,
    ) -> Result<ReplanPass> {
        let first = capture_with_retry(self.screen, &self.config.capture_retry())?;
        let observed = AnalyzerAgent::new(self.prompts, self.config).observe(
            self.oracle,
            self.screen,
            progress,
            first,
            previous,
        )?;
        let snapshot = observed.snapshot;
        let analysis = observed.analysis;

        if progress.in_dialog_mode() && analysis.obstacle().is_none() {
            progress.exit_dialog_mode();
            let resolved = progress.resolve_recovery(&analysis.current_step_evidence);
            info!(?resolved, "obstacle cleared; resuming plan");
        }

        let (rule, decision) = self.decide(&analysis, progress, &snapshot);
        info!(
            rule = ?rule,
            decision = ?decision.decision,
            reason = %decision.reason,
            "stage 2 decision"
        );

        let output = match decision.decision {
            Decision::Plan => self.plan(progress, &analysis, &snapshot)?,
            Decision::Response => self.respond(progress, &analysis, &snapshot),
        };

        Ok(ReplanPass {
            snapshot,
            analysis,
            inconsistency_retries: observed.inconsistency_retries,
            rule,
            decision,
            output,
        })
    }

    fn decide(
        &self,
        analysis: &StateAnalysis,
        progress: &ObjectiveProgress,
        snapshot: &Snapshot,
    ) -> (Option<DecisionRule>, DecisionResult) {
        let policy = decide(analysis, progress);
        if self.config.decision_mode == DecisionMode::Policy
            || policy.rule == DecisionRule::Obstacle
        {
            return (Some(policy.rule), policy.result);
        }

        let inputs = self.inputs(progress, snapshot).with_analysis(analysis);
        let result = self
            .prompts
            .build(CallKind::Decide, &inputs)
            .and_then(|prompt| {
                let request = OracleRequest::new(CallKind::Decide, prompt, DECISION_SCHEMA);
                infer_json::<_, DecisionResult>(self.oracle, &request)
            });
        match result {
            Ok(decision) => (None, decision),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "decision oracle failed; defaulting to PLAN");
                (
                    None,
                    DecisionResult {
                        decision: Decision::Plan,
                        reason: format!("decision unavailable, defaulting to PLAN: {err:#}"),
                    },
                )
            }
        }
    }

    fn plan(
        &self,
        progress: &mut ObjectiveProgress,
        analysis: &StateAnalysis,
        snapshot: &Snapshot,
    ) -> Result<ReplanOutput> {
        if let Some(obstacle) = analysis.obstacle() {
            return self.dismiss(progress, analysis, snapshot, obstacle);
        }

        if analysis.current_step_achieved && progress.current().is_some() {
            progress.mark_completed(&analysis.current_step_evidence);
        }
        if progress.current().is_none() && !progress.advance_to_next_objective() {
            info!("no objective left to plan; requesting a verdict");
            return Ok(self.respond(progress, analysis, snapshot));
        }

        let remaining = progress.remaining_plan();
        if !remaining.is_empty() {
            return Ok(ReplanOutput::Plan(Plan {
                steps: remaining.to_vec(),
                rationale: None,
            }));
        }

        let inputs = self.inputs(progress, snapshot).with_analysis(analysis);
        let prompt = self.prompts.build(CallKind::Plan, &inputs)?;
        let request = OracleRequest::new(CallKind::Plan, prompt, PLAN_SCHEMA);
        let plan: Plan = infer_json(self.oracle, &request).context("plan active step")?;
        let steps = clean_lines(plan.steps);
        if steps.is_empty() {
            bail!("planner returned an empty plan");
        }
        info!(actions = steps.len(), "fresh plan");
        progress.set_plan(steps.clone());
        Ok(ReplanOutput::Plan(Plan {
            steps,
            rationale: plan.rationale,
        }))
    }

    /// Enter dialog mode and ask for a short dismissal sequence; the frozen plan
    /// is left untouched.
    ///
    /// While the episode lasts, unexecuted dismissal actions on the recovery
    /// step are returned before the oracle is asked again.
    fn dismiss(
        &self,
        progress: &mut ObjectiveProgress,
        analysis: &StateAnalysis,
        snapshot: &Snapshot,
        obstacle: &str,
    ) -> Result<ReplanOutput> {
        let first_entry = progress.current().is_some() && !progress.in_dialog_mode();
        progress.enter_dialog_mode(obstacle);

        let pending = progress.remaining_dismissal();
        if !first_entry && !pending.is_empty() {
            return Ok(ReplanOutput::Plan(Plan {
                steps: pending.to_vec(),
                rationale: None,
            }));
        }

        let max_actions = self.config.max_dismissal_actions.max(1);
        let inputs = PromptInputs {
            max_actions,
            ..self.inputs(progress, snapshot)
        }
        .with_analysis(analysis);
        let prompt = self.prompts.build(CallKind::Dismiss, &inputs)?;
        let request = OracleRequest::new(CallKind::Dismiss, prompt, PLAN_SCHEMA);
        let plan: Plan = infer_json(self.oracle, &request).context("plan obstacle dismissal")?;
        let mut steps = clean_lines(plan.steps);
        if steps.is_empty() {
            bail!("dismissal planner returned no actions for obstacle: {obstacle}");
        }
        steps.truncate(max_actions);

        if first_entry {
            let parent = progress.current_index();
            let description = format!("clear obstacle: {obstacle}");
            let index = progress
                .insert_recovery(parent, &description, obstacle, steps.clone())
                .map_err(anyhow::Error::msg)?;
            info!(parent, recovery = index, obstacle, "entered dialog mode");
        } else {
            progress.extend_dismissal(steps.clone());
        }
        Ok(ReplanOutput::Plan(Plan {
            steps,
            rationale: plan.rationale,
        }))
    }

    /// Stage 3 RESPONSE. Oracle failures fall back to an empty plan so the loop
    /// keeps going under its budget.
    fn respond(
        &self,
        progress: &mut ObjectiveProgress,
        analysis: &StateAnalysis,
        snapshot: &Snapshot,
    ) -> ReplanOutput {
        if analysis.defect_signal() && analysis.obstacle().is_none() {
            return ReplanOutput::Verdict(FinalVerdict::fail(
                Termination::AppDefect,
                analysis.defect_reason(),
            ));
        }
        if analysis.current_step_achieved && progress.current().is_some() {
            progress.mark_completed(&analysis.current_step_evidence);
            progress.advance_to_next_objective();
        }

        let verdict = match self.request_verdict(progress, analysis, snapshot) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "verdict oracle failed; continuing with PLAN");
                return ReplanOutput::Plan(Plan {
                    steps: Vec::new(),
                    rationale: Some(format!("verdict unavailable: {err:#}")),
                });
            }
        };

        if verdict.status == VerdictStatus::Fail {
            return ReplanOutput::Verdict(FinalVerdict::fail(Termination::Verdict, verdict.reason));
        }
        if !progress.is_satisfied(false) {
            warn!("pass verdict with unsatisfied objectives; correcting to fail");
            return ReplanOutput::Verdict(FinalVerdict::fail(
                Termination::Verdict,
                format!(
                    "pass verdict rejected, {} of {} objectives completed: {}",
                    progress.completed_objectives(),
                    progress.total_objectives(),
                    verdict.reason
                ),
            ));
        }
        if !self.config.verify_pass {
            return ReplanOutput::Verdict(FinalVerdict {
                status: OutcomeStatus::Pass,
                reason: verdict.reason,
                termination: Termination::Verdict,
            });
        }
        ReplanOutput::Verdict(self.verify(progress, snapshot, verdict))
    }

    fn request_verdict(
        &self,
        progress: &ObjectiveProgress,
        analysis: &StateAnalysis,
        snapshot: &Snapshot,
    ) -> Result<Verdict> {
        let inputs = self.inputs(progress, snapshot).with_analysis(analysis);
        let prompt = self.prompts.build(CallKind::Verdict, &inputs)?;
        let request = OracleRequest::new(CallKind::Verdict, prompt, VERDICT_SCHEMA);
        infer_json(self.oracle, &request)
    }

    /// Independent check of a pass verdict; anything short of a confirmed pass
    /// becomes needs-review.
    fn verify(
        &self,
        progress: &ObjectiveProgress,
        snapshot: &Snapshot,
        verdict: Verdict,
    ) -> FinalVerdict {
        let inputs = PromptInputs {
            verdict: Some(verdict.reason.clone()),
            ..self.inputs(progress, snapshot)
        };
        let evaluation = self
            .prompts
            .build(CallKind::Verify, &inputs)
            .and_then(|prompt| {
                let request = OracleRequest::new(CallKind::Verify, prompt, EVALUATION_SCHEMA)
                    .with_images(snapshot.screenshot.iter().cloned().collect());
                infer_json::<_, Evaluation>(self.oracle, &request)
            });
        match evaluation {
            Ok(Evaluation {
                status: EvaluationStatus::Pass,
                ..
            }) => FinalVerdict {
                status: OutcomeStatus::Pass,
                reason: verdict.reason,
                termination: Termination::Verdict,
            },
            Ok(evaluation) => {
                warn!(status = ?evaluation.status, "verification did not confirm pass");
                FinalVerdict {
                    status: OutcomeStatus::NeedsReview,
                    reason: format!(
                        "verification did not confirm pass: {} (claimed: {})",
                        evaluation.reason, verdict.reason
                    ),
                    termination: Termination::VerificationDowngrade,
                }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "verification oracle failed");
                FinalVerdict {
                    status: OutcomeStatus::NeedsReview,
                    reason: format!(
                        "verification unavailable: {err:#} (claimed: {})",
                        verdict.reason
                    ),
                    termination: Termination::VerificationDowngrade,
                }
            }
        }
    }

    /// Root-cause analysis for a failed run, rendered as text.
    ///
    /// Oracle failures are reported inline and never surface as errors.
    pub fn analyze_failure(
        &self,
        progress: &ObjectiveProgress,
        analysis: Option<&StateAnalysis>,
        verdict: &FinalVerdict,
    ) -> String {
        let mut inputs = PromptInputs::from_state(
            progress,
            None,
            self.config.history_limit,
            self.config.knowhow(),
        );
        if let Some(analysis) = analysis {
            inputs = inputs.with_analysis(analysis);
        }
        inputs.verdict = Some(verdict.reason.clone());

        let result = self
            .prompts
            .build(CallKind::FailureAnalysis, &inputs)
            .and_then(|prompt| {
                let request =
                    OracleRequest::new(CallKind::FailureAnalysis, prompt, FAILURE_ANALYSIS_SCHEMA);
                infer_json::<_, FailureAnalysis>(self.oracle, &request)
            });
        match result {
            Ok(report) => report.render(),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failure analysis unavailable");
                format!("failure analysis unavailable: {err:#}")
            }
        }
    }

    fn inputs(&self, progress: &ObjectiveProgress, snapshot: &Snapshot) -> PromptInputs {
        PromptInputs::from_state(
            progress,
            Some(snapshot),
            self.config.history_limit,
            self.config.knowhow(),
        )
    }
}
