//! Loop-level scenario tests for full `run_test` executions.
//!
//! Each test scripts the oracle, screen and actor, drives one run to its
//! verdict, and checks the outcome, the per-iteration report records, and the
//! final tracker state.

use std::cell::RefCell;

use anyhow::Result;
use serde_json::Value;

use droidpilot::core::invariants::validate_progress;
use droidpilot::core::types::{CallKind, OutcomeStatus, StepKind, StepStatus, Termination};
use droidpilot::io::config::{DecisionMode, EngineConfig};
use droidpilot::io::device::ActionReport;
use droidpilot::io::report::{ReportEvent, ReportSink};
use droidpilot::looping::{Collaborators, RunOutcome, run_test};
use droidpilot::test_support::{
    ScriptedActor, ScriptedOracle, ScriptedScreen, analysis_json, decomposition_json,
    evaluation_json, plan_json, verdict_json,
};

const PROCEDURE: &str = "Open settings, then enable wifi";

#[derive(Default)]
struct RecordingSink {
    events: RefCell<Vec<Value>>,
}

impl ReportSink for RecordingSink {
    fn record(&self, event: &ReportEvent) -> Result<()> {
        self.events.borrow_mut().push(serde_json::to_value(event)?);
        Ok(())
    }
}

impl RecordingSink {
    fn iterations(&self) -> Vec<Value> {
        self.events
            .borrow()
            .iter()
            .filter(|event| event["event"] == "iteration")
            .cloned()
            .collect()
    }

    fn kinds(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .map(|event| event["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

struct Harness {
    oracle: ScriptedOracle,
    screen: ScriptedScreen,
    actor: ScriptedActor,
    sink: RecordingSink,
}

impl Harness {
    fn new(objectives: &[&str]) -> Self {
        let oracle = ScriptedOracle::new();
        oracle.push(CallKind::Decompose, &decomposition_json(objectives));
        Self {
            oracle,
            screen: ScriptedScreen::new(Vec::new()),
            actor: ScriptedActor::succeeding(),
            sink: RecordingSink::default(),
        }
    }

    fn with_actor(mut self, actor: ScriptedActor) -> Self {
        self.actor = actor;
        self
    }

    fn analyze(&self, achieved: bool) -> &Self {
        self.oracle
            .push(CallKind::Analyze, &analysis_json(achieved, None, None));
        self
    }

    fn obstacle(&self, obstacle: &str) -> &Self {
        self.oracle
            .push(CallKind::Analyze, &analysis_json(false, Some(obstacle), None));
        self
    }

    fn inconsistent(&self) -> &Self {
        self.oracle.push(
            CallKind::Analyze,
            &analysis_json(false, None, Some("layout lists entries but screenshot is blank")),
        );
        self
    }

    fn plan(&self, kind: CallKind, steps: &[&str]) -> &Self {
        self.oracle.push(kind, &plan_json(steps));
        self
    }

    fn confirmed_pass(&self) -> &Self {
        self.oracle
            .push(CallKind::Verdict, &verdict_json("pass", "every objective is visible"));
        self.oracle
            .push(CallKind::Verify, &evaluation_json("pass", "history confirms the claim"));
        self
    }

    fn run(&self, config: &EngineConfig) -> RunOutcome {
        let outcome = run_test(
            PROCEDURE,
            &Collaborators {
                oracle: &self.oracle,
                screen: &self.screen,
                actor: &self.actor,
                sink: &self.sink,
            },
            config,
        )
        .expect("run");
        let violations = validate_progress(&outcome.progress);
        assert!(violations.is_empty(), "invariants: {violations:?}");
        outcome
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        inconsistency_backoff_ms: 0,
        capture_backoff_ms: 0,
        settle_delay_ms: 0,
        ..EngineConfig::default()
    }
}

fn plan_steps(record: &Value) -> Vec<String> {
    assert_eq!(record["output"]["kind"], "plan", "record: {record}");
    record["output"]["steps"]
        .as_array()
        .expect("steps")
        .iter()
        .map(|step| step.as_str().expect("step").to_string())
        .collect()
}

/// Scenario A: an achieved step with objectives remaining advances and replans.
///
/// 1. Planning: step 0 not achieved → fresh plan `["tap settings icon"]`.
/// 2. After the tap: achieved, objectives remain → PLAN, step 0 completed,
///    `current_index` = 1, fresh plan requested for step 1.
/// 3. After the toggle: final objective achieved → verified pass.
#[test]
fn achieved_step_advances_to_next_objective() {
    let harness = Harness::new(&["open settings", "enable wifi"]);
    harness
        .analyze(false)
        .plan(CallKind::Plan, &["tap settings icon"])
        .analyze(true)
        .plan(CallKind::Plan, &["tap wifi toggle"])
        .analyze(true)
        .confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(outcome.termination, Termination::Verdict);
    assert_eq!(
        harness.actor.actions(),
        vec!["tap settings icon", "tap wifi toggle"]
    );

    let records = harness.sink.iterations();
    assert_eq!(records.len(), 3);
    let second = &records[1];
    assert_eq!(second["decision"]["decision"], "PLAN");
    assert_eq!(second["rule"], "objective_achieved");
    assert_eq!(second["progress"]["current_index"], 1);
    assert_eq!(second["progress"]["steps"][0]["status"], "completed");
    assert_eq!(plan_steps(second), vec!["tap wifi toggle"]);

    let plan_prompts: Vec<String> = harness
        .oracle
        .requests()
        .into_iter()
        .filter(|request| request.kind == CallKind::Plan)
        .map(|request| request.prompt)
        .collect();
    assert_eq!(plan_prompts.len(), 2);
    assert!(plan_prompts[1].contains("<current>\nenable wifi\n</current>"));

    assert_eq!(outcome.progress.completed_objectives(), 2);
    assert_eq!(
        harness.sink.kinds(),
        vec![
            "run_started",
            "iteration",
            "iteration",
            "iteration",
            "run_finished"
        ]
    );
}

/// Scenario B: an obstacle with two actions left freezes the plan.
///
/// The dismissal action runs in dialog mode; once the obstacle is gone the
/// frozen two actions come back verbatim without another plan call.
#[test]
fn obstacle_freezes_plan_until_dismissed() {
    let harness = Harness::new(&["enable wifi"]);
    harness
        .analyze(false)
        .plan(
            CallKind::Plan,
            &["open quick settings", "tap wifi", "confirm wifi is on"],
        )
        .obstacle("consent dialog")
        .plan(CallKind::Dismiss, &["tap accept"])
        .analyze(false)
        .analyze(false)
        .analyze(true)
        .confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(
        harness.actor.actions(),
        vec![
            "open quick settings",
            "tap accept",
            "tap wifi",
            "confirm wifi is on"
        ]
    );
    let clearing: Vec<bool> = harness
        .actor
        .requests()
        .iter()
        .map(|request| request.obstacle_clearing)
        .collect();
    assert_eq!(clearing, vec![false, true, false, false]);

    let records = harness.sink.iterations();
    let blocked = &records[1];
    assert_eq!(blocked["rule"], "obstacle");
    assert_eq!(plan_steps(blocked), vec!["tap accept"]);
    assert_eq!(blocked["progress"]["steps"][0]["dialog_mode"], true);
    assert_eq!(blocked["progress"]["steps"][0]["plan_cursor"], 1);
    assert_eq!(blocked["progress"]["steps"][1]["kind"], "recovery");

    let resumed = &records[2];
    assert_eq!(resumed["progress"]["steps"][0]["dialog_mode"], false);
    assert_eq!(
        plan_steps(resumed),
        vec!["tap wifi", "confirm wifi is on"]
    );
    assert_eq!(harness.oracle.calls(CallKind::Plan), 1);
    assert_eq!(harness.oracle.calls(CallKind::Dismiss), 1);

    let steps = outcome.progress.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status(), StepStatus::Completed);
    assert_eq!(steps[0].dialog_count(), 1);
    assert_eq!(steps[1].kind(), StepKind::Recovery);
    assert_eq!(steps[1].status(), StepStatus::Completed);
    assert_eq!(steps[1].parent_index(), Some(0));
}

/// Scenario C: an inconsistency that clears on the last allowed retry.
#[test]
fn inconsistency_resolving_within_budget_proceeds() {
    let harness = Harness::new(&["open settings"]);
    harness
        .inconsistent()
        .inconsistent()
        .analyze(false)
        .plan(CallKind::Plan, &["tap settings icon"])
        .analyze(true)
        .confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(outcome.inconsistency_retries, 2);
    assert_eq!(harness.sink.iterations()[0]["inconsistency_retries"], 2);
    assert_eq!(harness.screen.calls(), 4, "two re-captures plus one per pass");
}

/// Scenario D: an inconsistency on every attempt fails the run.
#[test]
fn persistent_inconsistency_fails_with_cause() {
    let harness = Harness::new(&["open settings"]);
    harness.inconsistent().inconsistent().inconsistent();
    harness.oracle.push(
        CallKind::FailureAnalysis,
        r#"{"category":"framework","facts":["screenshot blank three times"],"root_cause":"capture pipeline returned stale frames","recommended_actions":["restart screen capture"]}"#,
    );

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.termination, Termination::PersistentInconsistency);
    assert!(outcome.reason.contains("persisted after 2 retries"));
    assert!(outcome.reason.contains("screenshot is blank"));
    assert!(harness.actor.actions().is_empty());
    let analysis = outcome.failure_analysis.expect("failure analysis");
    assert!(analysis.contains("framework problem"));
    assert!(analysis.contains("stale frames"));
}

/// Scenario E: the replan budget ends a run that never reaches a verdict.
#[test]
fn replan_limit_terminates_with_diagnostic() {
    let harness = Harness::new(&["open settings"]);
    for _ in 0..4 {
        harness
            .analyze(false)
            .plan(CallKind::Plan, &["tap settings icon"]);
    }
    let config = EngineConfig {
        max_replan_count: 3,
        ..config()
    };

    let outcome = harness.run(&config);

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.termination, Termination::ReplanLimit);
    assert!(outcome.reason.contains("replan limit reached (3/3)"));
    assert_eq!(outcome.replan_count, 3);
    assert_eq!(outcome.iterations, 4);
    assert_eq!(harness.actor.actions().len(), 4);
    assert_eq!(outcome.failure_analysis, None);
    assert_eq!(
        outcome.progress.steps()[0].status(),
        StepStatus::Failed,
        "active step closes as failed"
    );
}

#[test]
fn obstacle_outranks_achievement_in_the_loop() {
    let harness = Harness::new(&["open settings"]);
    harness.oracle.push(
        CallKind::Analyze,
        &analysis_json(true, Some("rate this app prompt"), None),
    );
    harness
        .plan(CallKind::Dismiss, &["tap not now"])
        .analyze(true)
        .confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    let first = &harness.sink.iterations()[0];
    assert_eq!(first["decision"]["decision"], "PLAN");
    assert_eq!(plan_steps(first), vec!["tap not now"]);
    assert_eq!(harness.oracle.calls(CallKind::Verdict), 1);
}

#[test]
fn unconfirmed_pass_needs_review() {
    let harness = Harness::new(&["open settings"]);
    harness.analyze(true);
    harness
        .oracle
        .push(CallKind::Verdict, &verdict_json("pass", "settings visible"));
    harness.oracle.push(
        CallKind::Verify,
        &evaluation_json("fail", "history shows no settings screen"),
    );

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::NeedsReview);
    assert_eq!(outcome.termination, Termination::VerificationDowngrade);
    assert!(outcome.reason.contains("history shows no settings screen"));
    assert_eq!(outcome.failure_analysis, None);
}

#[test]
fn pass_with_unsatisfied_objectives_is_corrected_to_fail() {
    let harness = Harness::new(&["open settings", "enable wifi"]);
    harness.analyze(false);
    harness.oracle.push(
        CallKind::Decide,
        r#"{"decision":"RESPONSE","reason":"looks done"}"#,
    );
    harness
        .oracle
        .push(CallKind::Verdict, &verdict_json("pass", "looks done"));
    let config = EngineConfig {
        decision_mode: DecisionMode::Oracle,
        ..config()
    };

    let outcome = harness.run(&config);

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.termination, Termination::Verdict);
    assert!(outcome.reason.contains("0 of 2 objectives completed"));
    assert_eq!(harness.oracle.calls(CallKind::Verify), 0);
    let analysis = outcome.failure_analysis.expect("inline failure analysis");
    assert!(analysis.contains("failure analysis unavailable"));
}

#[test]
fn verdict_oracle_failure_keeps_the_run_going() {
    let harness = Harness::new(&["open settings"]);
    harness.analyze(true);
    harness
        .oracle
        .push_err(CallKind::Verdict, "oracle timed out after 300s");
    harness.analyze(true).confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(outcome.iterations, 2);
    let first = &harness.sink.iterations()[0];
    assert!(plan_steps(first).is_empty());
    assert_eq!(harness.oracle.calls(CallKind::Verdict), 2);
}

#[test]
fn app_defect_fails_immediately() {
    let harness = Harness::new(&["open settings"]);
    let mut state: Value =
        serde_json::from_str(&analysis_json(false, None, None)).expect("analysis");
    state["app_defect_detected"] = Value::Bool(true);
    state["app_defect_reason"] = Value::String("app crashed to the launcher".to_string());
    harness.oracle.push(CallKind::Analyze, &state.to_string());

    let outcome = harness.run(&EngineConfig {
        analyze_failures: false,
        ..config()
    });

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.termination, Termination::AppDefect);
    assert!(outcome.reason.contains("crashed"));
    assert_eq!(harness.oracle.calls(CallKind::Verdict), 0);
    assert_eq!(outcome.failure_analysis, None);
}

#[test]
fn failed_action_aborts_the_run() {
    let harness = Harness::new(&["open settings"]).with_actor(ScriptedActor::new(vec![Ok(
        ActionReport {
            success: false,
            outcome: "settings icon not found".to_string(),
            executed: Vec::new(),
        },
    )]));
    harness
        .analyze(false)
        .plan(CallKind::Plan, &["tap settings icon"]);

    let outcome = harness.run(&EngineConfig {
        analyze_failures: false,
        ..config()
    });

    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert_eq!(outcome.termination, Termination::ActionFailed);
    assert!(outcome.reason.contains("settings icon not found"));
    let step = &outcome.progress.steps()[0];
    assert_eq!(step.status(), StepStatus::Failed);
    assert_eq!(step.executed_actions().len(), 1);
}

#[test]
fn separate_dialog_pool_bounds_obstacle_loops() {
    let harness = Harness::new(&["open settings"]);
    harness
        .obstacle("cookie banner")
        .plan(CallKind::Dismiss, &["tap close"])
        .obstacle("cookie banner")
        .plan(CallKind::Dismiss, &["tap close"]);
    let config = EngineConfig {
        count_dialog_iterations: false,
        max_dialog_iterations: 1,
        ..config()
    };

    let outcome = harness.run(&config);

    assert_eq!(outcome.termination, Termination::DialogLimit);
    assert_eq!(outcome.replan_count, 0);
    assert_eq!(outcome.dialog_iterations, 1);
    assert_eq!(harness.actor.actions(), vec!["tap close", "tap close"]);
    let recoveries = outcome
        .progress
        .steps()
        .iter()
        .filter(|step| step.kind() == StepKind::Recovery)
        .count();
    assert_eq!(recoveries, 1, "one recovery step per obstacle episode");
}

#[test]
fn multi_action_dismissal_runs_every_action_before_replanning() {
    let harness = Harness::new(&["enable wifi"]);
    harness
        .analyze(false)
        .plan(CallKind::Plan, &["open quick settings", "tap wifi"])
        .obstacle("terms dialog")
        .plan(CallKind::Dismiss, &["tick agree checkbox", "tap continue"])
        .obstacle("terms dialog")
        .analyze(false)
        .analyze(true)
        .confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(
        harness.actor.actions(),
        vec![
            "open quick settings",
            "tick agree checkbox",
            "tap continue",
            "tap wifi"
        ]
    );
    assert_eq!(harness.oracle.calls(CallKind::Dismiss), 1);
    assert_eq!(plan_steps(&harness.sink.iterations()[2]), vec!["tap continue"]);

    let recovery = &outcome.progress.steps()[1];
    assert_eq!(recovery.kind(), StepKind::Recovery);
    assert_eq!(recovery.status(), StepStatus::Completed);
    assert_eq!(recovery.execution_plan(), ["tick agree checkbox", "tap continue"]);
    assert_eq!(recovery.plan_cursor(), 2);
    assert_eq!(outcome.progress.steps()[0].dialog_count(), 2);
}

#[test]
fn pass_without_action_is_charged_to_the_replan_pool() {
    let harness = Harness::new(&["open settings"]);
    harness
        .obstacle("cookie banner")
        .plan(CallKind::Dismiss, &["tap close"])
        .analyze(true);
    harness
        .oracle
        .push_err(CallKind::Verdict, "oracle timed out after 300s");
    harness.analyze(true).confirmed_pass();
    let config = EngineConfig {
        count_dialog_iterations: false,
        max_dialog_iterations: 1,
        ..config()
    };

    let outcome = harness.run(&config);

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.dialog_iterations, 1);
    assert_eq!(outcome.replan_count, 1);
    assert_eq!(harness.actor.actions(), vec!["tap close"]);
}

#[test]
fn capture_failures_are_retried() {
    let mut harness = Harness::new(&["open settings"]);
    harness.screen = ScriptedScreen::new(vec![Err("adb: device not found".to_string())]);
    harness.analyze(true).confirmed_pass();

    let outcome = harness.run(&config());

    assert_eq!(outcome.status, OutcomeStatus::Pass);
    assert_eq!(harness.screen.calls(), 2);
}
