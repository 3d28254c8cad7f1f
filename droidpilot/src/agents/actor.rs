//! Action executor backed by an oracle that can drive the device.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::types::CallKind;
use crate::io::device::{ActionExecutor, ActionReport, ActionRequest};
use crate::io::oracle::{Oracle, OracleRequest, infer_json};
use crate::io::prompt::{PromptBuilder, PromptInputs};

use super::ACTION_REPORT_SCHEMA;

/// Translates one natural-language action into device commands through an
/// oracle run with side effects allowed.
pub struct OracleActionExecutor<O> {
    oracle: O,
    prompts: PromptBuilder,
    knowhow: Option<String>,
}

impl<O: Oracle> OracleActionExecutor<O> {
    pub fn new(oracle: O, prompt_budget_bytes: usize, knowhow: Option<String>) -> Result<Self> {
        Ok(Self {
            oracle,
            prompts: PromptBuilder::new(prompt_budget_bytes)?,
            knowhow,
        })
    }
}

impl<O: Oracle> ActionExecutor for OracleActionExecutor<O> {
    #[instrument(skip_all, fields(action = request.action))]
    fn perform(&self, request: &ActionRequest<'_>) -> Result<ActionReport> {
        let inputs = PromptInputs {
            goal: request.goal.to_string(),
            current_step: Some(request.objective.to_string()),
            action: Some(request.action.to_string()),
            layout: Some(request.snapshot.layout.clone()).filter(|l| !l.trim().is_empty()),
            has_current_image: request.snapshot.screenshot.is_some(),
            knowhow: self.knowhow.clone(),
            ..PromptInputs::default()
        };
        let prompt = self.prompts.build(CallKind::Act, &inputs)?;
        let oracle_request = OracleRequest::new(CallKind::Act, prompt, ACTION_REPORT_SCHEMA)
            .with_images(request.snapshot.screenshot.iter().cloned().collect());
        let report: ActionReport = infer_json(&self.oracle, &oracle_request)
            .with_context(|| format!("perform action: {}", request.action))?;
        info!(
            success = report.success,
            commands = report.executed.len(),
            "action performed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedOracle, snapshot};

    #[test]
    fn action_prompt_carries_action_and_layout() {
        let oracle = ScriptedOracle::new();
        oracle.push(
            CallKind::Act,
            r#"{"success":true,"outcome":"settings opened","executed":["adb shell input tap 120 480"]}"#,
        );
        let actor = OracleActionExecutor::new(&oracle, 20_000, None).expect("actor");
        let screen = snapshot(3, "<node resource-id=\"settings_icon\"/>");

        let report = actor
            .perform(&ActionRequest {
                action: "tap settings icon",
                objective: "open settings",
                goal: "open settings and enable wifi",
                snapshot: &screen,
                obstacle_clearing: false,
            })
            .expect("perform");

        assert!(report.success);
        assert_eq!(report.executed.len(), 1);
        let requests = oracle.requests();
        assert_eq!(requests[0].kind, CallKind::Act);
        assert!(requests[0].prompt.contains("tap settings icon"));
        assert!(requests[0].prompt.contains("settings_icon"));
    }

    #[test]
    fn oracle_error_names_the_action() {
        let oracle = ScriptedOracle::new();
        oracle.push_err(CallKind::Act, "device offline");
        let actor = OracleActionExecutor::new(&oracle, 20_000, None).expect("actor");
        let screen = snapshot(1, "");

        let err = actor
            .perform(&ActionRequest {
                action: "tap wifi",
                objective: "enable wifi",
                goal: "enable wifi",
                snapshot: &screen,
                obstacle_clearing: false,
            })
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("perform action: tap wifi"));
        assert!(message.contains("device offline"));
    }
}
