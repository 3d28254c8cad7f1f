//! Oracle-backed agents for each engine stage.
//!
//! Every agent owns one result schema and renders its prompt through the
//! shared [`PromptBuilder`](crate::io::prompt::PromptBuilder).

pub mod actor;
pub mod analyzer;
pub mod decomposer;
pub mod replanner;

pub(crate) const DECOMPOSITION_SCHEMA: &str =
    include_str!("../../schemas/decomposition.schema.json");
pub(crate) const STATE_ANALYSIS_SCHEMA: &str =
    include_str!("../../schemas/state_analysis.schema.json");
pub(crate) const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");
pub(crate) const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
pub(crate) const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");
pub(crate) const EVALUATION_SCHEMA: &str = include_str!("../../schemas/evaluation.schema.json");
pub(crate) const FAILURE_ANALYSIS_SCHEMA: &str =
    include_str!("../../schemas/failure_analysis.schema.json");
pub(crate) const ACTION_REPORT_SCHEMA: &str =
    include_str!("../../schemas/action_report.schema.json");

#[cfg(test)]
pub(crate) const SCHEMAS: [&str; 8] = [
    DECOMPOSITION_SCHEMA,
    STATE_ANALYSIS_SCHEMA,
    DECISION_SCHEMA,
    PLAN_SCHEMA,
    VERDICT_SCHEMA,
    EVALUATION_SCHEMA,
    FAILURE_ANALYSIS_SCHEMA,
    ACTION_REPORT_SCHEMA,
];

/// Trim entries and drop blank ones.
pub(crate) fn clean_lines(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
