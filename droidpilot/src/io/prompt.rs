//! Prompt builder for oracle calls.
//!
//! Each [`CallKind`] has one minijinja template under `prompts/`. Templates
//! mark their sections with `<!-- section:KEY required|droppable -->`; when the
//! rendered prompt exceeds the byte budget, droppable sections go first.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::progress::ObjectiveProgress;
use crate::core::types::{CallKind, StateAnalysis};
use crate::io::device::Snapshot;

const TEMPLATES: [(CallKind, &str); 9] = [
    (CallKind::Decompose, include_str!("prompts/decompose.md")),
    (CallKind::Analyze, include_str!("prompts/analyze.md")),
    (CallKind::Decide, include_str!("prompts/decide.md")),
    (CallKind::Plan, include_str!("prompts/plan.md")),
    (CallKind::Dismiss, include_str!("prompts/dismiss.md")),
    (CallKind::Verdict, include_str!("prompts/verdict.md")),
    (CallKind::Verify, include_str!("prompts/verify.md")),
    (CallKind::FailureAnalysis, include_str!("prompts/failure_analysis.md")),
    (CallKind::Act, include_str!("prompts/act.md")),
];

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 5] = ["knowhow", "history", "objectives", "analysis", "layout"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern is a valid regex")
});

/// Everything a template may reference. Unused fields are simply not rendered.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptInputs {
    /// Verbatim user procedure.
    pub goal: String,
    /// Step list with status markers.
    pub objectives: Option<String>,
    /// Description of the active step.
    pub current_step: Option<String>,
    /// Active step plan with done/current/pending markers.
    pub plan_progress: Option<String>,
    pub progress_summary: Option<String>,
    /// Executed actions, oldest first.
    pub history: Option<String>,
    /// Structural description of the current screen.
    pub layout: Option<String>,
    pub has_previous_image: bool,
    pub has_current_image: bool,
    /// Rendered Stage 1 findings.
    pub analysis: Option<String>,
    pub obstacle: Option<String>,
    /// Verdict under review (verification / failure analysis).
    pub verdict: Option<String>,
    /// Action to perform (action executor).
    pub action: Option<String>,
    pub max_actions: usize,
    pub knowhow: Option<String>,
}

impl PromptInputs {
    /// Inputs describing the tracker state and the current screen.
    pub fn from_state(
        progress: &ObjectiveProgress,
        snapshot: Option<&Snapshot>,
        history_limit: usize,
        knowhow: Option<&str>,
    ) -> Self {
        let history = progress.format_history(history_limit);
        Self {
            goal: progress.original_input().trim().to_string(),
            objectives: non_empty(progress.format_steps()),
            current_step: progress.current().map(|step| step.description().to_string()),
            plan_progress: progress.format_plan_progress(),
            progress_summary: Some(progress.summary()),
            history: non_empty(history),
            layout: snapshot.and_then(|s| non_empty(s.layout.clone())),
            has_current_image: snapshot.is_some_and(|s| s.screenshot.is_some()),
            knowhow: knowhow.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_analysis(mut self, analysis: &StateAnalysis) -> Self {
        self.analysis = Some(render_analysis(analysis));
        self.obstacle = analysis.obstacle().map(str::to_string);
        self
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

/// Compact text rendering of a Stage 1 result for downstream prompts.
pub fn render_analysis(analysis: &StateAnalysis) -> String {
    let mut out = format!(
        "screen type: {}\nchanges: {}\nmain elements: {}\ncurrent step achieved: {}\nevidence: {}\n",
        analysis.screen_type.trim(),
        analysis.screen_changes.trim(),
        analysis.main_elements.trim(),
        analysis.current_step_achieved,
        analysis.current_step_evidence.trim(),
    );
    if let Some(obstacle) = analysis.obstacle() {
        out.push_str(&format!("blocking obstacle: {obstacle}\n"));
    }
    if analysis.defect_signal() {
        out.push_str(&format!("app defect: {}\n", analysis.defect_reason()));
    }
    if let Some(next) = analysis
        .suggested_next_action
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        out.push_str(&format!("suggested next action: {}\n", next.trim()));
    }
    out
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::with_capacity(markers.len());
    for (i, (_, body_start, key, required)) in markers.iter().enumerate() {
        let body_end = markers
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..body_end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over budget: truncate the largest section.
    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    if let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) {
        let keep = largest.content.len().saturating_sub(over + 12);
        let mut cut = keep;
        while cut > 0 && !largest.content.is_char_boundary(cut) {
            cut -= 1;
        }
        let before_len = largest.content.len();
        largest.content.truncate(cut);
        largest.content.push_str("\n[truncated]");
        debug!(
            section = largest.key.as_str(),
            before_len,
            after_len = largest.content.len(),
            "truncated section for budget"
        );
    }
}

/// Builds prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        for (kind, source) in TEMPLATES {
            env.add_template(kind.as_str(), source)
                .with_context(|| format!("load {} prompt template", kind.as_str()))?;
        }
        Ok(Self { env, budget_bytes })
    }

    /// Render the template for `kind` and apply the byte budget.
    pub fn build(&self, kind: CallKind, inputs: &PromptInputs) -> Result<String> {
        let template = self.env.get_template(kind.as_str())?;
        let rendered = template
            .render(context! { input => inputs })
            .with_context(|| format!("render {} prompt", kind.as_str()))?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
