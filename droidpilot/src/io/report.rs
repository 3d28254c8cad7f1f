//! Audit records for each run, written as JSONL.
//!
//! Sinks are write-only and best-effort: the loop logs sink failures and keeps
//! going, so a lost record never changes orchestration.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::core::decision::DecisionRule;
use crate::core::progress::{ExecutedAction, ObjectiveProgress};
use crate::core::types::{DecisionResult, ReplanOutput, StateAnalysis};
use crate::looping::RunOutcome;

/// Loop phase that produced an iteration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Replanning,
}

/// Everything Stage 1–3 saw and produced in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub phase: Phase,
    pub snapshot_id: u32,
    /// Action executed right before this pass, if any.
    pub last_action: Option<ExecutedAction>,
    pub analysis: StateAnalysis,
    pub inconsistency_retries: u32,
    pub rule: Option<DecisionRule>,
    pub decision: DecisionResult,
    pub output: ReplanOutput,
    pub progress: ObjectiveProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    RunStarted {
        goal: String,
        objectives: Vec<String>,
    },
    Iteration(Box<IterationRecord>),
    RunFinished(Box<RunOutcome>),
}

pub trait ReportSink {
    fn record(&self, event: &ReportEvent) -> Result<()>;
}

impl<R: ReportSink + ?Sized> ReportSink for &R {
    fn record(&self, event: &ReportEvent) -> Result<()> {
        (**self).record(event)
    }
}

/// Deliver `event`, logging instead of failing.
pub fn record_best_effort<R: ReportSink + ?Sized>(sink: &R, event: &ReportEvent) {
    if let Err(err) = sink.record(event) {
        warn!(err = %format!("{err:#}"), "report sink dropped a record");
    }
}

/// Discards every record.
pub struct NullReportSink;

impl ReportSink for NullReportSink {
    fn record(&self, _event: &ReportEvent) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlReportSink {
    path: PathBuf,
}

impl JsonlReportSink {
    /// Create the sink, truncating any previous report at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create report dir {}", parent.display()))?;
        }
        fs::write(path, "").with_context(|| format!("create report {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonlReportSink {
    fn record(&self, event: &ReportEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize report event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open report {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append report {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn record(&self, _event: &ReportEvent) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn started() -> ReportEvent {
        ReportEvent::RunStarted {
            goal: "open settings".to_string(),
            objectives: vec!["open settings".to_string()],
        }
    }

    #[test]
    fn jsonl_sink_appends_tagged_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run/report.jsonl");
        let sink = JsonlReportSink::create(&path).expect("create");
        sink.record(&started()).expect("first");
        sink.record(&started()).expect("second");

        let contents = fs::read_to_string(sink.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["event"], "run_started");
        assert_eq!(first["objectives"][0], "open settings");
    }

    #[test]
    fn create_truncates_previous_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("report.jsonl");
        fs::write(&path, "stale\n").expect("seed");
        JsonlReportSink::create(&path).expect("create");
        assert_eq!(fs::read_to_string(&path).expect("read"), "");
    }

    #[test]
    fn best_effort_swallows_sink_errors() {
        record_best_effort(&FailingSink, &started());
        record_best_effort(&NullReportSink, &started());
    }
}
