//! Stage 1: screen state analysis, wrapped in the screen-consistency retry loop.

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::progress::ObjectiveProgress;
use crate::core::retry::retry_bounded;
use crate::core::types::{CallKind, StateAnalysis};
use crate::io::config::EngineConfig;
use crate::io::device::{ScreenProvider, Snapshot, capture_with_retry};
use crate::io::oracle::{Oracle, OracleRequest, infer_json};
use crate::io::prompt::{PromptBuilder, PromptInputs};

use super::STATE_ANALYSIS_SCHEMA;

/// The layout and the screenshot kept disagreeing after every retry.
#[derive(Debug, Clone, Error)]
#[error("perception inconsistency persisted after {retries} retries: {description}")]
pub struct PersistentInconsistencyError {
    pub retries: u32,
    pub description: String,
}

/// A consistent analysis and the snapshot it was computed from.
#[derive(Debug, Clone)]
pub struct ObservedState {
    pub snapshot: Snapshot,
    pub analysis: StateAnalysis,
    /// Re-captures spent before the analysis came back consistent.
    pub inconsistency_retries: u32,
}

pub struct AnalyzerAgent<'a> {
    prompts: &'a PromptBuilder,
    config: &'a EngineConfig,
}

impl<'a> AnalyzerAgent<'a> {
    pub fn new(prompts: &'a PromptBuilder, config: &'a EngineConfig) -> Self {
        Self { prompts, config }
    }

    /// One Stage 1 oracle call for `current`, comparing against `previous` when given.
    #[instrument(skip_all, fields(snapshot = current.id))]
    pub fn run<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        progress: &ObjectiveProgress,
        current: &Snapshot,
        previous: Option<&Snapshot>,
    ) -> Result<StateAnalysis> {
        let previous_image = previous.and_then(|s| s.screenshot.clone());
        let mut inputs = PromptInputs::from_state(
            progress,
            Some(current),
            self.config.history_limit,
            self.config.knowhow(),
        );
        inputs.has_previous_image = previous_image.is_some() && current.screenshot.is_some();

        let mut images = Vec::with_capacity(2);
        if inputs.has_previous_image {
            images.extend(previous_image);
        }
        images.extend(current.screenshot.clone());

        let prompt = self.prompts.build(CallKind::Analyze, &inputs)?;
        let request = OracleRequest::new(CallKind::Analyze, prompt, STATE_ANALYSIS_SCHEMA)
            .with_images(images);
        infer_json(oracle, &request).context("analyze screen state")
    }

    /// Analyze `first`, re-capturing and re-analyzing while the oracle reports a
    /// perception inconsistency.
    ///
    /// Fails with [`PersistentInconsistencyError`] once
    /// `max_inconsistency_retries` are spent.
    pub fn observe<O: Oracle + ?Sized, S: ScreenProvider + ?Sized>(
        &self,
        oracle: &O,
        screen: &S,
        progress: &ObjectiveProgress,
        first: Snapshot,
        previous: Option<&Snapshot>,
    ) -> Result<ObservedState> {
        let capture = self.config.capture_retry();
        let mut first = Some(first);
        let outcome = retry_bounded(
            &self.config.inconsistency_retry(),
            |attempt| -> Result<(Snapshot, StateAnalysis)> {
                let snapshot = match first.take() {
                    Some(snapshot) => snapshot,
                    None => capture_with_retry(screen, &capture)?,
                };
                let analysis = self.run(oracle, progress, &snapshot, previous)?;
                if let Some(description) = analysis.inconsistency() {
                    warn!(attempt, description, "perception inconsistency detected");
                }
                Ok((snapshot, analysis))
            },
            |result| matches!(result, Ok((_, analysis)) if analysis.inconsistency().is_some()),
        );

        let retries = outcome.retries;
        let (snapshot, analysis) = outcome.result?;
        if outcome.exhausted {
            let description = analysis.inconsistency().unwrap_or_default().to_string();
            warn!(retries, %description, "perception inconsistency persisted");
            return Err(PersistentInconsistencyError {
                retries,
                description,
            }
            .into());
        }
        if retries > 0 {
            info!(retries, "perception inconsistency resolved");
        }
        Ok(ObservedState {
            snapshot,
            analysis,
            inconsistency_retries: retries,
        })
    }
}
