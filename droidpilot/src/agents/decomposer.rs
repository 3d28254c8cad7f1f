//! Decomposer agent: turns the free-text procedure into ordered objective steps.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::progress::ObjectiveProgress;
use crate::core::types::CallKind;
use crate::io::oracle::{Oracle, OracleRequest, infer_json};
use crate::io::prompt::{PromptBuilder, PromptInputs};

use super::{DECOMPOSITION_SCHEMA, clean_lines};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub objectives: Vec<String>,
}

/// Decomposer agent wrapper; one oracle call per run.
pub struct DecomposerAgent<'a> {
    prompts: &'a PromptBuilder,
    knowhow: Option<&'a str>,
}

impl<'a> DecomposerAgent<'a> {
    pub fn new(prompts: &'a PromptBuilder, knowhow: Option<&'a str>) -> Self {
        Self { prompts, knowhow }
    }

    /// Build a tracker for `procedure` with every step pending.
    ///
    /// An empty decomposition falls back to a single objective holding the
    /// whole procedure.
    #[instrument(skip_all)]
    pub fn run<O: Oracle + ?Sized>(&self, oracle: &O, procedure: &str) -> Result<ObjectiveProgress> {
        let procedure = procedure.trim();
        if procedure.is_empty() {
            bail!("test procedure is empty");
        }
        let inputs = PromptInputs {
            goal: procedure.to_string(),
            knowhow: self.knowhow.map(str::to_string),
            ..PromptInputs::default()
        };
        let prompt = self.prompts.build(CallKind::Decompose, &inputs)?;
        let request = OracleRequest::new(CallKind::Decompose, prompt, DECOMPOSITION_SCHEMA);
        let output: Decomposition = infer_json(oracle, &request)?;

        let mut objectives = clean_lines(output.objectives);
        if objectives.is_empty() {
            warn!("decomposition returned no objectives; using the whole procedure");
            objectives.push(procedure.to_string());
        }
        info!(objectives = objectives.len(), "decomposed procedure");
        Ok(ObjectiveProgress::new(procedure, objectives))
    }
}
