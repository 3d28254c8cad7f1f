//! Reasoning oracle abstraction.
//!
//! The [`Oracle`] trait decouples the replan engine from the model backend
//! (currently `codex exec` with an output schema). Tests use scripted oracles
//! that return canned JSON without spawning processes.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::CallKind;
use crate::io::config::OracleConfig;
use crate::io::process::run_command_with_stream;

/// One structured-output request.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub kind: CallKind,
    pub prompt: String,
    /// Screenshots attached to the prompt, oldest first.
    pub images: Vec<PathBuf>,
    /// JSON Schema (Draft 2020-12) the result must satisfy.
    pub schema: &'static str,
}

impl OracleRequest {
    pub fn new(kind: CallKind, prompt: String, schema: &'static str) -> Self {
        Self {
            kind,
            prompt,
            images: Vec::new(),
            schema,
        }
    }

    pub fn with_images(mut self, images: Vec<PathBuf>) -> Self {
        self.images = images;
        self
    }
}

/// Abstraction over reasoning backends.
pub trait Oracle {
    /// Return the raw JSON text of the structured result.
    fn infer(&self, request: &OracleRequest) -> Result<String>;
}

impl<O: Oracle + ?Sized> Oracle for &O {
    fn infer(&self, request: &OracleRequest) -> Result<String> {
        (**self).infer(request)
    }
}

/// Run the oracle, validate its result against the request schema, and parse it.
#[instrument(skip_all, fields(kind = request.kind.as_str()))]
pub fn infer_json<O: Oracle + ?Sized, T: DeserializeOwned>(
    oracle: &O,
    request: &OracleRequest,
) -> Result<T> {
    let raw = oracle.infer(request)?;
    let value: Value = serde_json::from_str(raw.trim())
        .with_context(|| format!("parse {} result as json", request.kind.as_str()))?;
    validate_against_schema(&value, request.schema)
        .with_context(|| format!("{} result violates schema", request.kind.as_str()))?;
    let parsed = serde_json::from_value(value)
        .with_context(|| format!("decode {} result", request.kind.as_str()))?;
    debug!("oracle result accepted");
    Ok(parsed)
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_against_schema(instance: &Value, schema: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).context("parse json schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Oracle that spawns `codex exec` once per request.
///
/// Each call gets its own directory under `<state_dir>/calls/` holding the
/// agent's final message, its stdout/stderr log, and the JSONL event stream.
pub struct CodexOracle {
    workdir: PathBuf,
    state_dir: PathBuf,
    config: OracleConfig,
    sandbox: &'static str,
    seq: Cell<u32>,
}

impl CodexOracle {
    /// Read-only oracle for judgments (analysis, planning, verdicts).
    pub fn new(workdir: &Path, state_dir: &Path, config: OracleConfig) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            config,
            sandbox: "read-only",
            seq: Cell::new(0),
        }
    }

    /// Oracle allowed to run device commands; backs the action executor.
    pub fn with_side_effects(workdir: &Path, state_dir: &Path, config: OracleConfig) -> Self {
        Self {
            sandbox: "danger-full-access",
            ..Self::new(workdir, state_dir, config)
        }
    }

    pub fn allows_side_effects(&self) -> bool {
        self.sandbox == "danger-full-access"
    }

    fn next_call_dir(&self, kind: CallKind) -> PathBuf {
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        let prefix = if self.allows_side_effects() { "act" } else { "ask" };
        self.state_dir
            .join("calls")
            .join(format!("{prefix}-{seq:04}-{}", kind.as_str()))
    }
}

impl Oracle for CodexOracle {
    #[instrument(skip_all, fields(kind = request.kind.as_str(), images = request.images.len()))]
    fn infer(&self, request: &OracleRequest) -> Result<String> {
        let call_dir = self.next_call_dir(request.kind);
        fs::create_dir_all(&call_dir)
            .with_context(|| format!("create call dir {}", call_dir.display()))?;
        let schema_path = self
            .state_dir
            .join("schemas")
            .join(format!("{}.schema.json", request.kind.as_str()));
        write_output_schema(&schema_path, request.schema)?;
        let output_path = call_dir.join("output.json");
        let timeout = Duration::from_secs(self.config.timeout_secs);

        info!(call_dir = %call_dir.display(), "starting codex exec");
        let (program, leading) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("exec")
            .arg("-c")
            .arg(format!(
                "model_reasoning_effort={}",
                self.config.reasoning_effort
            ))
            .arg("--sandbox")
            .arg(self.sandbox)
            // The workdir is usually not a git checkout.
            .arg("--skip-git-repo-check")
            .arg("--json");
        if let Some(model) = &self.config.model {
            cmd.arg("--model").arg(model);
        }
        for image in &request.images {
            cmd.arg("--image").arg(image);
        }
        cmd.arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(&self.workdir);

        let output = run_command_with_stream(
            cmd,
            Some(request.prompt.as_bytes()),
            timeout,
            self.config.output_limit_bytes,
            Some(&call_dir.join("stream.jsonl")),
        )
        .context("run codex exec")?;

        fs::write(call_dir.join("prompt.md"), &request.prompt)
            .with_context(|| format!("write prompt log in {}", call_dir.display()))?;
        let log_path = call_dir.join("executor.log");
        fs::write(
            &log_path,
            output.render_log("codex", self.config.output_limit_bytes),
        )
        .with_context(|| format!("write executor log {}", log_path.display()))?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "codex exec timed out");
            return Err(anyhow!("codex exec timed out after {timeout:?}"));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(anyhow!(
                "codex exec failed with status {:?}",
                output.status.code()
            ));
        }
        if !output_path.exists() {
            return Err(anyhow!("missing oracle output {}", output_path.display()));
        }
        let contents = fs::read_to_string(&output_path)
            .with_context(|| format!("read oracle output {}", output_path.display()))?;
        debug!("codex exec completed successfully");
        Ok(contents)
    }
}

pub(crate) fn write_output_schema(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write schema {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const ANSWER_SCHEMA: &str = r#"{
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "required": ["answer"],
        "properties": { "answer": { "type": "string" } }
    }"#;

    #[derive(Debug, Deserialize)]
    struct Answer {
        answer: String,
    }

    struct FixedOracle(&'static str);

    impl Oracle for FixedOracle {
        fn infer(&self, _request: &OracleRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn request() -> OracleRequest {
        OracleRequest::new(CallKind::Plan, "prompt".to_string(), ANSWER_SCHEMA)
    }

    #[test]
    fn infer_json_parses_valid_result() {
        let parsed: Answer =
            infer_json(&FixedOracle(r#" {"answer":"tap"} "#), &request()).expect("parse");
        assert_eq!(parsed.answer, "tap");
    }

    #[test]
    fn infer_json_rejects_schema_violations() {
        let err = infer_json::<_, Answer>(&FixedOracle(r#"{"answer":3}"#), &request())
            .unwrap_err();
        assert!(format!("{err:#}").contains("violates schema"));
    }

    #[test]
    fn infer_json_rejects_malformed_json() {
        let err = infer_json::<_, Answer>(&FixedOracle("not json"), &request()).unwrap_err();
        assert!(format!("{err:#}").contains("parse plan result"));
    }

    #[test]
    fn codex_oracle_numbers_call_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let oracle = CodexOracle::new(temp.path(), temp.path(), OracleConfig::default());
        let first = oracle.next_call_dir(CallKind::Analyze);
        let second = oracle.next_call_dir(CallKind::Plan);
        assert!(first.ends_with("calls/ask-0001-analyze"));
        assert!(second.ends_with("calls/ask-0002-plan"));
        assert!(!oracle.allows_side_effects());
        let actor = CodexOracle::with_side_effects(temp.path(), temp.path(), OracleConfig::default());
        assert!(actor.allows_side_effects());
    }

    #[test]
    fn embedded_schemas_compile() {
        for schema in crate::agents::SCHEMAS {
            let compiled: Value = serde_json::from_str(schema).expect("schema json");
            jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&compiled)
                .expect("schema compiles");
        }
    }
}
