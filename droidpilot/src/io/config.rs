//! Engine configuration stored as TOML (default `.droidpilot/config.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// How Stage 2 chooses between PLAN and RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    /// Deterministic priority policy only.
    Policy,
    /// Ask the oracle; obstacles still force PLAN and failures fall back to PLAN.
    Oracle,
}

/// Engine configuration (TOML).
///
/// Missing fields take their defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Replanning passes allowed before the run fails with a diagnostic.
    pub max_replan_count: u32,

    /// Extra Stage 1 attempts while the analysis reports a perception inconsistency.
    pub max_inconsistency_retries: u32,

    /// Pause before re-capturing the screen after an inconsistency.
    pub inconsistency_backoff_ms: u64,

    /// Extra capture attempts after a transient snapshot failure.
    pub capture_retries: u32,

    pub capture_backoff_ms: u64,

    /// Upper bound on obstacle-dismissal actions requested per replan.
    pub max_dismissal_actions: usize,

    /// Whether replans that follow an obstacle-clearing action consume `max_replan_count`.
    pub count_dialog_iterations: bool,

    /// Separate cap for obstacle-clearing replans when `count_dialog_iterations` is false.
    pub max_dialog_iterations: u32,

    /// Wait for the screen to settle after each action.
    pub settle_delay_ms: u64,

    pub decision_mode: DecisionMode,

    /// Independently verify pass verdicts before accepting them.
    pub verify_pass: bool,

    /// Attach an oracle root-cause analysis to failed runs.
    pub analyze_failures: bool,

    /// Maximum bytes per prompt before dropping droppable sections.
    pub prompt_budget_bytes: usize,

    /// Executed actions included in prompts, most recent first.
    pub history_limit: usize,

    /// Free-form testing know-how appended to every prompt.
    pub knowhow: Option<String>,

    pub oracle: OracleConfig,

    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Program and leading arguments used to run the agent (e.g. `["codex"]`).
    pub command: Vec<String>,

    pub model: Option<String>,

    pub reasoning_effort: String,

    /// Per-call wall-clock budget.
    pub timeout_secs: u64,

    /// Truncate oracle stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string()],
            model: None,
            reasoning_effort: "medium".to_string(),
            timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb: String,

    /// Target device serial (`adb -s`). Uses the only attached device when unset.
    pub serial: Option<String>,

    pub command_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            serial: None,
            command_timeout_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_replan_count: 10,
            max_inconsistency_retries: 2,
            inconsistency_backoff_ms: 2_000,
            capture_retries: 2,
            capture_backoff_ms: 1_000,
            max_dismissal_actions: 2,
            count_dialog_iterations: true,
            max_dialog_iterations: 10,
            settle_delay_ms: 3_000,
            decision_mode: DecisionMode::Policy,
            verify_pass: true,
            analyze_failures: true,
            prompt_budget_bytes: 60_000,
            history_limit: 20,
            knowhow: None,
            oracle: OracleConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_replan_count == 0 {
            return Err(anyhow!("max_replan_count must be > 0"));
        }
        if self.max_dismissal_actions == 0 {
            return Err(anyhow!("max_dismissal_actions must be > 0"));
        }
        if !self.count_dialog_iterations && self.max_dialog_iterations == 0 {
            return Err(anyhow!(
                "max_dialog_iterations must be > 0 when count_dialog_iterations is false"
            ));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.device.adb.trim().is_empty() {
            return Err(anyhow!("device.adb must be non-empty"));
        }
        if self.device.command_timeout_secs == 0 {
            return Err(anyhow!("device.command_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn inconsistency_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_inconsistency_retries,
            Duration::from_millis(self.inconsistency_backoff_ms),
        )
    }

    pub fn capture_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.capture_retries,
            Duration::from_millis(self.capture_backoff_ms),
        )
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Know-how text, if any non-blank text is configured.
    pub fn knowhow(&self) -> Option<&str> {
        self.knowhow
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
