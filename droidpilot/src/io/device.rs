//! Device-facing collaborators: screen snapshots and action execution.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::retry::{RetryPolicy, retry_bounded};
use crate::io::config::DeviceConfig;
use crate::io::process::run_command_with_timeout;

/// One observation of the device screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Monotonic capture number within a run.
    pub id: u32,
    /// Structural description (layout hierarchy).
    pub layout: String,
    /// Visual capture on disk, when one could be taken.
    pub screenshot: Option<PathBuf>,
}

/// Source of screen snapshots. Must be side-effect-free.
pub trait ScreenProvider {
    fn capture(&self) -> Result<Snapshot>;
}

impl<S: ScreenProvider + ?Sized> ScreenProvider for &S {
    fn capture(&self) -> Result<Snapshot> {
        (**self).capture()
    }
}

/// Capture a snapshot, retrying transient failures per `policy`.
pub fn capture_with_retry<S: ScreenProvider + ?Sized>(
    screen: &S,
    policy: &RetryPolicy,
) -> Result<Snapshot> {
    let outcome = retry_bounded(
        policy,
        |attempt| {
            screen.capture().inspect_err(|err| {
                warn!(attempt, err = %format!("{err:#}"), "screen capture failed");
            })
        },
        Result::is_err,
    );
    let retries = outcome.retries;
    outcome
        .result
        .with_context(|| format!("capture screen snapshot (gave up after {retries} retries)"))
}

/// One action to perform against the device.
#[derive(Debug, Clone, Copy)]
pub struct ActionRequest<'a> {
    pub action: &'a str,
    /// Description of the objective step the action serves.
    pub objective: &'a str,
    pub goal: &'a str,
    /// Snapshot observed before the action.
    pub snapshot: &'a Snapshot,
    /// Action clears an obstacle rather than advancing the plan.
    pub obstacle_clearing: bool,
}

/// What the executor reports back after performing an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub success: bool,
    pub outcome: String,
    /// Concrete device operations that were run.
    #[serde(default)]
    pub executed: Vec<String>,
}

/// Performs natural-language actions on the device.
pub trait ActionExecutor {
    /// Err is fatal to the run; `success: false` is also treated as a hard failure.
    fn perform(&self, request: &ActionRequest<'_>) -> Result<ActionReport>;
}

impl<A: ActionExecutor + ?Sized> ActionExecutor for &A {
    fn perform(&self, request: &ActionRequest<'_>) -> Result<ActionReport> {
        (**self).perform(request)
    }
}

const DUMP_MARKER: &str = "UI hierchary dumped to";

/// Screen provider backed by `adb exec-out uiautomator dump` and `screencap`.
pub struct AdbScreenProvider {
    config: DeviceConfig,
    capture_dir: PathBuf,
    output_limit_bytes: usize,
    seq: Cell<u32>,
}

impl AdbScreenProvider {
    pub fn new(config: DeviceConfig, state_dir: &Path) -> Self {
        Self {
            config,
            capture_dir: state_dir.join("captures"),
            output_limit_bytes: 8 * 1024 * 1024,
            seq: Cell::new(0),
        }
    }

    fn adb(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.adb);
        if let Some(serial) = &self.config.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        cmd
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    fn dump_layout(&self) -> Result<String> {
        let output = run_command_with_timeout(
            self.adb(&["exec-out", "uiautomator", "dump", "/dev/tty"]),
            None,
            self.timeout(),
            self.output_limit_bytes,
        )
        .context("run uiautomator dump")?;
        output.ensure_success("uiautomator dump")?;
        let layout = strip_dump_marker(&output.stdout_text());
        if !layout.contains("<hierarchy") {
            return Err(anyhow!("uiautomator dump returned no hierarchy"));
        }
        Ok(layout)
    }

    fn screencap(&self, id: u32) -> Result<PathBuf> {
        let output = run_command_with_timeout(
            self.adb(&["exec-out", "screencap", "-p"]),
            None,
            self.timeout(),
            self.output_limit_bytes,
        )
        .context("run screencap")?;
        output.ensure_success("screencap")?;
        if output.stdout.is_empty() || output.stdout_truncated > 0 {
            return Err(anyhow!("screencap produced an incomplete image"));
        }
        fs::create_dir_all(&self.capture_dir)
            .with_context(|| format!("create capture dir {}", self.capture_dir.display()))?;
        let path = self.capture_dir.join(format!("{id:04}.png"));
        fs::write(&path, &output.stdout)
            .with_context(|| format!("write screenshot {}", path.display()))?;
        Ok(path)
    }
}

impl ScreenProvider for AdbScreenProvider {
    #[instrument(skip_all, fields(serial = self.config.serial.as_deref()))]
    fn capture(&self) -> Result<Snapshot> {
        let id = self.seq.get() + 1;
        self.seq.set(id);
        let layout = self.dump_layout()?;
        // The visual capture is optional: Stage 1 still runs on the layout alone.
        let screenshot = match self.screencap(id) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "screencap failed; continuing without image");
                None
            }
        };
        debug!(id, layout_bytes = layout.len(), "captured snapshot");
        Ok(Snapshot {
            id,
            layout,
            screenshot,
        })
    }
}

/// Remove the trailing status line `uiautomator dump /dev/tty` appends.
fn strip_dump_marker(raw: &str) -> String {
    match raw.find(DUMP_MARKER) {
        Some(pos) => raw[..pos].trim().to_string(),
        None => raw.trim().to_string(),
    }
}
