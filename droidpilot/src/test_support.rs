//! Scripted collaborators and fixtures for engine tests.
//!
//! Fakes return queued results in order and record what they were asked, so
//! tests can assert on prompts, images and actions without a device or an agent.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::core::types::{CallKind, StateAnalysis};
use crate::io::device::{ActionExecutor, ActionReport, ActionRequest, ScreenProvider, Snapshot};
use crate::io::oracle::{Oracle, OracleRequest};

/// Oracle answering each [`CallKind`] from its own queue.
///
/// An empty queue is an error, which lets tests exercise fallbacks by simply
/// not scripting a call.
#[derive(Default)]
pub struct ScriptedOracle {
    queues: RefCell<HashMap<CallKind, VecDeque<Result<String, String>>>>,
    requests: RefCell<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw JSON result for `kind`.
    pub fn push(&self, kind: CallKind, json: &str) {
        self.queues
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push_back(Ok(json.to_string()));
    }

    /// Queue a failure for `kind`.
    pub fn push_err(&self, kind: CallKind, message: &str) {
        self.queues
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push_back(Err(message.to_string()));
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self, kind: CallKind) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|request| request.kind == kind)
            .count()
    }
}

impl Oracle for ScriptedOracle {
    fn infer(&self, request: &OracleRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        let next = self
            .queues
            .borrow_mut()
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(json)) => Ok(json),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!(
                "no scripted {} result left",
                request.kind.as_str()
            )),
        }
    }
}

/// Screen returning queued snapshots, then fresh empty ones.
pub struct ScriptedScreen {
    queue: RefCell<VecDeque<Result<Snapshot, String>>>,
    calls: Cell<u32>,
}

impl ScriptedScreen {
    pub fn new(snapshots: Vec<Result<Snapshot, String>>) -> Self {
        Self {
            queue: RefCell::new(snapshots.into()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl ScreenProvider for ScriptedScreen {
    fn capture(&self) -> Result<Snapshot> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(snapshot(call, "<hierarchy/>")),
        }
    }
}

/// What the actor was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAction {
    pub action: String,
    pub objective: String,
    pub snapshot_id: u32,
    pub obstacle_clearing: bool,
}

/// Action executor returning queued reports, then successes.
pub struct ScriptedActor {
    queue: RefCell<VecDeque<Result<ActionReport, String>>>,
    requests: RefCell<Vec<RecordedAction>>,
}

impl ScriptedActor {
    pub fn new(reports: Vec<Result<ActionReport, String>>) -> Self {
        Self {
            queue: RefCell::new(reports.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    pub fn requests(&self) -> Vec<RecordedAction> {
        self.requests.borrow().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.action.clone())
            .collect()
    }
}

impl ActionExecutor for ScriptedActor {
    fn perform(&self, request: &ActionRequest<'_>) -> Result<ActionReport> {
        self.requests.borrow_mut().push(RecordedAction {
            action: request.action.to_string(),
            objective: request.objective.to_string(),
            snapshot_id: request.snapshot.id,
            obstacle_clearing: request.obstacle_clearing,
        });
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ActionReport {
                success: true,
                outcome: format!("performed: {}", request.action),
                executed: Vec::new(),
            }),
        }
    }
}

pub fn snapshot(id: u32, layout: &str) -> Snapshot {
    Snapshot {
        id,
        layout: layout.to_string(),
        screenshot: None,
    }
}

/// A quiet analysis: no obstacle, no inconsistency, no defect.
pub fn analysis(achieved: bool) -> StateAnalysis {
    StateAnalysis {
        screen_changes: "screen updated".to_string(),
        screen_type: "settings".to_string(),
        main_elements: "list of settings entries".to_string(),
        blocking_obstacle: None,
        perception_inconsistency: None,
        app_defect_detected: false,
        app_defect_reason: None,
        is_stuck: false,
        current_step_achieved: achieved,
        current_step_evidence: if achieved {
            "target screen is visible".to_string()
        } else {
            "target screen not reached yet".to_string()
        },
        suggested_next_action: None,
    }
}

/// Schema-valid StateAnalysis JSON.
pub fn analysis_json(
    achieved: bool,
    obstacle: Option<&str>,
    inconsistency: Option<&str>,
) -> String {
    let mut state = analysis(achieved);
    state.blocking_obstacle = obstacle.map(str::to_string);
    state.perception_inconsistency = inconsistency.map(str::to_string);
    json!(state).to_string()
}

pub fn plan_json(steps: &[&str]) -> String {
    json!({ "steps": steps, "rationale": null }).to_string()
}

pub fn verdict_json(status: &str, reason: &str) -> String {
    json!({ "status": status, "reason": reason }).to_string()
}

pub fn evaluation_json(status: &str, reason: &str) -> String {
    json!({ "status": status, "reason": reason }).to_string()
}

pub fn decomposition_json(objectives: &[&str]) -> String {
    json!({ "objectives": objectives }).to_string()
}
