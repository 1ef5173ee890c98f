//! Process model: specs, steps, runs, and supervisor decisions.
//!
//! A `ProcessSpec` is the immutable on-disk definition of a pipeline. A
//! `ProcessRun` is the live, mutable execution state the machine drives.
//! `OrchestratorDecision` records what the supervisor decided at a phase
//! checkpoint; its shape is validated before it ever reaches the store.

pub mod guard;
pub mod loader;
pub mod machine;
pub mod resume;
pub mod supervisor;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::HistoryError;
use crate::exec::WorktreeRef;

/// Supervisory checkpoint within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreStep,
    PostStep,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreStep => "pre_step",
            Self::PostStep => "post_step",
            Self::Finalize => "finalize",
        }
    }

    /// Name of the task definition invoked for this phase.
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::PreStep => "orchestrator-pre",
            Self::PostStep => "orchestrator-post",
            Self::Finalize => "orchestrator-finalize",
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_step" => Ok(Self::PreStep),
            "post_step" => Ok(Self::PostStep),
            "finalize" => Ok(Self::Finalize),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// The supervisor's verdict at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Proceed,
    Inject,
    Abort,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Inject => "inject",
            Self::Abort => "abort",
        }
    }
}

impl FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proceed" => Ok(Self::Proceed),
            "inject" => Ok(Self::Inject),
            "abort" => Ok(Self::Abort),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

/// One unit of work within a process, referencing a task with optional
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_orchestrator: bool,
    /// Set only on steps created by injection: the step index that was
    /// active when the injection was decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_step_index: Option<usize>,
}

impl ProcessStep {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            engine: None,
            model: None,
            prompt: None,
            skip_orchestrator: false,
            origin_step_index: None,
        }
    }
}

/// Immutable definition of a process: an ordered sequence of step templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ProcessStep>,
    /// Process-level supervisor overlay; only set fields override the
    /// global configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<crate::config::SupervisorOverlay>,
}

/// A step requested for injection by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectedStep {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A decision made by the supervisor at a phase checkpoint. Immutable once
/// recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorDecision {
    pub phase: Phase,
    pub step_index: usize,
    pub decision: DecisionKind,
    pub reasoning: String,
    #[serde(default)]
    pub injected_steps: Vec<InjectedStep>,
    /// Task id of the supervisor invocation that recorded this decision.
    pub task_id: String,
    pub created_at: String,
}

impl OrchestratorDecision {
    /// Check the mutual-exclusion invariant: `injected_steps` is non-empty
    /// iff the decision is `inject`. Called before any write; a decision
    /// that fails here never reaches the store.
    pub fn validate(&self) -> Result<(), HistoryError> {
        match (self.decision, self.injected_steps.is_empty()) {
            (DecisionKind::Inject, true) => Err(HistoryError::InvalidDecision(
                "inject decision must carry at least one injected step".into(),
            )),
            (DecisionKind::Proceed | DecisionKind::Abort, false) => {
                Err(HistoryError::InvalidDecision(format!(
                    "{} decision must not carry injected steps",
                    self.decision.as_str()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Result of executing a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub task_name: String,
    pub task_id: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: i64,
}

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// Live state of an executing process. Mutated exclusively by the state
/// machine while running; read-only once terminal.
#[derive(Debug, Clone)]
pub struct ProcessRun {
    pub process_id: String,
    pub spec: ProcessSpec,
    /// The live step queue. Grows by insertion at the current index
    /// boundary; already-executed entries are never reordered or removed.
    pub steps: Vec<ProcessStep>,
    pub results: Vec<StepResult>,
    pub current_index: usize,
    pub state: RunState,
    pub worktree: Option<WorktreeRef>,
    pub decisions: Vec<OrchestratorDecision>,
    pub parent_process_id: Option<String>,
    /// Reason recorded when the run aborted.
    pub abort_reason: Option<String>,
}

impl ProcessRun {
    pub fn new(process_id: impl Into<String>, spec: ProcessSpec) -> Self {
        let steps = spec.steps.clone();
        Self {
            process_id: process_id.into(),
            spec,
            steps,
            results: Vec::new(),
            current_index: 0,
            state: RunState::Running,
            worktree: None,
            decisions: Vec::new(),
            parent_process_id: None,
            abort_reason: None,
        }
    }

    pub fn with_worktree(mut self, worktree: WorktreeRef) -> Self {
        self.worktree = Some(worktree);
        self
    }

    /// Insert injected steps immediately before the current index, tagging
    /// each with the originating step index. The step previously at the
    /// current index shifts right; the first injected step becomes current.
    pub fn inject_steps(&mut self, requested: &[InjectedStep], origin: usize) {
        let new_steps: Vec<ProcessStep> = requested
            .iter()
            .map(|s| ProcessStep {
                task: s.task.clone(),
                engine: None,
                model: None,
                prompt: s.prompt.clone(),
                skip_orchestrator: false,
                origin_step_index: Some(origin),
            })
            .collect();
        self.steps
            .splice(self.current_index..self.current_index, new_steps);
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}
