//! History models: execution records and the process-state read model.

pub mod store;

pub use store::{HistoryStore, StoreHandle};

use serde::{Deserialize, Serialize};

use crate::process::{OrchestratorDecision, ProcessStep, RunState, StepResult};

/// Immutable record of one worker or supervisor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: String,
    pub process_id: String,
    pub created_at: String,
    pub branch: String,
    pub worktree: String,
    pub main_repo: String,
    pub engine: String,

    /// Identity flag consulted by the tool scope gate. Immutable once set.
    #[serde(default)]
    pub is_orchestrator: bool,
    /// Position in the live step queue; `None` for supervisor invocations.
    #[serde(default)]
    pub step_index: Option<usize>,

    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_hash: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Previous task in the same process, if any.
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Completion fields applied to a task log when its execution finishes.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub finished_at: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub session_id: Option<String>,
}

/// Result artifact written by a task via the `write_result` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub result_text: String,
    #[serde(default)]
    pub summary_text: Option<String>,
    #[serde(default)]
    pub key_files: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
}

/// Persisted snapshot of a run, as stored in the `process_run` table.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub process_id: String,
    pub name: String,
    pub description: String,
    /// Original step templates from the process definition.
    pub spec_steps: Vec<ProcessStep>,
    /// Live step queue including injections, in execution order.
    pub live_steps: Vec<ProcessStep>,
    pub current_index: usize,
    pub state: RunState,
    pub abort_reason: Option<String>,
    pub branch: Option<String>,
    pub worktree: Option<String>,
    pub main_repo: Option<String>,
    pub parent_process_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// The read model backing the `get_process_state` tool: what has run, what
/// is pending, and every decision taken so far. Reflects the live, mutated
/// step list — exactly what the driving loop executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStateView {
    pub process_id: String,
    pub name: String,
    pub state: RunState,
    pub current_index: usize,
    pub steps: Vec<ProcessStep>,
    pub completed: Vec<StepResult>,
    pub pending: Vec<ProcessStep>,
    pub decisions: Vec<OrchestratorDecision>,
}
