//! External execution boundary: the engine executor, the task registry, and
//! the worktree handle.
//!
//! The core never runs models or containers itself. Everything behind these
//! traits is an external collaborator; the state machine only consumes the
//! outcome.

pub mod cli;
pub mod registry;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ExecError;

/// Opaque worktree handle attached to a run. Created and destroyed by an
/// external collaborator; the core only carries it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRef {
    pub path: PathBuf,
    pub branch: String,
    pub main_repo: PathBuf,
}

/// A named task definition resolved from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Task-level prompt text, prepended to the step prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model: None,
            prompt: None,
        }
    }
}

/// Lookup of task definitions by name. Used to validate injected step names
/// and to resolve supervisor phase tasks.
pub trait TaskRegistry: Send + Sync {
    fn get_by_name(&self, name: &str) -> Option<TaskDefinition>;
}

/// One execution request handed to the engine executor.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Conductor-assigned id; also the caller identity for tool calls.
    pub task_id: String,
    pub process_id: String,
    pub task: TaskDefinition,
    pub engine: String,
    pub model: Option<String>,
    pub image: Option<String>,
    pub worktree: Option<WorktreeRef>,
    /// Fully assembled prompt: orientation context plus task and step
    /// prompts.
    pub prompt: String,
    pub is_orchestrator: bool,
}

/// Outcome of one engine execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub session_id: Option<String>,
    pub duration_ms: i64,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over engine execution for testability. Real implementation:
/// `CliExecutor`. Test double: scripted mocks in the integration tests.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the task to completion and return the outcome. A returned error
    /// means the engine could not run at all; a non-zero exit code means it
    /// ran and failed.
    async fn run(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError>;
}
