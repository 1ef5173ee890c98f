//! Rebuilding a `ProcessRun` from persisted history.
//!
//! Resolution accepts three key kinds: a task id from a previous invocation,
//! a branch name, or an engine session id. All three funnel into the same
//! persisted run row; the rebuilt run picks up at the first unexecuted step
//! and the state machine continues as if uninterrupted.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

use crate::errors::ProcessError;
use crate::exec::WorktreeRef;
use crate::history::{RunRow, StoreHandle};
use crate::process::{ProcessRun, ProcessSpec};
use crate::util::short_id;

/// How a resumption key should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    TaskId,
    Branch,
    SessionId,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskId => "task_id",
            Self::Branch => "branch",
            Self::SessionId => "session_id",
        }
    }
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_id" | "task" => Ok(Self::TaskId),
            "branch" => Ok(Self::Branch),
            "session_id" | "session" => Ok(Self::SessionId),
            _ => Err(format!("Invalid key kind: {}", s)),
        }
    }
}

pub struct ResumptionResolver {
    store: StoreHandle,
}

impl ResumptionResolver {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Rebuild the run identified by `key`. Terminal runs are not
    /// resumable.
    pub async fn resolve(&self, key: &str, kind: KeyKind) -> Result<ProcessRun, ProcessError> {
        let owned_key = key.to_string();
        let process_id = self
            .store
            .call(move |store| match kind {
                KeyKind::TaskId => store.process_id_for_task(&owned_key),
                KeyKind::Branch => store.process_id_for_branch(&owned_key),
                KeyKind::SessionId => store.process_id_for_session(&owned_key),
            })
            .await?
            .ok_or_else(|| ProcessError::RunNotFound {
                kind: kind.as_str().to_string(),
                key: key.to_string(),
            })?;

        let row = self.run_row(&process_id).await?;
        if row.state.is_terminal() {
            return Err(ProcessError::NotResumable {
                process_id,
                reason: format!("run is already {}", row.state.as_str()),
            });
        }

        let run = self.rebuild(row).await?;
        info!(
            process_id = %run.process_id,
            current_index = run.current_index,
            pending = run.steps.len() - run.current_index,
            "Resolved run for resumption"
        );
        Ok(run)
    }

    /// Create a fresh child run carrying the parent's worktree context and
    /// a new single-step plan. The relationship is explicit through
    /// `parent_process_id`; no live state is shared.
    pub async fn continue_from(
        &self,
        parent_task_id: &str,
        spec: ProcessSpec,
    ) -> Result<ProcessRun, ProcessError> {
        let owned_key = parent_task_id.to_string();
        let parent_process_id = self
            .store
            .call(move |store| store.process_id_for_task(&owned_key))
            .await?
            .ok_or_else(|| ProcessError::RunNotFound {
                kind: "task_id".to_string(),
                key: parent_task_id.to_string(),
            })?;

        let parent = self.run_row(&parent_process_id).await?;

        let mut run = ProcessRun::new(format!("proc_{}", short_id()), spec);
        run.parent_process_id = Some(parent.process_id.clone());
        run.worktree = worktree_from_row(&parent);

        {
            let snapshot = run.clone();
            self.store
                .call(move |store| store.upsert_run(&snapshot))
                .await?;
        }

        info!(
            process_id = %run.process_id,
            parent_process_id = %parent.process_id,
            "Created continuation run"
        );
        Ok(run)
    }

    async fn run_row(&self, process_id: &str) -> Result<RunRow, ProcessError> {
        let owned = process_id.to_string();
        let row = self
            .store
            .call(move |store| store.get_run(&owned))
            .await?
            .ok_or_else(|| ProcessError::RunNotFound {
                kind: "process_id".to_string(),
                key: process_id.to_string(),
            })?;
        Ok(row)
    }

    /// Reconstruct the live run from a persisted row: spec steps as the
    /// original plan, live steps (with any injections) as the queue, and
    /// completed results from the task log.
    async fn rebuild(&self, row: RunRow) -> Result<ProcessRun, ProcessError> {
        let process_id = row.process_id.clone();
        let results = self
            .store
            .call(move |store| store.step_results(&process_id))
            .await?;
        let process_id = row.process_id.clone();
        let decisions = self
            .store
            .call(move |store| store.decisions_for_process(&process_id))
            .await?;

        let spec = ProcessSpec {
            name: row.name.clone(),
            description: row.description.clone(),
            steps: row.spec_steps.clone(),
            orchestrator: None,
        };

        // First unexecuted step: the persisted index, clamped to the queue.
        let completed = results.iter().filter(|r| r.success).count();
        let current_index = row.current_index.max(completed).min(row.live_steps.len());

        Ok(ProcessRun {
            process_id: row.process_id.clone(),
            spec,
            steps: row.live_steps.clone(),
            results,
            current_index,
            state: row.state,
            worktree: worktree_from_row(&row),
            decisions,
            parent_process_id: row.parent_process_id.clone(),
            abort_reason: row.abort_reason,
        })
    }
}

fn worktree_from_row(row: &RunRow) -> Option<WorktreeRef> {
    match (&row.branch, &row.worktree, &row.main_repo) {
        (Some(branch), Some(path), Some(main_repo)) => Some(WorktreeRef {
            path: PathBuf::from(path),
            branch: branch.clone(),
            main_repo: PathBuf::from(main_repo),
        }),
        _ => None,
    }
}
