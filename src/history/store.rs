//! SQLite-backed history store.
//!
//! Durable, versioned storage for task logs, run snapshots, supervisor
//! decisions, and task results. Writes for a given process are serialized by
//! the run's own driving loop; distinct runs share the store through the
//! connection mutex.
//!
//! Schema migrations are additive and applied sequentially on open; older
//! persisted runs stay resumable.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::HistoryError;
use crate::history::{ProcessStateView, RunRow, TaskCompletion, TaskLog, TaskResult};
use crate::process::{
    DecisionKind, InjectedStep, OrchestratorDecision, Phase, ProcessRun, ProcessStep, RunState,
    StepResult,
};
use crate::util::now_iso;

/// Current schema version. Bump together with an entry in `MIGRATIONS`.
const SCHEMA_VERSION: i64 = 3;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS task_log (
    task_id TEXT PRIMARY KEY,
    process_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT,

    branch TEXT NOT NULL,
    worktree TEXT NOT NULL,
    main_repo TEXT NOT NULL,

    engine TEXT NOT NULL,
    model TEXT,
    session_id TEXT,

    task_name TEXT,
    step_index INTEGER,
    prompt TEXT,
    prompt_hash TEXT,

    duration_ms INTEGER,
    success INTEGER,
    exit_code INTEGER,
    error_message TEXT,

    parent_id TEXT REFERENCES task_log(task_id)
);

CREATE INDEX IF NOT EXISTS idx_task_log_process ON task_log(process_id);
CREATE INDEX IF NOT EXISTS idx_task_log_branch ON task_log(branch);
CREATE INDEX IF NOT EXISTS idx_task_log_session ON task_log(session_id)
    WHERE session_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS process_run (
    process_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    spec_steps TEXT NOT NULL,
    live_steps TEXT NOT NULL,
    current_index INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'running',
    abort_reason TEXT,
    branch TEXT,
    worktree TEXT,
    main_repo TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orchestrator_decision (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id TEXT NOT NULL,
    task_id TEXT NOT NULL REFERENCES task_log(task_id),
    phase TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    decision TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    injected_steps TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decision_process ON orchestrator_decision(process_id);

CREATE TABLE IF NOT EXISTS task_result (
    task_id TEXT PRIMARY KEY REFERENCES task_log(task_id),
    result_text TEXT NOT NULL,
    summary_text TEXT,
    key_files TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);
";

/// Sequential migrations: `(from_version, statements)`. Additive only —
/// add column or table, never destructive — so older databases migrate in
/// place and stay resumable.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "ALTER TABLE task_log ADD COLUMN is_orchestrator INTEGER NOT NULL DEFAULT 0;",
    ),
    (
        2,
        "ALTER TABLE process_run ADD COLUMN parent_process_id TEXT;",
    ),
];

pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Open (or create) the history database at the given path and bring
    /// the schema up to date.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), HistoryError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.migrate()?;
        Ok(())
    }

    fn schema_version(&self) -> Result<i64, HistoryError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    /// Apply pending migrations sequentially. Each step tolerates being
    /// re-run against a database that already has the column (a crash
    /// between the ALTER and the version bump leaves exactly that state).
    fn migrate(&self) -> Result<(), HistoryError> {
        let mut version = self.schema_version()?;
        if version == 0 {
            // Fresh database: SCHEMA_SQL already reflects version 1.
            self.conn
                .execute("INSERT INTO schema_version (version) VALUES (?1)", [1i64])?;
            version = 1;
        }

        while version < SCHEMA_VERSION {
            if let Some((_, sql)) = MIGRATIONS.iter().find(|(from, _)| *from == version) {
                match self.conn.execute_batch(sql) {
                    Ok(()) => {}
                    Err(e) if e.to_string().contains("duplicate column") => {}
                    Err(e) => return Err(e.into()),
                }
            }
            version += 1;
            self.conn
                .execute("UPDATE schema_version SET version = ?1", [version])?;
        }
        Ok(())
    }

    // ── Task log ──────────────────────────────────────────────────────

    pub fn append_task_log(&self, log: &TaskLog) -> Result<(), HistoryError> {
        self.conn.execute(
            "INSERT INTO task_log (
                task_id, process_id, created_at, finished_at,
                branch, worktree, main_repo,
                engine, model, session_id,
                task_name, step_index, prompt, prompt_hash,
                duration_ms, success, exit_code, error_message,
                parent_id, is_orchestrator
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                log.task_id,
                log.process_id,
                log.created_at,
                log.finished_at,
                log.branch,
                log.worktree,
                log.main_repo,
                log.engine,
                log.model,
                log.session_id,
                log.task_name,
                log.step_index.map(|i| i as i64),
                log.prompt,
                log.prompt_hash,
                log.duration_ms,
                log.success.map(i64::from),
                log.exit_code,
                log.error_message,
                log.parent_id,
                i64::from(log.is_orchestrator),
            ],
        )?;
        Ok(())
    }

    pub fn complete_task_log(
        &self,
        task_id: &str,
        completion: &TaskCompletion,
    ) -> Result<(), HistoryError> {
        let changed = self.conn.execute(
            "UPDATE task_log SET
                finished_at = ?2, success = ?3, exit_code = ?4,
                duration_ms = ?5, error_message = ?6,
                session_id = COALESCE(?7, session_id)
             WHERE task_id = ?1",
            params![
                task_id,
                completion.finished_at,
                i64::from(completion.success),
                completion.exit_code,
                completion.duration_ms,
                completion.error_message,
                completion.session_id,
            ],
        )?;
        if changed == 0 {
            return Err(HistoryError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskLog>, HistoryError> {
        let log = self
            .conn
            .query_row(
                "SELECT * FROM task_log WHERE task_id = ?1",
                [task_id],
                Self::task_log_from_row,
            )
            .optional()?;
        Ok(log)
    }

    /// Resolve the identity flag for the scope gate. `None` when the task
    /// is unknown — callers must treat that as non-orchestrator.
    pub fn is_orchestrator(&self, task_id: &str) -> Result<Option<bool>, HistoryError> {
        let flag: Option<i64> = self
            .conn
            .query_row(
                "SELECT is_orchestrator FROM task_log WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.map(|v| v != 0))
    }

    fn task_log_from_row(row: &Row<'_>) -> rusqlite::Result<TaskLog> {
        Ok(TaskLog {
            task_id: row.get("task_id")?,
            process_id: row.get("process_id")?,
            created_at: row.get("created_at")?,
            finished_at: row.get("finished_at")?,
            branch: row.get("branch")?,
            worktree: row.get("worktree")?,
            main_repo: row.get("main_repo")?,
            engine: row.get("engine")?,
            model: row.get("model")?,
            session_id: row.get("session_id")?,
            task_name: row.get("task_name")?,
            step_index: row
                .get::<_, Option<i64>>("step_index")?
                .map(|i| i as usize),
            prompt: row.get("prompt")?,
            prompt_hash: row.get("prompt_hash")?,
            duration_ms: row.get("duration_ms")?,
            success: row.get::<_, Option<i64>>("success")?.map(|v| v != 0),
            exit_code: row.get("exit_code")?,
            error_message: row.get("error_message")?,
            parent_id: row.get("parent_id")?,
            is_orchestrator: row.get::<_, i64>("is_orchestrator")? != 0,
        })
    }

    // ── Decisions ─────────────────────────────────────────────────────

    /// Append a supervisor decision. The injected-steps invariant is a
    /// precondition: an invalid shape is rejected before any write, so the
    /// audit trail never contains an invalid record.
    pub fn append_decision(
        &self,
        process_id: &str,
        decision: &OrchestratorDecision,
    ) -> Result<(), HistoryError> {
        decision.validate()?;
        let injected = serde_json::to_string(&decision.injected_steps)
            .context("Failed to serialize injected steps")?;
        self.conn.execute(
            "INSERT INTO orchestrator_decision (
                process_id, task_id, phase, step_index, decision,
                reasoning, injected_steps, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                process_id,
                decision.task_id,
                decision.phase.as_str(),
                decision.step_index as i64,
                decision.decision.as_str(),
                decision.reasoning,
                injected,
                decision.created_at,
            ],
        )?;
        Ok(())
    }

    /// All decisions for a process, in recording order.
    pub fn decisions_for_process(
        &self,
        process_id: &str,
    ) -> Result<Vec<OrchestratorDecision>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT phase, step_index, decision, reasoning, injected_steps, task_id, created_at
             FROM orchestrator_decision WHERE process_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([process_id], Self::decision_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent decision recorded by a specific supervisor invocation.
    pub fn latest_decision_by_task(
        &self,
        process_id: &str,
        task_id: &str,
    ) -> Result<Option<OrchestratorDecision>, HistoryError> {
        let decision = self
            .conn
            .query_row(
                "SELECT phase, step_index, decision, reasoning, injected_steps, task_id, created_at
                 FROM orchestrator_decision
                 WHERE process_id = ?1 AND task_id = ?2
                 ORDER BY id DESC LIMIT 1",
                params![process_id, task_id],
                Self::decision_from_row,
            )
            .optional()?;
        Ok(decision)
    }

    fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<OrchestratorDecision> {
        let phase_raw: String = row.get(0)?;
        let decision_raw: String = row.get(2)?;
        let injected_raw: String = row.get(4)?;
        let injected: Vec<InjectedStep> =
            serde_json::from_str(&injected_raw).unwrap_or_default();
        Ok(OrchestratorDecision {
            phase: Phase::from_str(&phase_raw).unwrap_or(Phase::PreStep),
            step_index: row.get::<_, i64>(1)? as usize,
            decision: DecisionKind::from_str(&decision_raw).unwrap_or(DecisionKind::Proceed),
            reasoning: row.get(3)?,
            injected_steps: injected,
            task_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    // ── Run snapshots ─────────────────────────────────────────────────

    /// Persist the run's current state. Called before every supervisor
    /// invocation and after every mutation, so the store is the medium
    /// through which the sandboxed agent observes the loop.
    pub fn upsert_run(&self, run: &ProcessRun) -> Result<(), HistoryError> {
        let spec_steps = serde_json::to_string(&run.spec.steps)
            .context("Failed to serialize spec steps")?;
        let live_steps =
            serde_json::to_string(&run.steps).context("Failed to serialize live steps")?;
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO process_run (
                process_id, name, description, spec_steps, live_steps,
                current_index, state, abort_reason,
                branch, worktree, main_repo, parent_process_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(process_id) DO UPDATE SET
                live_steps = excluded.live_steps,
                current_index = excluded.current_index,
                state = excluded.state,
                abort_reason = excluded.abort_reason,
                updated_at = excluded.updated_at",
            params![
                run.process_id,
                run.spec.name,
                run.spec.description,
                spec_steps,
                live_steps,
                run.current_index as i64,
                run.state.as_str(),
                run.abort_reason,
                run.worktree.as_ref().map(|w| w.branch.clone()),
                run.worktree
                    .as_ref()
                    .map(|w| w.path.display().to_string()),
                run.worktree
                    .as_ref()
                    .map(|w| w.main_repo.display().to_string()),
                run.parent_process_id,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, process_id: &str) -> Result<Option<RunRow>, HistoryError> {
        let row = self
            .conn
            .query_row(
                "SELECT process_id, name, description, spec_steps, live_steps,
                        current_index, state, abort_reason,
                        branch, worktree, main_repo, parent_process_id,
                        created_at, updated_at
                 FROM process_run WHERE process_id = ?1",
                [process_id],
                Self::run_row_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn run_row_from_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
        let spec_raw: String = row.get(3)?;
        let live_raw: String = row.get(4)?;
        let state_raw: String = row.get(6)?;
        let spec_steps: Vec<ProcessStep> = serde_json::from_str(&spec_raw).unwrap_or_default();
        let live_steps: Vec<ProcessStep> = serde_json::from_str(&live_raw).unwrap_or_default();
        Ok(RunRow {
            process_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            spec_steps,
            live_steps,
            current_index: row.get::<_, i64>(5)? as usize,
            state: RunState::from_str(&state_raw).unwrap_or(RunState::Running),
            abort_reason: row.get(7)?,
            branch: row.get(8)?,
            worktree: row.get(9)?,
            main_repo: row.get(10)?,
            parent_process_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    // ── Lookups for resumption ────────────────────────────────────────

    pub fn process_id_for_task(&self, task_id: &str) -> Result<Option<String>, HistoryError> {
        let id = self
            .conn
            .query_row(
                "SELECT process_id FROM task_log WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn process_id_for_branch(&self, branch: &str) -> Result<Option<String>, HistoryError> {
        let id = self
            .conn
            .query_row(
                "SELECT process_id FROM task_log WHERE branch = ?1
                 ORDER BY created_at DESC LIMIT 1",
                [branch],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn process_id_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, HistoryError> {
        let id = self
            .conn
            .query_row(
                "SELECT process_id FROM task_log WHERE session_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Per-step outcomes for a process: worker task logs with a recorded
    /// result, in step order.
    pub fn step_results(&self, process_id: &str) -> Result<Vec<StepResult>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT step_index, task_name, task_id, success, exit_code, duration_ms
             FROM task_log
             WHERE process_id = ?1 AND step_index IS NOT NULL AND success IS NOT NULL
             ORDER BY step_index",
        )?;
        let rows = stmt.query_map([process_id], |row| {
            Ok(StepResult {
                step_index: row.get::<_, i64>(0)? as usize,
                task_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                task_id: row.get(2)?,
                success: row.get::<_, i64>(3)? != 0,
                exit_code: row.get::<_, Option<i32>>(4)?.unwrap_or(-1),
                duration_ms: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Build the read model for the state-query tool.
    pub fn read_process_state(
        &self,
        process_id: &str,
    ) -> Result<ProcessStateView, HistoryError> {
        let run = self
            .get_run(process_id)?
            .ok_or_else(|| HistoryError::ProcessNotFound {
                process_id: process_id.to_string(),
            })?;
        let completed = self.step_results(process_id)?;
        let decisions = self.decisions_for_process(process_id)?;
        let pending = run
            .live_steps
            .get(run.current_index..)
            .unwrap_or_default()
            .to_vec();
        Ok(ProcessStateView {
            process_id: run.process_id,
            name: run.name,
            state: run.state,
            current_index: run.current_index,
            steps: run.live_steps,
            completed,
            pending,
            decisions,
        })
    }

    // ── Task results ──────────────────────────────────────────────────

    pub fn create_result(
        &self,
        task_id: &str,
        result_text: &str,
        key_files: &[String],
        tags: &[String],
    ) -> Result<(), HistoryError> {
        let key_files_json =
            serde_json::to_string(key_files).context("Failed to serialize key files")?;
        let tags_json = serde_json::to_string(tags).context("Failed to serialize tags")?;
        self.conn.execute(
            "INSERT INTO task_result (task_id, result_text, key_files, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(task_id) DO UPDATE SET
                result_text = excluded.result_text,
                key_files = excluded.key_files,
                tags = excluded.tags",
            params![task_id, result_text, key_files_json, tags_json, now_iso()],
        )?;
        Ok(())
    }

    pub fn update_summary(&self, task_id: &str, summary: &str) -> Result<(), HistoryError> {
        self.conn.execute(
            "UPDATE task_result SET summary_text = ?2 WHERE task_id = ?1",
            params![task_id, summary],
        )?;
        Ok(())
    }

    pub fn get_result_by_task_id(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskResult>, HistoryError> {
        let result = self
            .conn
            .query_row(
                "SELECT task_id, result_text, summary_text, key_files, tags, created_at
                 FROM task_result WHERE task_id = ?1",
                [task_id],
                Self::task_result_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Most recent result for a named task within a process.
    pub fn get_result_by_task_name(
        &self,
        task_name: &str,
        process_id: &str,
    ) -> Result<Option<TaskResult>, HistoryError> {
        let result = self
            .conn
            .query_row(
                "SELECT r.task_id, r.result_text, r.summary_text, r.key_files, r.tags, r.created_at
                 FROM task_result r
                 JOIN task_log t ON t.task_id = r.task_id
                 WHERE t.process_id = ?1 AND t.task_name = ?2
                 ORDER BY r.created_at DESC LIMIT 1",
                params![process_id, task_name],
                Self::task_result_from_row,
            )
            .optional()?;
        Ok(result)
    }

    fn task_result_from_row(row: &Row<'_>) -> rusqlite::Result<TaskResult> {
        let key_files_raw: String = row.get(3)?;
        let tags_raw: String = row.get(4)?;
        Ok(TaskResult {
            task_id: row.get(0)?,
            result_text: row.get(1)?,
            summary_text: row.get(2)?,
            key_files: serde_json::from_str(&key_files_raw).unwrap_or_default(),
            tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
            created_at: row.get(5)?,
        })
    }
}

/// Async-safe handle to the history store.
///
/// Wraps `HistoryStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool, preventing synchronous SQLite I/O from tying up
/// async worker threads. Distinct processes write concurrently through the
/// same handle; the connection mutex serializes the actual statements.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<HistoryStore>>,
}

impl StoreHandle {
    pub fn new(store: HistoryStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with store access on a blocking thread. All data
    /// passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, HistoryError>
    where
        F: FnOnce(&HistoryStore) -> Result<R, HistoryError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| HistoryError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| HistoryError::Other(anyhow::anyhow!("Store task panicked: {}", e)))?
    }

    /// Synchronous access for startup, tool handlers running on blocking
    /// threads, and tests. Not for hot async paths.
    pub fn lock_sync(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HistoryStore>, HistoryError> {
        self.inner.lock().map_err(|_| HistoryError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSpec;

    fn make_log(task_id: &str, process_id: &str) -> TaskLog {
        TaskLog {
            task_id: task_id.into(),
            process_id: process_id.into(),
            created_at: now_iso(),
            finished_at: None,
            branch: "conductor/test".into(),
            worktree: "/tmp/worktree".into(),
            main_repo: "/home/user/project".into(),
            engine: "claude".into(),
            model: None,
            session_id: None,
            task_name: Some("analyse".into()),
            step_index: Some(0),
            prompt: Some("do it".into()),
            prompt_hash: None,
            duration_ms: None,
            success: None,
            exit_code: None,
            error_message: None,
            parent_id: None,
            is_orchestrator: false,
        }
    }

    fn make_decision(task_id: &str, kind: DecisionKind) -> OrchestratorDecision {
        let injected = if kind == DecisionKind::Inject {
            vec![InjectedStep {
                task: "hotfix".into(),
                prompt: Some("fix".into()),
            }]
        } else {
            vec![]
        };
        OrchestratorDecision {
            phase: Phase::PreStep,
            step_index: 0,
            decision: kind,
            reasoning: "because".into(),
            injected_steps: injected,
            task_id: task_id.into(),
            created_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn spec(tasks: &[&str]) -> ProcessSpec {
        ProcessSpec {
            name: "p".into(),
            description: String::new(),
            steps: tasks
                .iter()
                .map(|t| crate::process::ProcessStep::new(*t))
                .collect(),
            orchestrator: None,
        }
    }

    #[test]
    fn task_log_roundtrip() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "p1")).unwrap();

        let log = store.get_task("t1").unwrap().unwrap();
        assert_eq!(log.process_id, "p1");
        assert_eq!(log.step_index, Some(0));
        assert!(!log.is_orchestrator);
        assert!(log.success.is_none());
    }

    #[test]
    fn complete_task_log_updates_outcome() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "p1")).unwrap();
        store
            .complete_task_log(
                "t1",
                &TaskCompletion {
                    finished_at: now_iso(),
                    success: true,
                    exit_code: 0,
                    duration_ms: 1200,
                    error_message: None,
                    session_id: Some("sess_abc".into()),
                },
            )
            .unwrap();

        let log = store.get_task("t1").unwrap().unwrap();
        assert_eq!(log.success, Some(true));
        assert_eq!(log.exit_code, Some(0));
        assert_eq!(log.session_id.as_deref(), Some("sess_abc"));
    }

    #[test]
    fn complete_unknown_task_is_an_error() {
        let store = HistoryStore::open_in_memory().unwrap();
        let err = store
            .complete_task_log("ghost", &TaskCompletion::default())
            .unwrap_err();
        assert!(matches!(err, HistoryError::TaskNotFound { .. }));
    }

    #[test]
    fn is_orchestrator_resolves_flag_and_unknown() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut log = make_log("orch1", "p1");
        log.is_orchestrator = true;
        log.step_index = None;
        store.append_task_log(&log).unwrap();
        store.append_task_log(&make_log("work1", "p1")).unwrap();

        assert_eq!(store.is_orchestrator("orch1").unwrap(), Some(true));
        assert_eq!(store.is_orchestrator("work1").unwrap(), Some(false));
        assert_eq!(store.is_orchestrator("ghost").unwrap(), None);
    }

    #[test]
    fn append_decision_rejects_invalid_shape_without_write() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "p1")).unwrap();

        let mut bad = make_decision("t1", DecisionKind::Proceed);
        bad.injected_steps = vec![InjectedStep {
            task: "x".into(),
            prompt: None,
        }];
        assert!(store.append_decision("p1", &bad).is_err());
        assert!(store.decisions_for_process("p1").unwrap().is_empty());
    }

    #[test]
    fn decisions_roundtrip_with_injected_steps() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "p1")).unwrap();
        store
            .append_decision("p1", &make_decision("t1", DecisionKind::Inject))
            .unwrap();

        let decisions = store.decisions_for_process("p1").unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision, DecisionKind::Inject);
        assert_eq!(decisions[0].injected_steps[0].task, "hotfix");
    }

    #[test]
    fn decisions_are_scoped_to_process() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "pA")).unwrap();
        store.append_task_log(&make_log("t2", "pB")).unwrap();
        store
            .append_decision("pA", &make_decision("t1", DecisionKind::Proceed))
            .unwrap();
        store
            .append_decision("pB", &make_decision("t2", DecisionKind::Abort))
            .unwrap();

        assert_eq!(store.decisions_for_process("pA").unwrap().len(), 1);
        assert_eq!(
            store.decisions_for_process("pB").unwrap()[0].decision,
            DecisionKind::Abort
        );
    }

    #[test]
    fn latest_decision_by_task_takes_newest() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "p1")).unwrap();
        store
            .append_decision("p1", &make_decision("t1", DecisionKind::Proceed))
            .unwrap();
        store
            .append_decision("p1", &make_decision("t1", DecisionKind::Abort))
            .unwrap();

        let latest = store.latest_decision_by_task("p1", "t1").unwrap().unwrap();
        assert_eq!(latest.decision, DecisionKind::Abort);
        assert!(store.latest_decision_by_task("p1", "other").unwrap().is_none());
    }

    #[test]
    fn run_snapshot_roundtrip_and_update() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut run = ProcessRun::new("p1", spec(&["a", "b"]));
        store.upsert_run(&run).unwrap();

        run.inject_steps(
            &[InjectedStep {
                task: "fix".into(),
                prompt: None,
            }],
            0,
        );
        run.current_index = 1;
        store.upsert_run(&run).unwrap();

        let row = store.get_run("p1").unwrap().unwrap();
        assert_eq!(row.spec_steps.len(), 2);
        assert_eq!(row.live_steps.len(), 3);
        assert_eq!(row.live_steps[0].task, "fix");
        assert_eq!(row.current_index, 1);
        assert_eq!(row.state, RunState::Running);
    }

    #[test]
    fn read_process_state_reflects_live_list() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut run = ProcessRun::new("p1", spec(&["a", "b"]));
        run.inject_steps(
            &[InjectedStep {
                task: "fix".into(),
                prompt: None,
            }],
            0,
        );
        store.upsert_run(&run).unwrap();

        let mut log = make_log("t1", "p1");
        log.task_name = Some("fix".into());
        store.append_task_log(&log).unwrap();
        store
            .complete_task_log(
                "t1",
                &TaskCompletion {
                    finished_at: now_iso(),
                    success: true,
                    exit_code: 0,
                    duration_ms: 10,
                    error_message: None,
                    session_id: None,
                },
            )
            .unwrap();

        let state = store.read_process_state("p1").unwrap();
        assert_eq!(state.steps.len(), 3);
        assert_eq!(state.steps[0].task, "fix");
        assert_eq!(state.completed.len(), 1);
        assert_eq!(state.pending.len(), 3); // current_index still 0
    }

    #[test]
    fn read_process_state_unknown_process_errors() {
        let store = HistoryStore::open_in_memory().unwrap();
        assert!(matches!(
            store.read_process_state("ghost").unwrap_err(),
            HistoryError::ProcessNotFound { .. }
        ));
    }

    #[test]
    fn lookups_by_branch_and_session() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut log = make_log("t1", "p1");
        log.branch = "conductor/feature".into();
        store.append_task_log(&log).unwrap();
        store
            .complete_task_log(
                "t1",
                &TaskCompletion {
                    finished_at: now_iso(),
                    success: true,
                    exit_code: 0,
                    duration_ms: 5,
                    error_message: None,
                    session_id: Some("sess_1".into()),
                },
            )
            .unwrap();

        assert_eq!(
            store.process_id_for_task("t1").unwrap().as_deref(),
            Some("p1")
        );
        assert_eq!(
            store
                .process_id_for_branch("conductor/feature")
                .unwrap()
                .as_deref(),
            Some("p1")
        );
        assert_eq!(
            store.process_id_for_session("sess_1").unwrap().as_deref(),
            Some("p1")
        );
        assert!(store.process_id_for_task("ghost").unwrap().is_none());
    }

    #[test]
    fn task_results_roundtrip_by_id_and_name() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&make_log("t1", "p1")).unwrap();
        store
            .create_result("t1", "found three bugs", &["src/a.rs".into()], &[])
            .unwrap();
        store.update_summary("t1", "3 bugs").unwrap();

        let by_id = store.get_result_by_task_id("t1").unwrap().unwrap();
        assert_eq!(by_id.result_text, "found three bugs");
        assert_eq!(by_id.summary_text.as_deref(), Some("3 bugs"));
        assert_eq!(by_id.key_files, vec!["src/a.rs".to_string()]);

        let by_name = store.get_result_by_task_name("analyse", "p1").unwrap();
        assert!(by_name.is_some());
        assert!(store
            .get_result_by_task_name("analyse", "other")
            .unwrap()
            .is_none());
    }

    #[test]
    fn migrations_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
            store.append_task_log(&make_log("t1", "p1")).unwrap();
        }
        // Reopen: migrations re-run without damage, data intact.
        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert!(store.get_task("t1").unwrap().is_some());
    }

    #[test]
    fn migrates_from_version_one_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            // Simulate a version-1 database: base schema without the
            // migrated columns.
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER PRIMARY KEY);
                 INSERT INTO schema_version VALUES (1);
                 CREATE TABLE task_log (
                    task_id TEXT PRIMARY KEY, process_id TEXT NOT NULL,
                    created_at TEXT NOT NULL, finished_at TEXT,
                    branch TEXT NOT NULL, worktree TEXT NOT NULL,
                    main_repo TEXT NOT NULL, engine TEXT NOT NULL,
                    model TEXT, session_id TEXT, task_name TEXT,
                    step_index INTEGER, prompt TEXT, prompt_hash TEXT,
                    duration_ms INTEGER, success INTEGER, exit_code INTEGER,
                    error_message TEXT, parent_id TEXT
                 );
                 CREATE TABLE process_run (
                    process_id TEXT PRIMARY KEY, name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    spec_steps TEXT NOT NULL, live_steps TEXT NOT NULL,
                    current_index INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL DEFAULT 'running', abort_reason TEXT,
                    branch TEXT, worktree TEXT, main_repo TEXT,
                    created_at TEXT NOT NULL, updated_at TEXT NOT NULL
                 );
                 INSERT INTO task_log (task_id, process_id, created_at, branch,
                    worktree, main_repo, engine)
                 VALUES ('old1', 'p1', '2024-01-01T00:00:00Z', 'b', '/w', '/m', 'claude');",
            )
            .unwrap();
        }

        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        // Old row readable through the migrated schema with the default flag.
        let log = store.get_task("old1").unwrap().unwrap();
        assert!(!log.is_orchestrator);
    }
}
