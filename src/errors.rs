//! Typed error hierarchy for the Conductor orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `ProcessError` — state machine and supervisor failures
//! - `HistoryError` — persistence failures and rejected records
//! - `ToolError` — tool-call protocol failures, including scope violations
//! - `ExecError` — external executor failures

use thiserror::Error;

/// Errors from the process state machine and supervisor.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Unknown task '{name}' at step {step_index}")]
    UnknownTask { name: String, step_index: usize },

    #[error("Step {step_index} ({task_name}) failed with exit code {exit_code}")]
    StepFailed {
        step_index: usize,
        task_name: String,
        exit_code: i32,
    },

    #[error("Process {process_id} is not resumable: {reason}")]
    NotResumable { process_id: String, reason: String },

    #[error("No persisted run found for {kind} '{key}'")]
    RunNotFound { kind: String, key: String },

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid decision record: {0}")]
    InvalidDecision(String),

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Process {process_id} not found")]
    ProcessNotFound { process_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced to tool-call protocol callers.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{tool}' is only available to orchestrator tasks")]
    ScopeViolation { tool: String },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Missing caller identity (no task id on the request)")]
    MissingIdentity,

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown task '{0}' (not present in the task registry)")]
    UnknownTaskName(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the external executor boundary.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn engine process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine '{0}' is not available")]
    EngineUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failed_carries_context() {
        let err = ProcessError::StepFailed {
            step_index: 2,
            task_name: "implement".into(),
            exit_code: 1,
        };
        assert!(err.to_string().contains("implement"));
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn scope_violation_names_the_tool() {
        let err = ToolError::ScopeViolation {
            tool: "record_decision".into(),
        };
        assert!(err.to_string().contains("record_decision"));
        assert!(err.to_string().contains("orchestrator"));
    }

    #[test]
    fn process_error_converts_from_history_error() {
        let inner = HistoryError::InvalidDecision("bad shape".into());
        let err: ProcessError = inner.into();
        match &err {
            ProcessError::History(HistoryError::InvalidDecision(msg)) => {
                assert_eq!(msg, "bad shape");
            }
            _ => panic!("Expected ProcessError::History(InvalidDecision)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ProcessError::RunNotFound {
            kind: "branch".into(),
            key: "x".into(),
        });
        assert_std_error(&HistoryError::LockPoisoned);
        assert_std_error(&ToolError::MissingIdentity);
        assert_std_error(&ExecError::EngineUnavailable("claude".into()));
    }
}
