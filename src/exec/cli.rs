//! Engine CLI executor.
//!
//! Spawns the configured engine command, feeds it the assembled prompt on
//! stdin, and streams stdout line by line. Lines that parse as stream-JSON
//! events are inspected for the engine session id; everything else is
//! forwarded to the log at debug level.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::ExecError;

use super::{ExecOutcome, ExecRequest, Executor};

/// One stream-JSON event emitted by an engine CLI. Only the fields the
/// executor consumes are modeled; unknown event types pass through.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Executor that shells out to an engine CLI (e.g. `claude -p`).
pub struct CliExecutor {
    /// Command to invoke per engine name; first element is the binary.
    command: Vec<String>,
}

impl CliExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Default invocation for a named engine. Currently only the Claude CLI
    /// has a known headless invocation; other engines take the name as the
    /// binary with no extra flags.
    pub fn for_engine(engine: &str) -> Self {
        let command = match engine {
            "claude" => vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            other => vec![other.to_string()],
        };
        Self { command }
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError> {
        let start = Instant::now();

        let binary = self
            .command
            .first()
            .ok_or_else(|| ExecError::EngineUnavailable(req.engine.clone()))?;

        let mut cmd = Command::new(binary);
        cmd.args(&self.command[1..]);
        if let Some(model) = &req.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(worktree) = &req.worktree {
            cmd.current_dir(&worktree.path);
        }

        info!(
            task_id = %req.task_id,
            task = %req.task.name,
            engine = %req.engine,
            orchestrator = req.is_orchestrator,
            "Spawning engine process"
        );

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::SpawnFailed {
                command: binary.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(req.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let mut session_id: Option<String> = None;
        let mut errored_result = false;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamEvent>(&line) {
                    Ok(StreamEvent::System { session_id: sid }) => {
                        if let Some(sid) = sid {
                            session_id = Some(sid);
                        }
                    }
                    Ok(StreamEvent::Result {
                        session_id: sid,
                        is_error,
                    }) => {
                        if let Some(sid) = sid {
                            session_id = Some(sid);
                        }
                        if is_error {
                            errored_result = true;
                        }
                    }
                    Ok(StreamEvent::Other) => {}
                    Err(_) => debug!(task_id = %req.task_id, line = %line, "engine output"),
                }
            }
        }

        let status = child.wait().await?;
        let mut exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as i64;

        // Some engines exit zero even when the run itself failed; the
        // result event is authoritative.
        if exit_code == 0 && errored_result {
            warn!(
                task_id = %req.task_id,
                "Engine reported an error result; treating run as failed"
            );
            exit_code = 1;
        }

        if exit_code != 0 {
            warn!(
                task_id = %req.task_id,
                exit_code,
                "Engine process exited non-zero"
            );
        }

        Ok(ExecOutcome {
            exit_code,
            session_id,
            duration_ms,
        })
    }
}

/// Routes each request to the CLI invocation for its engine, so steps with
/// different `engine` overrides share one executor instance.
pub struct EngineCliExecutor;

#[async_trait]
impl Executor for EngineCliExecutor {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError> {
        CliExecutor::for_engine(&req.engine).run(req).await
    }
}
