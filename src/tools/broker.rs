//! Tool dispatch for one process.
//!
//! Every call passes through the scope gate first, then a typed argument
//! parse, then the store. The sandboxed agent never touches the driving
//! loop's memory: an injection request only records a decision that the
//! loop reads back after the agent's own run exits.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{HistoryError, ToolError};
use crate::exec::TaskRegistry;
use crate::history::StoreHandle;
use crate::process::{DecisionKind, InjectedStep, OrchestratorDecision, Phase};
use crate::repo::RepoInspector;
use crate::util::now_iso;

use super::gate::ToolScopeGate;
use super::ToolSpec;

#[derive(Debug, Deserialize)]
struct RecordDecisionArgs {
    phase: String,
    step_index: usize,
    decision: String,
    reasoning: String,
    #[serde(default)]
    injected_steps: Vec<InjectedStep>,
}

#[derive(Debug, Deserialize)]
struct InjectStepsArgs {
    steps: Vec<InjectedStep>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoChangesArgs {
    since: String,
}

#[derive(Debug, Deserialize)]
struct WriteResultArgs {
    result: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    key_files: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoadResultArgs {
    #[serde(default)]
    task_name: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

/// In-process tool-call dispatch, scoped to one process.
#[derive(Clone)]
pub struct ToolBroker {
    process_id: String,
    store: StoreHandle,
    registry: Arc<dyn TaskRegistry>,
    gate: ToolScopeGate,
}

impl ToolBroker {
    pub fn new(
        process_id: impl Into<String>,
        store: StoreHandle,
        registry: Arc<dyn TaskRegistry>,
    ) -> Self {
        let gate = ToolScopeGate::new(store.clone());
        Self {
            process_id: process_id.into(),
            store,
            registry,
            gate,
        }
    }

    pub fn gate(&self) -> &ToolScopeGate {
        &self.gate
    }

    /// Filtered tool listing for the caller identity.
    pub async fn list_tools(&self, caller: Option<&str>) -> Vec<ToolSpec> {
        self.gate.list_tools(caller).await
    }

    /// Dispatch one tool call. The gate authorizes before any argument is
    /// even parsed; scope violations never reach a handler.
    pub async fn call(
        &self,
        caller: Option<&str>,
        tool: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        self.gate.authorize(caller, tool).await?;
        match tool {
            "get_process_state" => self.get_process_state().await,
            "record_decision" => self.record_decision(caller, args).await,
            "inject_steps" => self.inject_steps(caller, args).await,
            "get_repo_changes" => self.get_repo_changes(args).await,
            "write_result" => self.write_result(caller, args).await,
            "load_result" => self.load_result(args, false).await,
            "read_result_summary" => self.load_result(args, true).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    async fn get_process_state(&self) -> Result<Value, ToolError> {
        let process_id = self.process_id.clone();
        let state = self
            .store
            .call(move |store| store.read_process_state(&process_id))
            .await?;
        Ok(serde_json::to_value(state).map_err(|e| ToolError::Other(e.into()))?)
    }

    async fn record_decision(
        &self,
        caller: Option<&str>,
        args: Value,
    ) -> Result<Value, ToolError> {
        let caller = caller.ok_or(ToolError::MissingIdentity)?.to_string();
        let args: RecordDecisionArgs = parse_args(args)?;

        let phase =
            Phase::from_str(&args.phase).map_err(ToolError::InvalidArguments)?;
        let decision =
            DecisionKind::from_str(&args.decision).map_err(ToolError::InvalidArguments)?;

        // Injected task names must resolve before anything is written.
        for step in &args.injected_steps {
            if self.registry.get_by_name(&step.task).is_none() {
                return Err(ToolError::UnknownTaskName(step.task.clone()));
            }
        }

        let record = OrchestratorDecision {
            phase,
            step_index: args.step_index,
            decision,
            reasoning: args.reasoning,
            injected_steps: args.injected_steps,
            task_id: caller,
            created_at: now_iso(),
        };
        record
            .validate()
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let process_id = self.process_id.clone();
        self.store
            .call(move |store| store.append_decision(&process_id, &record))
            .await?;

        info!(
            process_id = %self.process_id,
            phase = %phase.as_str(),
            decision = %decision.as_str(),
            "Supervisor decision recorded"
        );
        Ok(json!({ "status": "ok" }))
    }

    /// Convenience for the supervisor: records an `inject` decision at the
    /// process's current checkpoint. The driving loop applies it after the
    /// supervisor's run exits.
    async fn inject_steps(&self, caller: Option<&str>, args: Value) -> Result<Value, ToolError> {
        let caller = caller.ok_or(ToolError::MissingIdentity)?.to_string();
        let args: InjectStepsArgs = parse_args(args)?;
        if args.steps.is_empty() {
            return Err(ToolError::InvalidArguments(
                "steps must be a non-empty list".into(),
            ));
        }
        for step in &args.steps {
            if self.registry.get_by_name(&step.task).is_none() {
                return Err(ToolError::UnknownTaskName(step.task.clone()));
            }
        }

        let process_id = self.process_id.clone();
        let current_index = self
            .store
            .call(move |store| {
                store
                    .get_run(&process_id)?
                    .map(|row| row.current_index)
                    .ok_or(HistoryError::ProcessNotFound { process_id })
            })
            .await?;

        let names: Vec<String> = args.steps.iter().map(|s| s.task.clone()).collect();
        let record = OrchestratorDecision {
            phase: Phase::PreStep,
            step_index: current_index,
            decision: DecisionKind::Inject,
            reasoning: args
                .reasoning
                .unwrap_or_else(|| "Injection requested via inject_steps".into()),
            injected_steps: args.steps,
            task_id: caller,
            created_at: now_iso(),
        };

        let process_id = self.process_id.clone();
        self.store
            .call(move |store| store.append_decision(&process_id, &record))
            .await?;

        info!(
            process_id = %self.process_id,
            count = names.len(),
            "Injection request recorded"
        );
        Ok(json!({
            "status": "ok",
            "injected_count": names.len(),
            "steps": names,
        }))
    }

    async fn get_repo_changes(&self, args: Value) -> Result<Value, ToolError> {
        let args: RepoChangesArgs = parse_args(args)?;
        let process_id = self.process_id.clone();
        let worktree = self
            .store
            .call(move |store| {
                store
                    .get_run(&process_id)?
                    .and_then(|row| row.worktree)
                    .ok_or_else(|| {
                        HistoryError::Other(anyhow::anyhow!("Process has no worktree attached"))
                    })
            })
            .await?;

        let since = args.since;
        let report = tokio::task::spawn_blocking(move || {
            let inspector = RepoInspector::open(std::path::Path::new(&worktree))?;
            let summary = inspector.changes_since(&since)?;
            let commits = inspector.commits_since(&since)?;
            Ok::<_, anyhow::Error>(json!({
                "summary": summary,
                "commits": commits,
            }))
        })
        .await
        .map_err(|e| ToolError::Other(anyhow::anyhow!("Repo inspection panicked: {}", e)))?
        .map_err(ToolError::Other)?;

        Ok(report)
    }

    async fn write_result(&self, caller: Option<&str>, args: Value) -> Result<Value, ToolError> {
        let caller = caller.ok_or(ToolError::MissingIdentity)?.to_string();
        let args: WriteResultArgs = parse_args(args)?;

        let task_id = caller.clone();
        self.store
            .call(move |store| {
                // FK requires a registered task; surfaces as a clear error
                // instead of a constraint failure.
                if store.get_task(&task_id)?.is_none() {
                    return Err(HistoryError::TaskNotFound { task_id });
                }
                store.create_result(&task_id, &args.result, &args.key_files, &args.tags)?;
                if let Some(summary) = &args.summary {
                    store.update_summary(&task_id, summary)?;
                }
                Ok(())
            })
            .await?;

        Ok(json!({ "status": "ok", "task_id": caller }))
    }

    async fn load_result(&self, args: Value, summary_only: bool) -> Result<Value, ToolError> {
        let args: LoadResultArgs = parse_args(args)?;
        if args.task_name.is_none() && args.task_id.is_none() {
            return Err(ToolError::InvalidArguments(
                "at least one of task_name or task_id must be provided".into(),
            ));
        }

        let process_id = self.process_id.clone();
        let lookup = args
            .task_id
            .clone()
            .or_else(|| args.task_name.clone())
            .unwrap_or_default();
        let result = self
            .store
            .call(move |store| {
                if let Some(task_id) = args.task_id {
                    store.get_result_by_task_id(&task_id)
                } else if let Some(task_name) = args.task_name {
                    store.get_result_by_task_name(&task_name, &process_id)
                } else {
                    Ok(None)
                }
            })
            .await?;

        let Some(result) = result else {
            return Err(ToolError::InvalidArguments(format!(
                "no result found for task '{}' in the current process",
                lookup
            )));
        };

        if summary_only {
            let Some(summary) = result.summary_text else {
                return Err(ToolError::InvalidArguments(format!(
                    "no summary available for task '{}'; use load_result for the raw output",
                    lookup
                )));
            };
            Ok(json!({
                "summary_text": summary,
                "key_files": result.key_files,
                "created_at": result.created_at,
            }))
        } else {
            Ok(json!({
                "result_text": result.result_text,
                "key_files": result.key_files,
                "tags": result.tags,
                "created_at": result.created_at,
            }))
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::TaskDefinition;
    use crate::history::{HistoryStore, TaskLog};
    use crate::process::{ProcessRun, ProcessSpec, ProcessStep};

    struct FixedRegistry(Vec<&'static str>);

    impl TaskRegistry for FixedRegistry {
        fn get_by_name(&self, name: &str) -> Option<TaskDefinition> {
            self.0
                .contains(&name)
                .then(|| TaskDefinition::new(name))
        }
    }

    fn task_log(task_id: &str, orch: bool) -> TaskLog {
        TaskLog {
            task_id: task_id.into(),
            process_id: "p1".into(),
            created_at: now_iso(),
            finished_at: None,
            branch: "b".into(),
            worktree: "/w".into(),
            main_repo: "/m".into(),
            engine: "claude".into(),
            model: None,
            session_id: None,
            task_name: None,
            step_index: None,
            prompt: None,
            prompt_hash: None,
            duration_ms: None,
            success: None,
            exit_code: None,
            error_message: None,
            parent_id: None,
            is_orchestrator: orch,
        }
    }

    fn broker_with_run() -> ToolBroker {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append_task_log(&task_log("orch01", true)).unwrap();
        store.append_task_log(&task_log("work01", false)).unwrap();
        let run = ProcessRun::new(
            "p1",
            ProcessSpec {
                name: "test".into(),
                description: String::new(),
                steps: vec![ProcessStep::new("analyse"), ProcessStep::new("implement")],
                orchestrator: None,
            },
        );
        store.upsert_run(&run).unwrap();
        ToolBroker::new(
            "p1",
            StoreHandle::new(store),
            Arc::new(FixedRegistry(vec!["analyse", "implement", "hotfix"])),
        )
    }

    #[tokio::test]
    async fn worker_cannot_call_exclusive_tools() {
        let broker = broker_with_run();
        let err = broker
            .call(Some("work01"), "get_process_state", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ScopeViolation { .. }));
    }

    #[tokio::test]
    async fn state_query_returns_live_steps() {
        let broker = broker_with_run();
        let state = broker
            .call(Some("orch01"), "get_process_state", json!({}))
            .await
            .unwrap();
        assert_eq!(state["process_id"], "p1");
        assert_eq!(state["steps"].as_array().unwrap().len(), 2);
        assert_eq!(state["current_index"], 0);
    }

    #[tokio::test]
    async fn record_decision_persists_valid_payload() {
        let broker = broker_with_run();
        broker
            .call(
                Some("orch01"),
                "record_decision",
                json!({
                    "phase": "pre_step",
                    "step_index": 0,
                    "decision": "proceed",
                    "reasoning": "plan looks fine",
                }),
            )
            .await
            .unwrap();

        let store = broker.store.lock_sync().unwrap();
        let decisions = store.decisions_for_process("p1").unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].task_id, "orch01");
    }

    #[tokio::test]
    async fn record_decision_rejects_malformed_shape() {
        let broker = broker_with_run();
        // proceed with injected steps
        let err = broker
            .call(
                Some("orch01"),
                "record_decision",
                json!({
                    "phase": "pre_step",
                    "step_index": 0,
                    "decision": "proceed",
                    "reasoning": "x",
                    "injected_steps": [{"task": "hotfix"}],
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        // nothing was written
        let store = broker.store.lock_sync().unwrap();
        assert!(store.decisions_for_process("p1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_decision_rejects_unknown_phase() {
        let broker = broker_with_run();
        let err = broker
            .call(
                Some("orch01"),
                "record_decision",
                json!({
                    "phase": "mid_step",
                    "step_index": 0,
                    "decision": "proceed",
                    "reasoning": "x",
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn inject_steps_records_decision_at_current_index() {
        let broker = broker_with_run();
        let out = broker
            .call(
                Some("orch01"),
                "inject_steps",
                json!({
                    "steps": [
                        {"task": "hotfix", "prompt": "fix the bug"},
                        {"task": "hotfix"},
                    ],
                }),
            )
            .await
            .unwrap();
        assert_eq!(out["injected_count"], 2);

        let store = broker.store.lock_sync().unwrap();
        let decisions = store.decisions_for_process("p1").unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision, DecisionKind::Inject);
        assert_eq!(decisions[0].step_index, 0);
        assert_eq!(decisions[0].injected_steps.len(), 2);
    }

    #[tokio::test]
    async fn inject_steps_rejects_unknown_task_name() {
        let broker = broker_with_run();
        let err = broker
            .call(
                Some("orch01"),
                "inject_steps",
                json!({ "steps": [{"task": "nonexistent"}] }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTaskName(_)));
    }

    #[tokio::test]
    async fn inject_steps_rejects_empty_list() {
        let broker = broker_with_run();
        let err = broker
            .call(Some("orch01"), "inject_steps", json!({ "steps": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn write_and_load_result_roundtrip() {
        let broker = broker_with_run();
        broker
            .call(
                Some("work01"),
                "write_result",
                json!({
                    "result": "refactored the parser",
                    "key_files": ["src/parser.rs"],
                    "tags": ["refactor"],
                }),
            )
            .await
            .unwrap();

        let loaded = broker
            .call(Some("work01"), "load_result", json!({"task_id": "work01"}))
            .await
            .unwrap();
        assert_eq!(loaded["result_text"], "refactored the parser");
        assert_eq!(loaded["key_files"][0], "src/parser.rs");
    }

    #[tokio::test]
    async fn write_result_requires_registered_task() {
        let broker = broker_with_run();
        let err = broker
            .call(Some("ghost"), "write_result", json!({"result": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::History(_)));
    }

    #[tokio::test]
    async fn summary_is_readable_once_written() {
        let broker = broker_with_run();
        broker
            .call(
                Some("work01"),
                "write_result",
                json!({"result": "long form text", "summary": "short form"}),
            )
            .await
            .unwrap();
        let by_id = broker
            .call(
                Some("work01"),
                "read_result_summary",
                json!({"task_id": "work01"}),
            )
            .await
            .unwrap();
        assert_eq!(by_id["summary_text"], "short form");
    }

    #[tokio::test]
    async fn read_result_summary_requires_summary() {
        let broker = broker_with_run();
        broker
            .call(Some("work01"), "write_result", json!({"result": "full text"}))
            .await
            .unwrap();
        let err = broker
            .call(
                Some("work01"),
                "read_result_summary",
                json!({"task_id": "work01"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn load_result_requires_a_lookup_key() {
        let broker = broker_with_run();
        let err = broker
            .call(Some("work01"), "load_result", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
