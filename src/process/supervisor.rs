//! Supervisor checkpoint invocation.
//!
//! At each checkpoint the supervisor runs as a fully sandboxed agent: it is
//! handed an orientation prompt, records any decision through the tool
//! protocol, and exits. The verdict is then read back from the store, keyed
//! by the invocation's own task id, so stale decisions from earlier
//! checkpoints can never be mistaken for fresh ones.
//!
//! Supervisor failures are recovered, never fatal. A phase task that cannot
//! be resolved, an engine that fails to run, or an agent that exits without
//! recording anything all collapse to the default verdict for the phase.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::errors::ProcessError;
use crate::exec::{ExecRequest, Executor, TaskRegistry};
use crate::history::{StoreHandle, TaskCompletion, TaskLog};
use crate::process::{DecisionKind, InjectedStep, Phase, ProcessRun};
use crate::util::{now_iso, prompt_hash, short_id};

/// What the driving loop should do after a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Proceed,
    Inject {
        steps: Vec<InjectedStep>,
        /// Step index that was current when the injection was decided.
        origin: usize,
    },
    Abort {
        reason: String,
    },
}

pub struct Supervisor {
    config: OrchestratorConfig,
    store: StoreHandle,
    registry: Arc<dyn TaskRegistry>,
    executor: Arc<dyn Executor>,
}

impl Supervisor {
    pub fn new(
        config: OrchestratorConfig,
        store: StoreHandle,
        registry: Arc<dyn TaskRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            executor,
        }
    }

    /// Run one checkpoint at `step_index`. The caller has already persisted
    /// the run snapshot, so the agent observes current state through its
    /// tools. For `post_step` the index is the step just executed, which is
    /// behind the already-advanced current index.
    pub async fn review(
        &self,
        run: &ProcessRun,
        phase: Phase,
        step_index: usize,
        parent_id: Option<&str>,
    ) -> Result<Verdict, ProcessError> {
        let Some(task) = self.registry.get_by_name(phase.task_name()) else {
            warn!(
                phase = %phase.as_str(),
                task = phase.task_name(),
                "Supervisor phase task not found; defaulting to proceed"
            );
            return Ok(Verdict::Proceed);
        };

        let prompt = self.orientation_prompt(run, phase, step_index, task.prompt.as_deref());
        let task_id = format!("orch_{}", short_id());

        let log = TaskLog {
            task_id: task_id.clone(),
            process_id: run.process_id.clone(),
            created_at: now_iso(),
            finished_at: None,
            branch: run
                .worktree
                .as_ref()
                .map(|w| w.branch.clone())
                .unwrap_or_default(),
            worktree: run
                .worktree
                .as_ref()
                .map(|w| w.path.display().to_string())
                .unwrap_or_default(),
            main_repo: run
                .worktree
                .as_ref()
                .map(|w| w.main_repo.display().to_string())
                .unwrap_or_default(),
            engine: self.config.engine.clone(),
            model: self.config.model.clone(),
            session_id: None,
            task_name: Some(phase.task_name().to_string()),
            step_index: None,
            prompt: Some(prompt.clone()),
            prompt_hash: Some(prompt_hash(&prompt)),
            duration_ms: None,
            success: None,
            exit_code: None,
            error_message: None,
            parent_id: parent_id.map(str::to_string),
            is_orchestrator: true,
        };
        {
            let log = log.clone();
            self.store
                .call(move |store| store.append_task_log(&log))
                .await?;
        }

        let request = ExecRequest {
            task_id: task_id.clone(),
            process_id: run.process_id.clone(),
            task,
            engine: self.config.engine.clone(),
            model: self.config.model.clone(),
            image: self.config.image.clone(),
            worktree: run.worktree.clone(),
            prompt,
            is_orchestrator: true,
        };

        info!(
            process_id = %run.process_id,
            phase = %phase.as_str(),
            step_index,
            task_id = %task_id,
            "Invoking supervisor checkpoint"
        );

        let outcome = self.executor.run(request).await;

        let completion = match &outcome {
            Ok(o) => TaskCompletion {
                finished_at: now_iso(),
                success: o.success(),
                exit_code: o.exit_code,
                duration_ms: o.duration_ms,
                error_message: None,
                session_id: o.session_id.clone(),
            },
            Err(e) => TaskCompletion {
                finished_at: now_iso(),
                success: false,
                exit_code: -1,
                duration_ms: 0,
                error_message: Some(e.to_string()),
                session_id: None,
            },
        };
        {
            let task_id = task_id.clone();
            self.store
                .call(move |store| store.complete_task_log(&task_id, &completion))
                .await?;
        }

        match outcome {
            Ok(o) if o.success() => {}
            Ok(o) => {
                warn!(
                    phase = %phase.as_str(),
                    exit_code = o.exit_code,
                    "Supervisor agent exited non-zero; defaulting to proceed"
                );
                return Ok(Verdict::Proceed);
            }
            Err(e) => {
                warn!(
                    phase = %phase.as_str(),
                    error = %e,
                    "Supervisor execution failed; defaulting to proceed"
                );
                return Ok(Verdict::Proceed);
            }
        }

        self.read_verdict(&run.process_id, phase, step_index, &task_id)
            .await
    }

    /// Read back the decision this invocation recorded, if any. Only a
    /// decision written under this exact task id, for this phase and step
    /// index, counts.
    async fn read_verdict(
        &self,
        process_id: &str,
        phase: Phase,
        step_index: usize,
        task_id: &str,
    ) -> Result<Verdict, ProcessError> {
        let process_id = process_id.to_string();
        let owned_task_id = task_id.to_string();
        let decision = self
            .store
            .call(move |store| store.latest_decision_by_task(&process_id, &owned_task_id))
            .await?;

        let Some(decision) = decision else {
            info!(
                phase = %phase.as_str(),
                "Supervisor recorded no decision; defaulting to proceed"
            );
            return Ok(Verdict::Proceed);
        };

        if decision.phase != phase || decision.step_index != step_index {
            warn!(
                recorded_phase = %decision.phase.as_str(),
                recorded_index = decision.step_index,
                expected_phase = %phase.as_str(),
                expected_index = step_index,
                "Supervisor decision does not match the current checkpoint; ignoring"
            );
            return Ok(Verdict::Proceed);
        }

        info!(
            phase = %phase.as_str(),
            decision = %decision.decision.as_str(),
            reasoning = %decision.reasoning,
            "Supervisor decision"
        );

        Ok(match decision.decision {
            DecisionKind::Proceed => Verdict::Proceed,
            DecisionKind::Inject => Verdict::Inject {
                steps: decision.injected_steps,
                origin: decision.step_index,
            },
            DecisionKind::Abort => Verdict::Abort {
                reason: decision.reasoning,
            },
        })
    }

    /// Orientation context handed to the agent. The agent queries the rest
    /// through its tools.
    fn orientation_prompt(
        &self,
        run: &ProcessRun,
        phase: Phase,
        step_index: usize,
        task_prompt: Option<&str>,
    ) -> String {
        let mut lines = vec![
            format!("Process: {} ({})", run.spec.name, run.process_id),
            format!(
                "Phase: {} for step {} of {}",
                phase.as_str(),
                step_index + 1,
                run.steps.len()
            ),
        ];
        if let Some(step) = run.steps.get(step_index) {
            let step_prompt = step.prompt.as_deref().unwrap_or("(task default)");
            lines.push(format!("Step: {} / {}", step.task, step_prompt));
        }
        let completed = run.results.iter().filter(|r| r.success).count();
        lines.push(format!(
            "Completed steps: {}/{}",
            completed,
            run.steps.len()
        ));
        if let Some(prompt) = task_prompt {
            lines.push(String::new());
            lines.push(prompt.to_string());
        }
        lines.join("\n")
    }
}
