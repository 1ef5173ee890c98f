//! The driving loop of one process run.
//!
//! Sequences worker steps and supervisor checkpoints over the live step
//! queue. The loop is the sole writer of the queue; a supervisor injection
//! is applied here, after the deciding agent has exited, never by the agent
//! itself. Worker failures abort the run; supervisor failures never do.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{ConductorConfig, OrchestratorConfig};
use crate::errors::ProcessError;
use crate::exec::{ExecRequest, Executor, TaskRegistry};
use crate::history::{StoreHandle, TaskCompletion, TaskLog};
use crate::process::guard::InjectionGuard;
use crate::process::supervisor::{Supervisor, Verdict};
use crate::process::{Phase, ProcessRun, ProcessStep, RunState, StepResult};
use crate::util::{now_iso, prompt_hash, short_id};

pub struct ProcessRunStateMachine {
    run: ProcessRun,
    orchestrator: OrchestratorConfig,
    default_engine: String,
    default_model: Option<String>,
    store: StoreHandle,
    registry: Arc<dyn TaskRegistry>,
    executor: Arc<dyn Executor>,
    supervisor: Supervisor,
    guard: InjectionGuard,
    /// Most recent task id in this run, for parent chaining.
    last_task_id: Option<String>,
}

impl ProcessRunStateMachine {
    pub fn new(
        run: ProcessRun,
        config: &ConductorConfig,
        store: StoreHandle,
        registry: Arc<dyn TaskRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let orchestrator = config
            .orchestrator
            .overlaid(run.spec.orchestrator.as_ref());
        let supervisor = Supervisor::new(
            orchestrator.clone(),
            store.clone(),
            registry.clone(),
            executor.clone(),
        );
        Self {
            run,
            orchestrator,
            default_engine: config.defaults.engine.clone(),
            default_model: config.defaults.model.clone(),
            store,
            registry,
            executor,
            supervisor,
            guard: InjectionGuard::new(),
            last_task_id: None,
        }
    }

    /// Drive the run to a terminal state. Returns the final run; an aborted
    /// run is a normal return with `RunState::Aborted`, not an `Err`. Errors
    /// are reserved for infrastructure failures (the store itself).
    pub async fn run(mut self) -> Result<ProcessRun, ProcessError> {
        if self.run.is_finished() {
            return Ok(self.run);
        }

        self.persist().await?;

        'steps: while self.run.current_index < self.run.steps.len() {
            let index = self.run.current_index;
            let step = self.run.steps[index].clone();
            let supervised = self.orchestrator.enabled && !step.skip_orchestrator;

            if supervised {
                self.persist().await?;
                let verdict = self
                    .supervisor
                    .review(&self.run, Phase::PreStep, index, self.last_task_id.as_deref())
                    .await?;
                match verdict {
                    Verdict::Proceed => {}
                    Verdict::Abort { reason } => {
                        self.abort(reason).await?;
                        return Ok(self.run);
                    }
                    Verdict::Inject { steps, origin } => {
                        if self.guard.admit(origin, self.orchestrator.max_injections) {
                            info!(
                                process_id = %self.run.process_id,
                                origin_step_index = origin,
                                count = steps.len(),
                                "Applying injected steps"
                            );
                            self.run.inject_steps(&steps, origin);
                            self.persist().await?;
                            // The injected step is now current; re-run the
                            // pre checkpoint without advancing.
                            continue 'steps;
                        }
                        // Guard exceeded: forced proceed, no insertion.
                    }
                }
            }

            if !self.execute_step(index, &step).await? {
                return Ok(self.run);
            }

            if supervised {
                self.persist().await?;
                // Review artifact only; the verdict never steers the loop.
                let _ = self
                    .supervisor
                    .review(
                        &self.run,
                        Phase::PostStep,
                        index,
                        self.last_task_id.as_deref(),
                    )
                    .await?;
            }
        }

        if self.orchestrator.enabled {
            self.persist().await?;
            let verdict = self
                .supervisor
                .review(
                    &self.run,
                    Phase::Finalize,
                    self.run.current_index,
                    self.last_task_id.as_deref(),
                )
                .await?;
            if verdict != Verdict::Proceed {
                // All steps already succeeded; finalize cannot roll that back.
                warn!(
                    process_id = %self.run.process_id,
                    "Finalize checkpoint returned a non-proceed verdict; ignoring"
                );
            }
        }

        self.run.state = RunState::Completed;
        self.persist().await?;
        info!(
            process_id = %self.run.process_id,
            steps = self.run.results.len(),
            "Process completed"
        );
        Ok(self.run)
    }

    /// Execute one worker step. Returns `Ok(false)` when the step failed
    /// and the run was aborted.
    async fn execute_step(
        &mut self,
        index: usize,
        step: &ProcessStep,
    ) -> Result<bool, ProcessError> {
        let Some(task) = self.registry.get_by_name(&step.task) else {
            let err = ProcessError::UnknownTask {
                name: step.task.clone(),
                step_index: index,
            };
            error!(process_id = %self.run.process_id, "{}", err);
            self.abort(err.to_string()).await?;
            return Ok(false);
        };

        let engine = step
            .engine
            .clone()
            .unwrap_or_else(|| self.default_engine.clone());
        let model = step
            .model
            .clone()
            .or_else(|| task.model.clone())
            .or_else(|| self.default_model.clone());
        let prompt = self
            .worker_prompt(index, step, task.prompt.as_deref())
            .await?;
        let task_id = format!("task_{}", short_id());

        let log = TaskLog {
            task_id: task_id.clone(),
            process_id: self.run.process_id.clone(),
            created_at: now_iso(),
            finished_at: None,
            branch: self
                .run
                .worktree
                .as_ref()
                .map(|w| w.branch.clone())
                .unwrap_or_default(),
            worktree: self
                .run
                .worktree
                .as_ref()
                .map(|w| w.path.display().to_string())
                .unwrap_or_default(),
            main_repo: self
                .run
                .worktree
                .as_ref()
                .map(|w| w.main_repo.display().to_string())
                .unwrap_or_default(),
            engine: engine.clone(),
            model: model.clone(),
            session_id: None,
            task_name: Some(step.task.clone()),
            step_index: Some(index),
            prompt: Some(prompt.clone()),
            prompt_hash: Some(prompt_hash(&prompt)),
            duration_ms: None,
            success: None,
            exit_code: None,
            error_message: None,
            parent_id: self.last_task_id.clone(),
            is_orchestrator: false,
        };
        {
            let log = log.clone();
            self.store
                .call(move |store| store.append_task_log(&log))
                .await?;
        }

        info!(
            process_id = %self.run.process_id,
            step_index = index,
            task = %step.task,
            task_id = %task_id,
            "Executing step"
        );

        let outcome = self
            .executor
            .run(ExecRequest {
                task_id: task_id.clone(),
                process_id: self.run.process_id.clone(),
                task,
                engine,
                model,
                image: None,
                worktree: self.run.worktree.clone(),
                prompt,
                is_orchestrator: false,
            })
            .await;

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
            let completion = completion.clone();
            self.store
                .call(move |store| store.complete_task_log(&task_id, &completion))
                .await?;
        }

        self.last_task_id = Some(task_id.clone());

        match outcome {
            Ok(o) if o.success() => {
                self.run.results.push(StepResult {
                    step_index: index,
                    task_name: step.task.clone(),
                    task_id,
                    success: true,
                    exit_code: o.exit_code,
                    duration_ms: o.duration_ms,
                });
                self.run.current_index += 1;
                self.persist().await?;
                Ok(true)
            }
            Ok(o) => {
                self.run.results.push(StepResult {
                    step_index: index,
                    task_name: step.task.clone(),
                    task_id,
                    success: false,
                    exit_code: o.exit_code,
                    duration_ms: o.duration_ms,
                });
                let reason = ProcessError::StepFailed {
                    step_index: index,
                    task_name: step.task.clone(),
                    exit_code: o.exit_code,
                }
                .to_string();
                error!(process_id = %self.run.process_id, "{}", reason);
                self.abort(reason).await?;
                Ok(false)
            }
            Err(e) => {
                let reason = format!(
                    "Step {} ({}) could not execute: {}",
                    index, step.task, e
                );
                error!(process_id = %self.run.process_id, "{}", reason);
                self.abort(reason).await?;
                Ok(false)
            }
        }
    }

    async fn abort(&mut self, reason: String) -> Result<(), ProcessError> {
        warn!(process_id = %self.run.process_id, reason = %reason, "Aborting run");
        self.run.state = RunState::Aborted;
        self.run.abort_reason = Some(reason);
        self.persist().await
    }

    /// Persist the run snapshot. Done before every supervisor invocation
    /// and after every mutation, so agents observe the loop only through
    /// the store.
    async fn persist(&self) -> Result<(), ProcessError> {
        let run = self.run.clone();
        self.store
            .call(move |store| store.upsert_run(&run))
            .await?;
        Ok(())
    }

    /// Orientation context for a worker step: the full step listing with
    /// completed/current/pending markers, summaries of completed steps, and
    /// how to pass results forward. Prepended to the task and step prompts.
    async fn worker_prompt(
        &self,
        index: usize,
        step: &ProcessStep,
        task_prompt: Option<&str>,
    ) -> Result<String, ProcessError> {
        let mut lines = vec![
            "You are running as part of a multi-step process.".to_string(),
            "Shared result tools are available:".to_string(),
            "- Use `read_result_summary` to load context from previous steps".to_string(),
            "- Use `write_result` before finishing to pass your findings to the next step"
                .to_string(),
            String::new(),
            format!("## Process: {} ({})", self.run.spec.name, self.run.process_id),
        ];
        if !self.run.spec.description.is_empty() {
            lines.push(self.run.spec.description.clone());
        }
        lines.push(String::new());
        lines.push("## Steps:".to_string());
        for (i, s) in self.run.steps.iter().enumerate() {
            let status = if i < index {
                "[COMPLETED]"
            } else if i == index {
                "[CURRENT (you are here)]"
            } else {
                "[PENDING]"
            };
            lines.push(format!("  {}. {} {}", i + 1, s.task, status));
        }

        let mut summaries = Vec::new();
        for result in self.run.results.iter().filter(|r| r.success) {
            let task_id = result.task_id.clone();
            let stored = self
                .store
                .call(move |store| store.get_result_by_task_id(&task_id))
                .await?;
            if let Some(summary) = stored.and_then(|r| r.summary_text) {
                let trimmed: String = summary.chars().take(500).collect();
                summaries.push((result.task_name.clone(), result.step_index, trimmed));
            }
        }
        if !summaries.is_empty() {
            lines.push(String::new());
            lines.push("## Completed step summaries:".to_string());
            for (name, step_index, summary) in summaries {
                lines.push(String::new());
                lines.push(format!("### {} (step {}):", name, step_index + 1));
                lines.push(summary);
            }
        }

        lines.push(String::new());
        lines.push(format!("Current step: {}", step.task));

        let mut sections = vec![lines.join("\n")];
        if let Some(p) = task_prompt {
            sections.push(p.to_string());
        }
        if let Some(p) = step.prompt.as_deref() {
            sections.push(p.to_string());
        }
        Ok(sections.join("\n\n"))
    }
}
