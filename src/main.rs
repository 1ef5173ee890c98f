use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use conductor::config::ConductorConfig;
use conductor::exec::cli::EngineCliExecutor;
use conductor::exec::registry::FsTaskRegistry;
use conductor::exec::WorktreeRef;
use conductor::history::{HistoryStore, StoreHandle};
use conductor::process::loader;
use conductor::process::machine::ProcessRunStateMachine;
use conductor::process::resume::{KeyKind, ResumptionResolver};
use conductor::process::{ProcessRun, ProcessSpec, ProcessStep, RunState};
use conductor::util::short_id;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Supervised multi-step AI coding pipelines")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// History database path
    #[arg(long, default_value = ".conductor/history.db", global = true)]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process definition from .conductor/processes/
    Run {
        process: String,
    },
    /// Resume an interrupted run
    Resume {
        key: String,

        /// Key kind: task_id, branch, or session_id
        #[arg(long, default_value = "task_id")]
        by: String,
    },
    /// Start a follow-up run linked to a previous task
    Continue {
        parent_task_id: String,

        /// Task to run in the continuation
        task: String,

        #[arg(long)]
        prompt: Option<String>,
    },
    /// Show the live state of a run
    Status {
        process_id: String,
    },
    /// Show the decision history of a run
    History {
        process_id: String,
    },
    /// List available processes and tasks
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "conductor=debug" } else { "conductor=info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    let db_path = if cli.db_path.is_absolute() {
        cli.db_path
    } else {
        project_dir.join(&cli.db_path)
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = StoreHandle::new(HistoryStore::open(&db_path)?);

    match cli.command {
        Commands::Run { process } => {
            let spec = loader::load_process(&project_dir, &process)?;
            let run = ProcessRun::new(format!("proc_{}", short_id()), spec);
            drive(run, &project_dir, store).await
        }
        Commands::Resume { key, by } => {
            let kind = KeyKind::from_str(&by).map_err(anyhow::Error::msg)?;
            let resolver = ResumptionResolver::new(store.clone());
            let run = resolver.resolve(&key, kind).await?;
            drive(run, &project_dir, store).await
        }
        Commands::Continue {
            parent_task_id,
            task,
            prompt,
        } => {
            let spec = ProcessSpec {
                name: format!("continue-{}", task),
                description: String::new(),
                steps: vec![ProcessStep {
                    task,
                    engine: None,
                    model: None,
                    prompt,
                    skip_orchestrator: false,
                    origin_step_index: None,
                }],
                orchestrator: None,
            };
            let resolver = ResumptionResolver::new(store.clone());
            let run = resolver.continue_from(&parent_task_id, spec).await?;
            drive(run, &project_dir, store).await
        }
        Commands::Status { process_id } => {
            let state = store
                .call(move |s| s.read_process_state(&process_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { process_id } => {
            let decisions = store
                .call(move |s| s.decisions_for_process(&process_id))
                .await?;
            for d in decisions {
                println!(
                    "{}  {:>9}  step {}  {}  {}",
                    d.created_at,
                    d.phase.as_str(),
                    d.step_index,
                    d.decision.as_str(),
                    d.reasoning
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            println!("Processes:");
            for name in loader::list_processes(&project_dir)? {
                println!("  {}", name);
            }
            let registry = FsTaskRegistry::load(&FsTaskRegistry::default_dir(&project_dir))?;
            let mut names = registry.task_names();
            names.sort_unstable();
            println!("Tasks:");
            for name in names {
                println!("  {}", name);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn drive(
    mut run: ProcessRun,
    project_dir: &Path,
    store: StoreHandle,
) -> Result<ExitCode> {
    let config = ConductorConfig::load(project_dir)?;
    let registry = Arc::new(FsTaskRegistry::load(&FsTaskRegistry::default_dir(
        project_dir,
    ))?);

    if run.worktree.is_none() {
        run.worktree = detect_worktree(project_dir);
    }

    let machine = ProcessRunStateMachine::new(
        run,
        &config,
        store,
        registry,
        Arc::new(EngineCliExecutor),
    );
    let finished = machine.run().await?;

    match finished.state {
        RunState::Completed => {
            println!(
                "Process {} completed ({} steps)",
                finished.process_id,
                finished.results.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        RunState::Aborted => {
            eprintln!(
                "Process {} aborted: {}",
                finished.process_id,
                finished.abort_reason.as_deref().unwrap_or("unknown reason")
            );
            Ok(ExitCode::FAILURE)
        }
        RunState::Running => {
            eprintln!("Process {} stopped without a terminal state", finished.process_id);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Treat the project directory itself as the run's worktree when it is a
/// git checkout. Dedicated per-run worktrees are an external concern.
fn detect_worktree(project_dir: &Path) -> Option<WorktreeRef> {
    let repo = match git2::Repository::open(project_dir) {
        Ok(repo) => repo,
        Err(e) => {
            warn!(error = %e, "Project directory is not a git repository; running without worktree");
            return None;
        }
    };
    let branch = repo
        .head()
        .ok()
        .and_then(|h| h.shorthand().map(str::to_string))
        .unwrap_or_else(|| "detached".to_string());
    Some(WorktreeRef {
        path: project_dir.to_path_buf(),
        branch,
        main_repo: project_dir.to_path_buf(),
    })
}
