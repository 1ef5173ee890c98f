//! Filesystem task registry.
//!
//! Tasks live under `.conductor/tasks/<name>/` with a `task.toml` definition
//! and an optional `prompt.md` whose contents become the task prompt.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use super::{TaskDefinition, TaskRegistry};

#[derive(Debug, Deserialize)]
struct TaskToml {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    model: Option<String>,
}

/// Registry backed by a tasks directory. Definitions are loaded once at
/// construction; the set of tasks does not change during a run.
pub struct FsTaskRegistry {
    tasks: HashMap<String, TaskDefinition>,
}

impl FsTaskRegistry {
    /// Load all task definitions under `tasks_dir`. Directories without a
    /// `task.toml` are skipped with a warning; a missing tasks dir yields an
    /// empty registry.
    pub fn load(tasks_dir: &Path) -> Result<Self> {
        let mut tasks = HashMap::new();
        if !tasks_dir.is_dir() {
            return Ok(Self { tasks });
        }

        for entry in fs::read_dir(tasks_dir).context("Failed to read tasks directory")? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let dir_name = entry.file_name().to_string_lossy().to_string();
            match Self::load_one(&dir, &dir_name) {
                Ok(def) => {
                    tasks.insert(def.name.clone(), def);
                }
                Err(e) => {
                    warn!(task = %dir_name, error = %e, "Skipping unreadable task definition");
                }
            }
        }

        Ok(Self { tasks })
    }

    fn load_one(dir: &Path, dir_name: &str) -> Result<TaskDefinition> {
        let toml_path = dir.join("task.toml");
        let raw = fs::read_to_string(&toml_path)
            .with_context(|| format!("Failed to read {}", toml_path.display()))?;
        let parsed: TaskToml = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", toml_path.display()))?;

        let prompt = match fs::read_to_string(dir.join("prompt.md")) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        };

        Ok(TaskDefinition {
            name: parsed.name.unwrap_or_else(|| dir_name.to_string()),
            description: parsed.description,
            model: parsed.model,
            prompt,
        })
    }

    /// Conventional location: `<project>/.conductor/tasks`.
    pub fn default_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(".conductor").join("tasks")
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }
}

impl TaskRegistry for FsTaskRegistry {
    fn get_by_name(&self, name: &str) -> Option<TaskDefinition> {
        self.tasks.get(name).cloned()
    }
}
