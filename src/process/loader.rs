//! Process definitions on disk.
//!
//! One TOML file per process under `.conductor/processes/`:
//!
//! ```toml
//! name = "feature-flow"
//! description = "Analyse, implement, review"
//!
//! [[steps]]
//! task = "analyse"
//! prompt = "Map out the affected modules."
//!
//! [[steps]]
//! task = "implement"
//! skip_orchestrator = true
//!
//! [orchestrator]
//! max_injections = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::process::ProcessSpec;

pub fn processes_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".conductor").join("processes")
}

/// Load a named process definition from `<project>/.conductor/processes/
/// <name>.toml`. A definition without an explicit `name` takes the file
/// stem.
pub fn load_process(project_dir: &Path, name: &str) -> Result<ProcessSpec> {
    let path = processes_dir(project_dir).join(format!("{}.toml", name));
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read process definition {}", path.display()))?;
    let mut spec: ProcessSpec = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse process definition {}", path.display()))?;
    if spec.name.is_empty() {
        spec.name = name.to_string();
    }
    if spec.steps.is_empty() {
        bail!("Process '{}' defines no steps", spec.name);
    }
    Ok(spec)
}

/// Names of all process definitions in the project, sorted.
pub fn list_processes(project_dir: &Path) -> Result<Vec<String>> {
    let dir = processes_dir(project_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
