//! Layered configuration for conductor.
//!
//! Read from `.conductor/conductor.toml`. The `[orchestrator]` table sets
//! global supervisor defaults; a process definition may carry an overlay in
//! which only the fields it sets override the globals. Per-step
//! `skip_orchestrator` is checked independently of both layers.
//!
//! ```toml
//! [orchestrator]
//! enabled = true
//! engine = "claude"
//! model = "opus"
//! max_injections = 3
//!
//! [defaults]
//! engine = "claude"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_max_injections() -> u32 {
    3
}

fn default_engine() -> String {
    "claude".to_string()
}

/// Resolved supervisor settings for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Upper bound on accepted injections per origin step index.
    #[serde(default = "default_max_injections")]
    pub max_injections: u32,
    #[serde(default)]
    pub image: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: default_engine(),
            model: None,
            max_injections: default_max_injections(),
            image: None,
        }
    }
}

/// Process-level supervisor overlay. Every field is optional; only set
/// fields override the global configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorOverlay {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_injections: Option<u32>,
    #[serde(default)]
    pub image: Option<String>,
}

impl OrchestratorConfig {
    /// Apply a process-level overlay on top of these settings.
    pub fn overlaid(&self, overlay: Option<&SupervisorOverlay>) -> Self {
        let Some(o) = overlay else {
            return self.clone();
        };
        Self {
            enabled: o.enabled.unwrap_or(self.enabled),
            engine: o.engine.clone().unwrap_or_else(|| self.engine.clone()),
            model: o.model.clone().or_else(|| self.model.clone()),
            max_injections: o.max_injections.unwrap_or(self.max_injections),
            image: o.image.clone().or_else(|| self.image.clone()),
        }
    }
}

/// Worker-step defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            model: None,
        }
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl ConductorConfig {
    /// Load from `<project>/.conductor/conductor.toml`; a missing file
    /// yields the defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(".conductor").join("conductor.toml")
    }
}
