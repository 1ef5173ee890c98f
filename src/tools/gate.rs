//! Capability boundary between worker and supervisor identities.
//!
//! Two independent layers, both keyed by the caller's task id:
//!
//! 1. **Listing** — a non-orchestrator identity is only shown tools marked
//!    `shared`; orchestrator-exclusive tools never appear in its listing.
//! 2. **Invocation** — every call re-resolves `is_orchestrator` from the
//!    identity record in the store. A previously returned listing is never
//!    trusted, so a worker that somehow learned a privileged tool name (or
//!    cached a stale listing) is still rejected at call time.
//!
//! An unresolvable or missing identity gets the most restrictive access.

use serde::{Deserialize, Serialize};

use crate::errors::ToolError;
use crate::history::StoreHandle;

use super::ToolSpec;

/// Visibility scope of a protocol tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolScope {
    /// Available to every caller.
    Shared,
    /// Available only to supervisor (orchestrator) identities.
    Orchestrator,
}

/// The full tool table. Order is the listing order.
pub const TOOL_TABLE: &[(&str, ToolScope)] = &[
    ("write_result", ToolScope::Shared),
    ("load_result", ToolScope::Shared),
    ("read_result_summary", ToolScope::Shared),
    ("get_process_state", ToolScope::Orchestrator),
    ("record_decision", ToolScope::Orchestrator),
    ("inject_steps", ToolScope::Orchestrator),
    ("get_repo_changes", ToolScope::Orchestrator),
];

/// Scope of a tool by name, `None` for unknown tools.
pub fn scope_of(tool: &str) -> Option<ToolScope> {
    TOOL_TABLE
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, scope)| *scope)
}

/// Request-time capability filter. Holds a store handle so the identity
/// flag is derived state, resolved fresh on every request.
#[derive(Clone)]
pub struct ToolScopeGate {
    store: StoreHandle,
}

impl ToolScopeGate {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Resolve the caller's identity flag. Missing header, unknown task id,
    /// or a store failure all resolve to non-orchestrator.
    pub async fn is_orchestrator(&self, caller: Option<&str>) -> bool {
        let Some(task_id) = caller else {
            return false;
        };
        let task_id = task_id.to_string();
        match self
            .store
            .call(move |store| store.is_orchestrator(&task_id))
            .await
        {
            Ok(Some(flag)) => flag,
            Ok(None) | Err(_) => false,
        }
    }

    /// Filtered listing for the caller.
    pub async fn list_tools(&self, caller: Option<&str>) -> Vec<ToolSpec> {
        let orchestrator = self.is_orchestrator(caller).await;
        TOOL_TABLE
            .iter()
            .filter(|(_, scope)| orchestrator || *scope == ToolScope::Shared)
            .map(|(name, scope)| ToolSpec {
                name: (*name).to_string(),
                scope: *scope,
            })
            .collect()
    }

    /// Invocation-layer check. Re-resolves the identity flag; rejects a
    /// non-orchestrator caller of an orchestrator-exclusive tool.
    pub async fn authorize(&self, caller: Option<&str>, tool: &str) -> Result<(), ToolError> {
        let scope = scope_of(tool).ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;
        if scope == ToolScope::Orchestrator && !self.is_orchestrator(caller).await {
            return Err(ToolError::ScopeViolation {
                tool: tool.to_string(),
            });
        }
        Ok(())
    }
}
