//! Tool-call protocol surface.
//!
//! Worker and supervisor agents share one protocol; the scope gate decides
//! which operations each caller identity can see and invoke. The broker is
//! the in-process dispatch behind whatever transport carries the calls.

pub mod broker;
pub mod gate;

pub use broker::ToolBroker;
pub use gate::{ToolScope, ToolScopeGate};

use serde::{Deserialize, Serialize};

/// One entry in a filtered tool listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub scope: ToolScope,
}
