//! Injection admission control.
//!
//! Injected steps re-run the pre-step checkpoint without advancing the step
//! index, so a supervisor that keeps injecting at the same spot would loop
//! forever. The guard counts accepted injection events per originating step
//! index and refuses once the cap is reached.

use std::collections::HashMap;

use tracing::warn;

/// Per-run counter of accepted injection events, keyed by the step index
/// that was current when each injection was decided.
#[derive(Debug, Default)]
pub struct InjectionGuard {
    accepted: HashMap<usize, u32>,
}

impl InjectionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or refuse an injection originating at `origin`. Counts one
    /// event per call regardless of how many steps it carries. A refused
    /// event leaves the counter untouched.
    pub fn admit(&mut self, origin: usize, max_injections: u32) -> bool {
        let count = self.accepted.entry(origin).or_insert(0);
        if *count >= max_injections {
            warn!(
                origin_step_index = origin,
                max_injections, "Injection limit reached; treating decision as proceed"
            );
            return false;
        }
        *count += 1;
        true
    }

    /// Accepted injection events for one origin index.
    pub fn count(&self, origin: usize) -> u32 {
        self.accepted.get(&origin).copied().unwrap_or(0)
    }
}
