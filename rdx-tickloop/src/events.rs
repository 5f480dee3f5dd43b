//! Events the scheduler publishes about itself.
//!
//! Application events can be any `'static` type and are routed by type. The
//! scheduler uses the same channel for its own lifecycle notices, so
//! listening to them is just `scheduler.subscribe(|event: &SchedulerEvent| ..)`.

use crate::common::{LoopStateId, Phase};

/// Lifecycle notices fired immediately on the thread that caused them.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Fired once when `run` begins, before the first iteration.
    Started {
        target_fps: u32,
        target_ups: u32,
    },
    /// Fired once when `run` returns normally.
    Stopped { iterations: u64 },
    /// Fired when a loop state is registered, whether it went live or was
    /// staged for the next iteration.
    LoopStateAdded { id: LoopStateId, phase: Phase },
    /// Fired when a loop state is explicitly removed.
    LoopStateRemoved { id: LoopStateId, phase: Phase },
}
