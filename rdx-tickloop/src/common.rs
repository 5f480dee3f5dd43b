//! Contains common, primitive types shared across the scheduler.
//!
//! This module defines the [`Phase`] ordering and the identifier types used to
//! address loop states and event observers. Using distinct types keeps the
//! public API from mixing up the two kinds of handles.

use slotmap::new_key_type;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

new_key_type! {
    /// Uniquely and safely identifies an observer subscribed to an event type.
    ///
    /// Returned by `Scheduler::subscribe` and consumed by `Scheduler::unsubscribe`.
    /// Keys are never reused for a live observer, so a stale id can't remove
    /// somebody else's subscription.
    pub struct ObserverId;
}

/// One of the four stages executed, in order, on every loop iteration.
///
/// The derived `Ord` is the execution order:
/// `EarlyUpdate < FixedUpdate < Update < LateUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Runs once per iteration, before any fixed steps.
    EarlyUpdate,
    /// Runs zero or more times per iteration, once per accumulated fixed step.
    FixedUpdate,
    /// Runs once per iteration with the frame's elapsed time.
    Update,
    /// Runs once per iteration after `Update`.
    LateUpdate,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 4] = [
        Phase::EarlyUpdate,
        Phase::FixedUpdate,
        Phase::Update,
        Phase::LateUpdate,
    ];

    /// Position of this phase in [`Phase::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Phase::EarlyUpdate => 0,
            Phase::FixedUpdate => 1,
            Phase::Update => 2,
            Phase::LateUpdate => 3,
        }
    }

    /// A short, human-readable label for logs and shells.
    pub const fn label(self) -> &'static str {
        match self {
            Phase::EarlyUpdate => "early_update",
            Phase::FixedUpdate => "fixed_update",
            Phase::Update => "update",
            Phase::LateUpdate => "late_update",
        }
    }

    /// Parses a label produced by [`Phase::label`]. Also accepts the short
    /// forms `early`, `fixed` and `late`.
    pub fn from_label(label: &str) -> Option<Phase> {
        match label {
            "early_update" | "early" => Some(Phase::EarlyUpdate),
            "fixed_update" | "fixed" => Some(Phase::FixedUpdate),
            "update" => Some(Phase::Update),
            "late_update" | "late" => Some(Phase::LateUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies a loop state.
///
/// Ids are handed out when a `LoopState` is built, not when it is registered,
/// so an event can be queued for a state that has not been added yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopStateId(u64);

static NEXT_LOOP_STATE_ID: AtomicU64 = AtomicU64::new(1);

impl LoopStateId {
    /// The idle sentinel. Reported as the current state whenever no loop
    /// state is executing. It never appears in the registry.
    pub const NO_STATE: LoopStateId = LoopStateId(0);

    pub(crate) fn next() -> Self {
        LoopStateId(NEXT_LOOP_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        LoopStateId(raw)
    }

    /// Returns `true` if this is the [`LoopStateId::NO_STATE`] sentinel.
    pub fn is_no_state(self) -> bool {
        self == Self::NO_STATE
    }

    /// The raw numeric value, mostly useful for display.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoopStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_state() {
            f.write_str("NoState")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}
