//! Defines loop states: the units of per-phase work the scheduler runs.

use super::lock;
use crate::common::{LoopStateId, Phase};
use crate::engine::Scheduler;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// The work a loop state performs. Receives its context and the elapsed time
/// in seconds for the phase it runs in.
pub type LoopAction = Box<dyn FnMut(&StateContext<'_>, f64) + Send>;

/// A unit of per-phase work.
///
/// States are ordered within their phase by the engine-priority flag (flagged
/// states first), then by ascending `priority`. The order among states with
/// identical keys is unspecified.
///
/// # Example
/// ```
/// use tickloop::prelude::*;
///
/// let state = LoopState::new(Phase::Update, |_ctx, dt| {
///     let _ = dt;
/// })
/// .with_priority(10)
/// .with_label("movement");
/// assert_eq!(state.phase(), Phase::Update);
/// ```
pub struct LoopState {
    id: LoopStateId,
    phase: Phase,
    engine_priority: bool,
    priority: i32,
    label: Option<String>,
    action: Mutex<LoopAction>,
    executing: AtomicBool,
}

impl LoopState {
    /// Creates a state for `phase` with priority 0 and no engine priority.
    pub fn new(
        phase: Phase,
        action: impl FnMut(&StateContext<'_>, f64) + Send + 'static,
    ) -> Self {
        Self {
            id: LoopStateId::next(),
            phase,
            engine_priority: false,
            priority: 0,
            label: None,
            action: Mutex::new(Box::new(action)),
            executing: AtomicBool::new(false),
        }
    }

    /// Lower values run earlier within the same phase and engine-priority group.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Engine-priority states run before every other state of their phase.
    pub fn with_engine_priority(mut self, engine_priority: bool) -> Self {
        self.engine_priority = engine_priority;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> LoopStateId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn engine_priority(&self) -> bool {
        self.engine_priority
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// `true` only while the state's action is running.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// A plain-data snapshot of this state's identity and ordering.
    pub fn info(&self) -> LoopStateInfo {
        LoopStateInfo {
            id: self.id,
            phase: self.phase,
            engine_priority: self.engine_priority,
            priority: self.priority,
            label: self.label.clone(),
        }
    }

    /// Ordering within a phase.
    pub(crate) fn cmp_within_phase(&self, other: &LoopState) -> CmpOrdering {
        other
            .engine_priority
            .cmp(&self.engine_priority)
            .then(self.priority.cmp(&other.priority))
    }

    /// Runs the action. The action mutex keeps two threads from entering
    /// the same state at once.
    pub(crate) fn execute(&self, scheduler: &Scheduler, delta: f64) {
        let mut action = lock(&self.action);
        self.executing.store(true, Ordering::SeqCst);
        let _executing = ExecutingFlag(&self.executing);
        let context = StateContext {
            scheduler,
            state: self,
        };
        (*action)(&context, delta);
    }
}

impl fmt::Debug for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopState")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("engine_priority", &self.engine_priority)
            .field("priority", &self.priority)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Clears the executing flag even if the action unwinds.
struct ExecutingFlag<'a>(&'a AtomicBool);

impl Drop for ExecutingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a loop-state action sees while it runs.
///
/// Besides the state itself, the context hands out the owning scheduler, so
/// actions can register further states or fire events without holding a
/// handle of their own.
pub struct StateContext<'a> {
    scheduler: &'a Scheduler,
    state: &'a LoopState,
}

impl<'a> StateContext<'a> {
    pub fn scheduler(&self) -> &'a Scheduler {
        self.scheduler
    }

    pub fn state(&self) -> &'a LoopState {
        self.state
    }

    pub fn id(&self) -> LoopStateId {
        self.state.id
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }
}

/// Read-only description of a registered loop state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStateInfo {
    pub id: LoopStateId,
    pub phase: Phase,
    pub engine_priority: bool,
    pub priority: i32,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(phase: Phase) -> LoopState {
        LoopState::new(phase, |_, _| {})
    }

    #[test]
    fn test_builder_defaults() {
        let state = noop(Phase::FixedUpdate);
        assert_eq!(state.phase(), Phase::FixedUpdate);
        assert_eq!(state.priority(), 0);
        assert!(!state.engine_priority());
        assert!(state.label().is_none());
        assert!(!state.is_executing());
        assert!(!state.id().is_no_state());
    }

    #[test]
    fn test_engine_priority_sorts_first() {
        let engine = noop(Phase::Update).with_engine_priority(true).with_priority(100);
        let user = noop(Phase::Update).with_priority(-100);
        assert_eq!(engine.cmp_within_phase(&user), CmpOrdering::Less);
        assert_eq!(user.cmp_within_phase(&engine), CmpOrdering::Greater);
    }

    #[test]
    fn test_lower_priority_sorts_first() {
        let early = noop(Phase::Update).with_priority(-1);
        let late = noop(Phase::Update).with_priority(5);
        assert_eq!(early.cmp_within_phase(&late), CmpOrdering::Less);
        assert_eq!(
            early.cmp_within_phase(&noop(Phase::Update).with_priority(-1)),
            CmpOrdering::Equal
        );
    }

    #[test]
    fn test_info_snapshot() {
        let state = noop(Phase::LateUpdate)
            .with_priority(3)
            .with_engine_priority(true)
            .with_label("camera");
        let info = state.info();
        assert_eq!(info.id, state.id());
        assert_eq!(info.phase, Phase::LateUpdate);
        assert_eq!(info.priority, 3);
        assert!(info.engine_priority);
        assert_eq!(info.label.as_deref(), Some("camera"));
    }
}
