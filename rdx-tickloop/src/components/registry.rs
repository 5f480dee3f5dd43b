//! The ordered collection of registered loop states.

use super::lock;
use super::loop_state::{LoopState, LoopStateInfo};
use crate::common::{LoopStateId, Phase};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps loop states sorted per phase and stages additions made while the
/// loop is running.
///
/// While staging is on, new states go to a pending queue that the run loop
/// drains at the top of each iteration, so a phase that is already executing
/// never sees a state appear mid-way.
pub struct LoopStateRegistry {
    phases: [Mutex<Vec<Arc<LoopState>>>; 4],
    pending: Mutex<Vec<Arc<LoopState>>>,
    staging: AtomicBool,
}

impl Default for LoopStateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopStateRegistry {
    pub fn new() -> Self {
        Self {
            phases: Default::default(),
            pending: Mutex::new(Vec::new()),
            staging: AtomicBool::new(false),
        }
    }

    /// Routes new registrations to the pending queue (`true`) or straight
    /// into the live sets (`false`).
    pub fn set_staging(&self, staging: bool) {
        // Hold the pending lock so a batch in flight sees one consistent mode.
        let _pending = lock(&self.pending);
        self.staging.store(staging, Ordering::SeqCst);
    }

    /// Adds one state. Returns `true` if it was staged rather than made live.
    pub fn register(&self, state: LoopState) -> bool {
        self.register_many(std::iter::once(state))
    }

    /// Adds a batch. Either every state goes live or every state is staged,
    /// and the batch keeps its relative order. Returns `true` if staged.
    pub fn register_many(&self, states: impl IntoIterator<Item = LoopState>) -> bool {
        let mut pending = lock(&self.pending);
        let staged = self.staging.load(Ordering::SeqCst);
        for state in states {
            let state = Arc::new(state);
            if staged {
                pending.push(state);
            } else {
                self.insert_live(state);
            }
        }
        staged
    }

    /// Moves every staged state into its phase. Returns how many moved.
    pub fn drain_pending(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.len();
        for state in pending.drain(..) {
            self.insert_live(state);
        }
        count
    }

    /// Visits the states of `phase` in order.
    ///
    /// The visit runs over a snapshot taken under the lock, so no lock is held
    /// while `visit` runs and states may be added or removed meanwhile.
    pub fn iterate(&self, phase: Phase, mut visit: impl FnMut(&LoopState)) {
        let snapshot: Vec<Arc<LoopState>> = lock(&self.phases[phase.index()]).clone();
        for state in &snapshot {
            visit(state);
        }
    }

    /// Removes a state from its phase or from the pending queue.
    pub fn remove(&self, id: LoopStateId) -> Option<LoopStateInfo> {
        let mut pending = lock(&self.pending);
        if let Some(index) = pending.iter().position(|state| state.id() == id) {
            return Some(pending.remove(index).info());
        }
        for phase in &self.phases {
            let mut states = lock(phase);
            if let Some(index) = states.iter().position(|state| state.id() == id) {
                return Some(states.remove(index).info());
            }
        }
        None
    }

    /// Whether `id` is live or staged.
    pub fn contains(&self, id: LoopStateId) -> bool {
        lock(&self.pending).iter().any(|state| state.id() == id)
            || self
                .phases
                .iter()
                .any(|phase| lock(phase).iter().any(|state| state.id() == id))
    }

    /// Live states grouped by phase, in execution order. Every phase is
    /// present, possibly with an empty list.
    pub fn snapshot(&self) -> BTreeMap<Phase, Vec<LoopStateInfo>> {
        Phase::ALL
            .iter()
            .map(|&phase| {
                let infos = lock(&self.phases[phase.index()])
                    .iter()
                    .map(|state| state.info())
                    .collect();
                (phase, infos)
            })
            .collect()
    }

    /// Number of live states across all phases.
    pub fn len(&self) -> usize {
        self.phases.iter().map(|phase| lock(phase).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drops every live and staged state.
    pub fn clear(&self) {
        lock(&self.pending).clear();
        for phase in &self.phases {
            lock(phase).clear();
        }
    }

    /// Inserts after every state that sorts before or equal to it.
    fn insert_live(&self, state: Arc<LoopState>) {
        let mut states = lock(&self.phases[state.phase().index()]);
        let index = states.partition_point(|existing| existing.cmp_within_phase(&state).is_le());
        states.insert(index, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(phase: Phase, priority: i32) -> LoopState {
        LoopState::new(phase, |_, _| {}).with_priority(priority)
    }

    fn ids(registry: &LoopStateRegistry, phase: Phase) -> Vec<LoopStateId> {
        registry.snapshot()[&phase].iter().map(|info| info.id).collect()
    }

    #[test]
    fn test_register_orders_by_priority() {
        let registry = LoopStateRegistry::new();
        let b = state(Phase::Update, 5);
        let a = state(Phase::Update, -2);
        let engine = state(Phase::Update, 50).with_engine_priority(true);
        let (a_id, b_id, engine_id) = (a.id(), b.id(), engine.id());

        registry.register(b);
        registry.register(a);
        registry.register(engine);

        assert_eq!(ids(&registry, Phase::Update), vec![engine_id, a_id, b_id]);
        assert!(registry.snapshot()[&Phase::EarlyUpdate].is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_states_land_in_their_own_phase() {
        let registry = LoopStateRegistry::new();
        registry.register_many(Phase::ALL.map(|phase| state(phase, 0)));
        for phase in Phase::ALL {
            assert_eq!(registry.snapshot()[&phase].len(), 1);
        }
    }

    #[test]
    fn test_staging_defers_until_drain() {
        let registry = LoopStateRegistry::new();
        registry.set_staging(true);

        let first = state(Phase::Update, 1);
        let second = state(Phase::Update, 1);
        let (first_id, second_id) = (first.id(), second.id());
        assert!(registry.register_many(vec![first, second]));

        assert!(registry.is_empty());
        assert_eq!(registry.pending_len(), 2);
        assert!(registry.contains(first_id));

        assert_eq!(registry.drain_pending(), 2);
        assert_eq!(registry.pending_len(), 0);
        assert_eq!(ids(&registry, Phase::Update), vec![first_id, second_id]);
    }

    #[test]
    fn test_iterate_visits_in_order() {
        let registry = LoopStateRegistry::new();
        registry.register(state(Phase::FixedUpdate, 3));
        registry.register(state(Phase::FixedUpdate, 1));
        registry.register(state(Phase::FixedUpdate, 2));

        let mut seen = Vec::new();
        registry.iterate(Phase::FixedUpdate, |state| seen.push(state.priority()));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_live_and_staged() {
        let registry = LoopStateRegistry::new();
        let live = state(Phase::LateUpdate, 0);
        let live_id = live.id();
        registry.register(live);

        registry.set_staging(true);
        let staged = state(Phase::EarlyUpdate, 0);
        let staged_id = staged.id();
        registry.register(staged);

        assert_eq!(registry.remove(live_id).map(|info| info.id), Some(live_id));
        assert_eq!(registry.remove(staged_id).map(|info| info.phase), Some(Phase::EarlyUpdate));
        assert!(registry.remove(live_id).is_none());
        assert!(!registry.contains(staged_id));
    }

    #[test]
    fn test_clear() {
        let registry = LoopStateRegistry::new();
        registry.register(state(Phase::Update, 0));
        registry.set_staging(true);
        registry.register(state(Phase::Update, 0));
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.pending_len(), 0);
    }
}
