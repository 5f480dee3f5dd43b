//! The scheduler that drives the phased, fixed-timestep loop.

use crate::common::{LoopStateId, ObserverId, Phase};
use crate::components::channel::{ChannelStatus, EventChannel, EventHandler, Observer};
use crate::components::lock;
use crate::components::loop_state::{LoopState, LoopStateInfo};
use crate::components::registry::LoopStateRegistry;
use crate::config::{
    validate_fps, validate_max_accumulated, validate_ups, FaultPolicy, SchedulerConfig,
};
use crate::error::{Result, TickloopError};
use crate::events::SchedulerEvent;
use crate::time::{Clock, MonotonicTime, TimeSource};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Caller policy consulted once per iteration: "keep going?" or "pace this
/// iteration?".
pub type LoopPredicate = Arc<dyn Fn(&Scheduler) -> bool + Send + Sync>;

/// The loop driver.
///
/// A `Scheduler` owns its loop-state registry, its event channel and its
/// settings. It is a cheap, cloneable handle: clone it into other threads to
/// register states or fire events while `run` executes on the loop thread.
///
/// Every iteration runs, in order:
/// 1. sample the clock, feed the accumulator, activate staged loop states;
/// 2. `EarlyUpdate` states, then `EarlyUpdate` events;
/// 3. `FixedUpdate` states and events, once per whole fixed step owed;
/// 4. `Update` states, then `Update` events;
/// 5. `LateUpdate` states, then `LateUpdate` events;
/// 6. if the sync predicate agrees, sleep out the rest of the frame.
///
/// # Example
/// ```
/// use tickloop::prelude::*;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
///
/// let frames = Arc::new(AtomicU32::new(0));
/// let frames_seen = frames.clone();
/// let scheduler = Scheduler::new(
///     move |_| frames_seen.load(Ordering::SeqCst) < 3,
///     |_| false,
/// );
///
/// let counter = frames.clone();
/// scheduler.add_loop_state(LoopState::new(Phase::LateUpdate, move |_, _| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// }));
///
/// scheduler.run().unwrap();
/// assert_eq!(frames.load(Ordering::SeqCst), 3);
/// assert!(!scheduler.is_running());
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    defaults: SchedulerConfig,
    settings: Mutex<SchedulerConfig>,
    running: AtomicBool,
    current: AtomicU64,
    iterations: AtomicU64,
    accumulator: AtomicU64,
    registry: LoopStateRegistry,
    events: EventChannel,
    time: Arc<dyn TimeSource>,
    should_continue: LoopPredicate,
    should_sync: LoopPredicate,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// Builds a [`Scheduler`] with a non-default configuration or time source.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    time: Option<Arc<dyn TimeSource>>,
    should_continue: LoopPredicate,
    should_sync: LoopPredicate,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the monotonic wall clock, e.g. with a `ManualTime`.
    pub fn time_source(mut self, time: impl TimeSource + 'static) -> Self {
        self.time = Some(Arc::new(time));
        self
    }

    /// Validates the configuration and creates the scheduler.
    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        let time = self
            .time
            .unwrap_or_else(|| Arc::new(MonotonicTime::new()));
        Ok(Scheduler::from_parts(
            self.config,
            time,
            self.should_continue,
            self.should_sync,
        ))
    }
}

// Construction and the run loop.
impl Scheduler {
    /// Creates a scheduler with the default rates and the real clock.
    ///
    /// `should_continue` is checked before every iteration; `run` returns once
    /// it says `false`. `should_sync` decides per iteration whether to sleep
    /// the frame out to the target FPS.
    pub fn new(
        should_continue: impl Fn(&Scheduler) -> bool + Send + Sync + 'static,
        should_sync: impl Fn(&Scheduler) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::from_parts(
            SchedulerConfig::default(),
            Arc::new(MonotonicTime::new()),
            Arc::new(should_continue),
            Arc::new(should_sync),
        )
    }

    /// Creates a scheduler from a configuration, rejecting invalid rates.
    pub fn with_config(
        config: SchedulerConfig,
        should_continue: impl Fn(&Scheduler) -> bool + Send + Sync + 'static,
        should_sync: impl Fn(&Scheduler) -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::builder(should_continue, should_sync)
            .config(config)
            .build()
    }

    pub fn builder(
        should_continue: impl Fn(&Scheduler) -> bool + Send + Sync + 'static,
        should_sync: impl Fn(&Scheduler) -> bool + Send + Sync + 'static,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            time: None,
            should_continue: Arc::new(should_continue),
            should_sync: Arc::new(should_sync),
        }
    }

    fn from_parts(
        config: SchedulerConfig,
        time: Arc<dyn TimeSource>,
        should_continue: LoopPredicate,
        should_sync: LoopPredicate,
    ) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                defaults: config.clone(),
                settings: Mutex::new(config),
                running: AtomicBool::new(false),
                current: AtomicU64::new(LoopStateId::NO_STATE.as_u64()),
                iterations: AtomicU64::new(0),
                accumulator: AtomicU64::new(0.0_f64.to_bits()),
                registry: LoopStateRegistry::new(),
                events: EventChannel::new(),
                time,
                should_continue,
                should_sync,
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Runs iterations until the continuation predicate returns `false`.
    ///
    /// Blocks the calling thread. Returns `AlreadyRunning` if another `run` is
    /// in progress. A panic from a loop-state action or event callback
    /// unwinds out of this call under the default fault policy; the running
    /// flag and current state are still reset on the way out.
    pub fn run(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TickloopError::AlreadyRunning);
        }
        let _guard = RunGuard { scheduler: self };

        self.shared.registry.set_staging(true);
        self.shared.iterations.store(0, Ordering::SeqCst);
        self.store_accumulator(0.0);
        while self.shared.wake_rx.try_recv().is_ok() {}

        let settings = self.settings();
        info!(
            target_fps = settings.target_fps,
            target_ups = settings.target_ups,
            "Scheduler starting up..."
        );
        self.fire_event(SchedulerEvent::Started {
            target_fps: settings.target_fps,
            target_ups: settings.target_ups,
        });

        let mut frame_clock = Clock::new(Arc::clone(&self.shared.time));
        let mut fixed_clock = Clock::new(Arc::clone(&self.shared.time));
        fixed_clock.sample_delta();
        let mut accumulator = 0.0;

        while (self.shared.should_continue)(self) {
            self.iterate(&mut frame_clock, &mut fixed_clock, &mut accumulator);
        }

        let iterations = self.iterations();
        info!(iterations, "Scheduler has stopped.");
        self.fire_event(SchedulerEvent::Stopped { iterations });
        Ok(())
    }

    /// One pass through all four phases, plus the optional sync sleep.
    fn iterate(&self, frame_clock: &mut Clock, fixed_clock: &mut Clock, accumulator: &mut f64) {
        let settings = self.settings();
        let fixed_step = settings.fixed_step();

        let delta = frame_clock.sample_delta();
        *accumulator += delta;
        if let Some(max) = settings.max_accumulated {
            if *accumulator > max {
                warn!(
                    dropped = *accumulator - max,
                    "Accumulated time exceeds the catch-up limit; dropping the excess."
                );
                *accumulator = max;
            }
        }
        self.store_accumulator(*accumulator);

        let activated = self.shared.registry.drain_pending();
        if activated > 0 {
            debug!(activated, "Activated loop states registered mid-run.");
        }
        trace!(
            iteration = self.iterations(),
            delta,
            accumulator = *accumulator,
            "Iteration start."
        );

        self.run_phase(Phase::EarlyUpdate, delta, settings.fault_policy);

        while *accumulator >= fixed_step {
            let fixed_delta = fixed_clock.sample_delta();
            trace!(fixed_delta, "Fixed step.");
            self.run_phase(Phase::FixedUpdate, fixed_delta, settings.fault_policy);
            *accumulator -= fixed_step;
            self.store_accumulator(*accumulator);
        }

        self.run_phase(Phase::Update, delta, settings.fault_policy);
        self.run_phase(Phase::LateUpdate, delta, settings.fault_policy);

        self.set_current(LoopStateId::NO_STATE);
        self.shared.iterations.fetch_add(1, Ordering::SeqCst);

        if (self.shared.should_sync)(self) {
            self.sync(frame_clock);
        }
    }

    /// Runs every state of `phase`, delivering each state's queued events as
    /// soon as it returns, then the phase's own queue.
    fn run_phase(&self, phase: Phase, delta: f64, fault_policy: FaultPolicy) {
        self.shared.registry.iterate(phase, |state| {
            self.set_current(state.id());
            match fault_policy {
                FaultPolicy::Propagate => state.execute(self, delta),
                FaultPolicy::Isolate => {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| state.execute(self, delta)));
                    if let Err(payload) = outcome {
                        warn!(
                            state = %state.id(),
                            label = state.label().unwrap_or("-"),
                            %phase,
                            reason = panic_message(payload.as_ref()),
                            "Loop state panicked; isolating and continuing."
                        );
                    }
                }
            }
            self.set_current(LoopStateId::NO_STATE);
            self.shared.events.flush_loop_state(state.id());
        });
        self.shared.events.flush_phase(phase);
    }

    /// Sleeps until one frame after the last clock sample. Returns at once
    /// if that moment has already passed or if `wake` is called.
    fn sync(&self, frame_clock: &Clock) {
        let target_fps = self.target_fps();
        let deadline = frame_clock.last_sample_timestamp() + 1.0 / f64::from(target_fps);
        let remaining = deadline - frame_clock.now();
        if remaining > 0.0 {
            self.shared
                .time
                .sleep(Duration::from_secs_f64(remaining), &self.shared.wake_rx);
        }
    }

    fn set_current(&self, id: LoopStateId) {
        self.shared.current.store(id.as_u64(), Ordering::SeqCst);
    }

    fn store_accumulator(&self, value: f64) {
        self.shared
            .accumulator
            .store(value.to_bits(), Ordering::SeqCst);
    }
}

/// Restores the idle state when `run` exits, however it exits.
struct RunGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let shared = &self.scheduler.shared;
        shared.current.store(LoopStateId::NO_STATE.as_u64(), Ordering::SeqCst);
        shared.registry.set_staging(false);
        shared.registry.drain_pending();
        shared.running.store(false, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// Loop-state registration.
impl Scheduler {
    /// Registers a loop state and returns its id.
    ///
    /// While the loop is running the state is staged and first runs in the
    /// next iteration; otherwise it is live immediately.
    pub fn add_loop_state(&self, state: LoopState) -> LoopStateId {
        let info = state.info();
        let staged = self.shared.registry.register(state);
        self.announce_added(&info, staged);
        info.id
    }

    /// Registers a batch. All states go live together or are all staged
    /// together, keeping their relative order.
    pub fn add_loop_states(&self, states: impl IntoIterator<Item = LoopState>) -> Vec<LoopStateId> {
        let states: Vec<LoopState> = states.into_iter().collect();
        let infos: Vec<LoopStateInfo> = states.iter().map(LoopState::info).collect();
        let staged = self.shared.registry.register_many(states);
        for info in &infos {
            self.announce_added(info, staged);
        }
        infos.into_iter().map(|info| info.id).collect()
    }

    /// Removes a loop state and discards events queued for it. Returns `false`
    /// if no such state is registered.
    ///
    /// Removing a state from inside its own phase takes effect from the next
    /// visit of that phase.
    pub fn remove_loop_state(&self, id: LoopStateId) -> bool {
        let Some(info) = self.shared.registry.remove(id) else {
            return false;
        };
        let discarded = self.shared.events.discard_loop_state(id);
        debug!(state = %id, phase = %info.phase, discarded, "Loop state removed.");
        self.fire_event(SchedulerEvent::LoopStateRemoved {
            id,
            phase: info.phase,
        });
        true
    }

    fn announce_added(&self, info: &LoopStateInfo, staged: bool) {
        debug!(
            state = %info.id,
            label = info.label.as_deref().unwrap_or("-"),
            phase = %info.phase,
            priority = info.priority,
            engine_priority = info.engine_priority,
            staged,
            "Loop state registered."
        );
        self.fire_event(SchedulerEvent::LoopStateAdded {
            id: info.id,
            phase: info.phase,
        });
    }
}

// Events.
impl Scheduler {
    /// Subscribes an observer to events of type `E`.
    pub fn subscribe<E: 'static>(
        &self,
        observer: impl Fn(&E) + Send + Sync + 'static,
    ) -> ObserverId {
        self.shared.events.subscribe::<E>(Arc::new(observer))
    }

    /// Removes an observer. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Installs the single handler for `E`. While set, the handler receives
    /// the observer list with each event and decides who gets notified.
    pub fn set_event_handler<E: 'static>(
        &self,
        handler: impl Fn(&[Observer<E>], &E) + Send + Sync + 'static,
    ) -> Option<EventHandler<E>> {
        self.shared.events.set_handler::<E>(Arc::new(handler))
    }

    pub fn remove_event_handler<E: 'static>(&self) -> bool {
        self.shared.events.remove_handler::<E>()
    }

    /// Delivers an event now, on the calling thread.
    pub fn fire_event<E: 'static>(&self, event: E) {
        self.shared.events.fire_immediate(event);
    }

    /// Queues an event for the end of `phase`.
    pub fn fire_event_on_phase<E: Send + 'static>(&self, event: E, phase: Phase) {
        self.shared.events.fire_on_phase(event, phase);
    }

    /// Queues an event for right after the given loop state next runs.
    ///
    /// `LoopStateId::NO_STATE` never runs, so events aimed at it are dropped.
    pub fn fire_event_on_loop_state<E: Send + 'static>(&self, event: E, state: LoopStateId) {
        if state.is_no_state() {
            warn!(
                event = std::any::type_name::<E>(),
                "Dropping event aimed at NoState; it would never be delivered."
            );
            return;
        }
        if !self.shared.registry.contains(state) {
            debug!(state = %state, "Queuing event for a loop state that is not registered.");
        }
        self.shared.events.fire_on_loop_state(event, state);
    }

    /// Queue depths and listener counts of the scheduler's event channel.
    ///
    /// The view is read-only; deferred events are only ever flushed by the
    /// run loop.
    ///
    /// ```compile_fail
    /// use tickloop::prelude::*;
    ///
    /// let scheduler = Scheduler::new(|_| false, |_| false);
    /// scheduler.events().flush_phase(Phase::Update);
    /// ```
    pub fn events(&self) -> ChannelStatus<'_> {
        ChannelStatus::new(&self.shared.events)
    }
}

// Settings and introspection.
impl Scheduler {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// A copy of the current settings.
    pub fn settings(&self) -> SchedulerConfig {
        lock(&self.shared.settings).clone()
    }

    pub fn target_fps(&self) -> u32 {
        lock(&self.shared.settings).target_fps
    }

    pub fn target_ups(&self) -> u32 {
        lock(&self.shared.settings).target_ups
    }

    /// Sets the frame rate the sync step paces to. Rejects zero.
    pub fn set_target_fps(&self, fps: u32) -> Result<()> {
        validate_fps(fps)?;
        lock(&self.shared.settings).target_fps = fps;
        debug!(fps, "Target FPS changed.");
        Ok(())
    }

    /// Sets the fixed update rate. Rejects zero. Takes effect from the next
    /// iteration.
    pub fn set_target_ups(&self, ups: u32) -> Result<()> {
        validate_ups(ups)?;
        lock(&self.shared.settings).target_ups = ups;
        debug!(ups, "Target UPS changed.");
        Ok(())
    }

    /// Bounds catch-up after a stall. `None` makes it unbounded.
    pub fn set_max_accumulated(&self, max: Option<f64>) -> Result<()> {
        if let Some(max) = max {
            validate_max_accumulated(max)?;
        }
        lock(&self.shared.settings).max_accumulated = max;
        Ok(())
    }

    pub fn set_fault_policy(&self, policy: FaultPolicy) {
        lock(&self.shared.settings).fault_policy = policy;
    }

    /// Length of one fixed step in seconds.
    pub fn fixed_step(&self) -> f64 {
        lock(&self.shared.settings).fixed_step()
    }

    /// The loop state executing right now, or `LoopStateId::NO_STATE`.
    pub fn current_loop_state(&self) -> LoopStateId {
        LoopStateId::from_raw(self.shared.current.load(Ordering::SeqCst))
    }

    /// Live loop states grouped by phase, in execution order. Staged states
    /// are not listed until the loop activates them.
    pub fn registered_loop_states(&self) -> BTreeMap<Phase, Vec<LoopStateInfo>> {
        self.shared.registry.snapshot()
    }

    /// States registered while running and not yet activated.
    pub fn pending_loop_states(&self) -> usize {
        self.shared.registry.pending_len()
    }

    /// Iterations completed by the current (or most recent) run.
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::SeqCst)
    }

    /// Simulation time owed but not yet consumed by fixed steps.
    pub fn accumulator(&self) -> f64 {
        f64::from_bits(self.shared.accumulator.load(Ordering::SeqCst))
    }

    /// How far the loop is between two fixed steps, in `[0, 1)` unless
    /// catch-up is pending. Useful for render interpolation.
    pub fn interpolation_alpha(&self) -> f64 {
        self.accumulator() / self.fixed_step()
    }

    /// Cuts the current sync sleep short. Has no effect on a loop that is
    /// not sleeping beyond waking its next sleep early.
    pub fn wake(&self) {
        let _ = self.shared.wake_tx.try_send(());
    }

    /// Drops every observer, handler and queued event. Loop states stay.
    pub fn clear(&self) {
        self.shared.events.clear();
        debug!("Event subscriptions cleared.");
    }

    /// Returns the scheduler to its freshly built state: no loop states, no
    /// listeners, no queued events, construction-time settings. Refused
    /// while running, and `run` is refused until the reset completes.
    pub fn reset(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TickloopError::AlreadyRunning);
        }
        let _guard = RunGuard { scheduler: self };

        self.shared.registry.clear();
        self.shared.events.clear();
        *lock(&self.shared.settings) = self.shared.defaults.clone();
        self.set_current(LoopStateId::NO_STATE);
        self.shared.iterations.store(0, Ordering::SeqCst);
        self.store_accumulator(0.0);
        info!("Scheduler reset.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualTime;
    use std::sync::atomic::AtomicUsize;

    fn stop_after(iterations: u64) -> impl Fn(&Scheduler) -> bool + Send + Sync + 'static {
        move |scheduler: &Scheduler| scheduler.iterations() < iterations
    }

    #[test]
    fn test_rejects_zero_rates_without_mutating() {
        let scheduler = Scheduler::new(|_| false, |_| false);
        scheduler.set_target_fps(144).unwrap();
        scheduler.set_target_ups(30).unwrap();

        assert!(matches!(
            scheduler.set_target_fps(0),
            Err(TickloopError::InvalidTargetFps(0))
        ));
        assert!(matches!(
            scheduler.set_target_ups(0),
            Err(TickloopError::InvalidTargetUps(0))
        ));
        assert_eq!(scheduler.target_fps(), 144);
        assert_eq!(scheduler.target_ups(), 30);
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let config = SchedulerConfig {
            target_ups: 0,
            ..SchedulerConfig::default()
        };
        let result = Scheduler::with_config(config, |_| false, |_| false);
        assert!(matches!(result, Err(TickloopError::InvalidTargetUps(0))));
    }

    #[test]
    fn test_run_rejects_reentry() {
        let rejected = Arc::new(AtomicBool::new(false));
        let rejected_clone = rejected.clone();
        let scheduler = Scheduler::builder(stop_after(1), |_| false)
            .time_source(ManualTime::new())
            .build()
            .unwrap();
        scheduler.add_loop_state(LoopState::new(Phase::Update, move |ctx, _| {
            let nested = ctx.scheduler().run();
            rejected_clone.store(
                matches!(nested, Err(TickloopError::AlreadyRunning)),
                Ordering::SeqCst,
            );
        }));

        scheduler.run().unwrap();
        assert!(rejected.load(Ordering::SeqCst));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_current_state_tracks_execution() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::builder(stop_after(1), |_| false)
            .time_source(ManualTime::new())
            .build()
            .unwrap();

        let seen_clone = seen.clone();
        let id = scheduler.add_loop_state(LoopState::new(Phase::EarlyUpdate, move |ctx, _| {
            seen_clone
                .lock()
                .unwrap()
                .push((ctx.scheduler().current_loop_state(), ctx.state().is_executing()));
        }));

        scheduler.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(id, true)]);
        assert_eq!(scheduler.current_loop_state(), LoopStateId::NO_STATE);
    }

    #[test]
    fn test_isolate_policy_keeps_loop_alive() {
        let after = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig {
            fault_policy: FaultPolicy::Isolate,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::builder(stop_after(2), |_| false)
            .config(config)
            .time_source(ManualTime::new())
            .build()
            .unwrap();

        scheduler.add_loop_state(
            LoopState::new(Phase::Update, |_, _| panic!("boom")).with_priority(0),
        );
        let after_clone = after.clone();
        scheduler.add_loop_state(
            LoopState::new(Phase::Update, move |_, _| {
                after_clone.fetch_add(1, Ordering::SeqCst);
            })
            .with_priority(1),
        );

        scheduler.run().unwrap();
        assert_eq!(after.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_propagate_policy_unwinds_and_releases_running_flag() {
        let scheduler = Scheduler::builder(|_| true, |_| false)
            .time_source(ManualTime::new())
            .build()
            .unwrap();
        scheduler.add_loop_state(LoopState::new(Phase::Update, |_, _| panic!("boom")));

        let handle = scheduler.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || handle.run()));
        assert!(outcome.is_err());
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.current_loop_state(), LoopStateId::NO_STATE);
    }

    #[test]
    fn test_accumulator_clamp_bounds_catch_up() {
        let time = ManualTime::new();
        let fixed_runs = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig {
            target_ups: 10,
            max_accumulated: Some(0.25),
            ..SchedulerConfig::default()
        };
        let clock = time.clone();
        let scheduler = Scheduler::builder(
            move |scheduler: &Scheduler| {
                // Stall for five seconds before the second iteration.
                if scheduler.iterations() == 1 {
                    clock.advance(5.0);
                }
                scheduler.iterations() < 2
            },
            |_| false,
        )
        .config(config)
        .time_source(time)
        .build()
        .unwrap();

        let runs = fixed_runs.clone();
        scheduler.add_loop_state(LoopState::new(Phase::FixedUpdate, move |_, _| {
            runs.fetch_add(1, Ordering::SeqCst);
        }));

        scheduler.run().unwrap();
        assert_eq!(fixed_runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sync_sleeps_out_the_frame() {
        let time = ManualTime::new();
        let config = SchedulerConfig {
            target_fps: 10,
            ..SchedulerConfig::default()
        };
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::builder(stop_after(3), |_| true)
            .config(config)
            .time_source(time.clone())
            .build()
            .unwrap();

        let deltas_clone = deltas.clone();
        scheduler.add_loop_state(LoopState::new(Phase::Update, move |_, dt| {
            deltas_clone.lock().unwrap().push(dt);
        }));

        scheduler.run().unwrap();
        let deltas = deltas.lock().unwrap();
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0], 0.0);
        assert!((deltas[1] - 0.1).abs() < 1e-9);
        assert!((deltas[2] - 0.1).abs() < 1e-9);
        assert!((time.now() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_sync_skips_sleep_when_frame_overran() {
        let time = ManualTime::new();
        let config = SchedulerConfig {
            target_fps: 10,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::builder(stop_after(1), |_| true)
            .config(config)
            .time_source(time.clone())
            .build()
            .unwrap();

        let clock = time.clone();
        scheduler.add_loop_state(LoopState::new(Phase::Update, move |_, _| clock.advance(0.5)));

        scheduler.run().unwrap();
        assert!((time.now() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_events_for_no_state_are_dropped() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::builder(stop_after(2), |_| false)
            .time_source(ManualTime::new())
            .build()
            .unwrap();
        let counter = delivered.clone();
        scheduler.subscribe(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.fire_event_on_loop_state(7u32, LoopStateId::NO_STATE);
        assert_eq!(scheduler.events().pending_on_loop_state(LoopStateId::NO_STATE), 0);

        scheduler.add_loop_state(LoopState::new(Phase::Update, |_, _| {}));
        scheduler.run().unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    /// Calls its closure when dropped.
    struct OnDrop<F: FnMut()>(F);

    impl<F: FnMut()> Drop for OnDrop<F> {
        fn drop(&mut self) {
            (self.0)();
        }
    }

    #[test]
    fn test_run_is_refused_while_reset_is_clearing() {
        let refused = Arc::new(Mutex::new(None));
        let scheduler = Scheduler::builder(stop_after(1), |_| false)
            .time_source(ManualTime::new())
            .build()
            .unwrap();

        // Dropping this state's action happens inside reset's registry clear.
        let handle = scheduler.clone();
        let outcome = refused.clone();
        let on_clear = OnDrop(move || {
            *outcome.lock().unwrap() =
                Some(matches!(handle.run(), Err(TickloopError::AlreadyRunning)));
        });
        scheduler.add_loop_state(LoopState::new(Phase::Update, move |_, _| {
            let _owned = &on_clear;
        }));

        scheduler.reset().unwrap();
        assert_eq!(*refused.lock().unwrap(), Some(true));
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.registered_loop_states()[&Phase::Update].len(), 0);
    }

    #[test]
    fn test_lifecycle_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::builder(stop_after(2), |_| false)
            .time_source(ManualTime::new())
            .build()
            .unwrap();

        let events_clone = events.clone();
        scheduler.subscribe(move |event: &SchedulerEvent| {
            events_clone.lock().unwrap().push(event.clone());
        });
        let id = scheduler.add_loop_state(LoopState::new(Phase::Update, |_, _| {}));
        scheduler.run().unwrap();
        assert!(scheduler.remove_loop_state(id));
        assert!(!scheduler.remove_loop_state(id));

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                SchedulerEvent::LoopStateAdded {
                    id,
                    phase: Phase::Update
                },
                SchedulerEvent::Started {
                    target_fps: 60,
                    target_ups: 60
                },
                SchedulerEvent::Stopped { iterations: 2 },
                SchedulerEvent::LoopStateRemoved {
                    id,
                    phase: Phase::Update
                },
            ]
        );
    }
}
