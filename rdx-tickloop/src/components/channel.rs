//! A typed publish/subscribe channel with deferred delivery.
//!
//! Listeners are keyed by the event's [`TypeId`]. Each event type has an
//! ordered list of observers and at most one handler. When a handler is
//! installed it alone decides who hears about an event; otherwise every
//! observer is notified in subscription order. That choice is made when the
//! event is delivered, not when it is queued.

use super::lock;
use crate::common::{LoopStateId, ObserverId, Phase};
use slotmap::SlotMap;
use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// A plain per-type listener.
pub type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An override that receives every observer of the type and decides fan-out.
pub type EventHandler<E> = Arc<dyn Fn(&[Observer<E>], &E) + Send + Sync>;

/// An event parked until its boundary is reached. Delivery goes back through
/// the channel so the listener set is resolved at that moment.
struct QueuedEvent {
    deliver: Box<dyn FnOnce(&EventChannel) + Send>,
}

impl QueuedEvent {
    fn new<E: Send + 'static>(event: E) -> Self {
        Self {
            deliver: Box::new(move |channel: &EventChannel| channel.deliver(&event)),
        }
    }
}

struct Listeners<E> {
    observers: Vec<(ObserverId, Observer<E>)>,
    handler: Option<EventHandler<E>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            handler: None,
        }
    }
}

/// Lets the table remove an observer without knowing its event type.
trait ErasedListeners: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn remove_observer(&mut self, id: ObserverId) -> bool;
    fn is_empty(&self) -> bool;
}

impl<E: 'static> ErasedListeners for Listeners<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    fn is_empty(&self) -> bool {
        self.observers.is_empty() && self.handler.is_none()
    }
}

#[derive(Default)]
struct ListenerTable {
    by_type: HashMap<TypeId, Box<dyn ErasedListeners>>,
    owners: SlotMap<ObserverId, TypeId>,
}

impl ListenerTable {
    fn get<E: 'static>(&self) -> Option<&Listeners<E>> {
        self.by_type
            .get(&TypeId::of::<E>())
            .and_then(|entry| entry.as_any().downcast_ref::<Listeners<E>>())
    }

    fn get_or_insert<E: 'static>(&mut self) -> Option<&mut Listeners<E>> {
        self.by_type
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Listeners::<E>::default()))
            .as_any_mut()
            .downcast_mut::<Listeners<E>>()
    }

    fn get_mut<E: 'static>(&mut self) -> Option<&mut Listeners<E>> {
        self.by_type
            .get_mut(&TypeId::of::<E>())
            .and_then(|entry| entry.as_any_mut().downcast_mut::<Listeners<E>>())
    }

    fn prune(&mut self, type_id: TypeId) {
        if self.by_type.get(&type_id).is_some_and(|entry| entry.is_empty()) {
            self.by_type.remove(&type_id);
        }
    }
}

/// The scheduler's event bus.
///
/// All collections sit behind their own mutex and no lock is held while user
/// callbacks run, so observers may subscribe, unsubscribe or fire further
/// events from inside a callback. Only the run loop flushes the queues;
/// outside the crate the channel is seen through [`ChannelStatus`].
pub(crate) struct EventChannel {
    listeners: Mutex<ListenerTable>,
    phase_queues: [Mutex<VecDeque<QueuedEvent>>; 4],
    state_queues: Mutex<HashMap<LoopStateId, VecDeque<QueuedEvent>>>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(ListenerTable::default()),
            phase_queues: Default::default(),
            state_queues: Mutex::new(HashMap::new()),
        }
    }

    // --- Listener management ---

    /// Adds an observer for events of type `E`. Observers are notified in
    /// the order they subscribed.
    pub fn subscribe<E: 'static>(&self, observer: Observer<E>) -> ObserverId {
        let mut table = lock(&self.listeners);
        let id = table.owners.insert(TypeId::of::<E>());
        if let Some(listeners) = table.get_or_insert::<E>() {
            listeners.observers.push((id, observer));
        }
        id
    }

    /// Removes an observer. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut table = lock(&self.listeners);
        let Some(type_id) = table.owners.remove(id) else {
            return false;
        };
        let removed = table
            .by_type
            .get_mut(&type_id)
            .is_some_and(|entry| entry.remove_observer(id));
        table.prune(type_id);
        removed
    }

    /// Installs the handler for `E`, returning the one it replaced.
    pub fn set_handler<E: 'static>(&self, handler: EventHandler<E>) -> Option<EventHandler<E>> {
        lock(&self.listeners)
            .get_or_insert::<E>()
            .and_then(|listeners| listeners.handler.replace(handler))
    }

    /// Clears the handler for `E`. Returns `true` if one was installed.
    pub fn remove_handler<E: 'static>(&self) -> bool {
        let mut table = lock(&self.listeners);
        let removed = table
            .get_mut::<E>()
            .is_some_and(|listeners| listeners.handler.take().is_some());
        table.prune(TypeId::of::<E>());
        removed
    }

    /// Number of observers currently subscribed to `E`.
    pub fn observer_count<E: 'static>(&self) -> usize {
        lock(&self.listeners)
            .get::<E>()
            .map_or(0, |listeners| listeners.observers.len())
    }

    /// Whether a handler is installed for `E`.
    pub fn has_handler<E: 'static>(&self) -> bool {
        lock(&self.listeners)
            .get::<E>()
            .is_some_and(|listeners| listeners.handler.is_some())
    }

    // --- Firing ---

    /// Delivers `event` on the calling thread before returning.
    pub fn fire_immediate<E: 'static>(&self, event: E) {
        self.deliver(&event);
    }

    /// Queues `event` for delivery once `phase` finishes in the current
    /// iteration (or the next one, if that phase has already run).
    pub fn fire_on_phase<E: Send + 'static>(&self, event: E, phase: Phase) {
        lock(&self.phase_queues[phase.index()]).push_back(QueuedEvent::new(event));
    }

    /// Queues `event` for delivery right after the given loop state's action
    /// returns. The event waits across iterations until that slot is reached.
    pub fn fire_on_loop_state<E: Send + 'static>(&self, event: E, state: LoopStateId) {
        lock(&self.state_queues)
            .entry(state)
            .or_default()
            .push_back(QueuedEvent::new(event));
    }

    // --- Flushing ---

    /// Delivers everything queued for `phase`, in FIFO order. Events queued
    /// for the same phase while flushing wait for the next flush.
    pub(crate) fn flush_phase(&self, phase: Phase) {
        let queued = std::mem::take(&mut *lock(&self.phase_queues[phase.index()]));
        if !queued.is_empty() {
            trace!(%phase, count = queued.len(), "flushing phase events");
        }
        for event in queued {
            (event.deliver)(self);
        }
    }

    /// Delivers everything queued for a loop state, in FIFO order.
    pub(crate) fn flush_loop_state(&self, state: LoopStateId) {
        let queued = lock(&self.state_queues).remove(&state);
        for event in queued.into_iter().flatten() {
            (event.deliver)(self);
        }
    }

    /// Drops anything still queued for a loop state. Returns how many events
    /// were discarded.
    pub(crate) fn discard_loop_state(&self, state: LoopStateId) -> usize {
        lock(&self.state_queues).remove(&state).map_or(0, |queue| queue.len())
    }

    pub fn pending_on_phase(&self, phase: Phase) -> usize {
        lock(&self.phase_queues[phase.index()]).len()
    }

    pub fn pending_on_loop_state(&self, state: LoopStateId) -> usize {
        lock(&self.state_queues).get(&state).map_or(0, VecDeque::len)
    }

    /// Drops every observer, handler and queued event.
    pub fn clear(&self) {
        *lock(&self.listeners) = ListenerTable::default();
        for queue in &self.phase_queues {
            lock(queue).clear();
        }
        lock(&self.state_queues).clear();
    }

    /// Resolves handler-else-observers against a snapshot of the listener
    /// set, then calls out with no lock held.
    fn deliver<E: 'static>(&self, event: &E) {
        let (handler, observers) = {
            let table = lock(&self.listeners);
            let Some(listeners) = table.get::<E>() else {
                return;
            };
            let observers: Vec<Observer<E>> = listeners
                .observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect();
            (listeners.handler.clone(), observers)
        };
        match handler {
            Some(handler) => handler(&observers, event),
            None => {
                for observer in &observers {
                    observer(event);
                }
            }
        }
    }
}

/// A read-only view of a scheduler's event channel.
///
/// Reports queue depths and listener counts without being able to deliver or
/// drop anything.
#[derive(Clone, Copy)]
pub struct ChannelStatus<'a> {
    channel: &'a EventChannel,
}

impl<'a> ChannelStatus<'a> {
    pub(crate) fn new(channel: &'a EventChannel) -> Self {
        Self { channel }
    }

    /// Events waiting for the end of `phase`.
    pub fn pending_on_phase(&self, phase: Phase) -> usize {
        self.channel.pending_on_phase(phase)
    }

    /// Events waiting for `state` to run.
    pub fn pending_on_loop_state(&self, state: LoopStateId) -> usize {
        self.channel.pending_on_loop_state(state)
    }

    pub fn observer_count<E: 'static>(&self) -> usize {
        self.channel.observer_count::<E>()
    }

    pub fn has_handler<E: 'static>(&self) -> bool {
        self.channel.has_handler::<E>()
    }
}
