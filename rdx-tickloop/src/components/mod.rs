//! Contains the building blocks the scheduler is assembled from.
//!
//! This module provides the loop states themselves, the registry that keeps
//! them ordered, and the event channel that delivers typed events at phase
//! and loop-state boundaries. The `Scheduler` owns one of each and drives
//! them from its run loop.

pub mod channel;
pub mod loop_state;
pub mod registry;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a previous holder panicked. None of
/// the scheduler's locks are held across user code, so the data behind a
/// poisoned lock is never half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
