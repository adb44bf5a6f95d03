//! Keyed cache of last-solved network states.
//!
//! One slot per logical network variant. The slot's own mutex is held for
//! the whole duration of a solve, so at most one solve runs against a
//! given variant at a time while different variants proceed in parallel.
//! Lifecycle is explicit: a slot is created empty on first use, updated
//! after every successful solve, and dropped by [`StateCache::invalidate`]
//! or [`StateCache::clear`]. Nothing here is process-global; the engine
//! holds an `Arc<StateCache>` injected by the caller.

use gridflow_core::BusId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Solved operating point of one network: per-bus voltage magnitude (p.u.)
/// and angle (rad), keyed by the external bus identity so it survives
/// component re-splits.
#[derive(Debug, Clone, Default)]
pub struct CachedState {
    pub bus_states: Vec<(BusId, f64, f64)>,
}

type Slot = Arc<Mutex<Option<CachedState>>>;

/// Keyed store of last-solved states.
#[derive(Debug, Default)]
pub struct StateCache {
    slots: Mutex<HashMap<String, Slot>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A solve that panicked mid-update leaves at worst a stale state,
    // which the next solve overwrites.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for a variant, created empty on first use. Hold the returned
    /// mutex for the duration of a solve to serialize per key.
    pub fn slot(&self, variant: &str) -> Slot {
        let mut slots = lock_unpoisoned(&self.slots);
        slots
            .entry(variant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Last solved state of a variant, if any.
    pub fn get(&self, variant: &str) -> Option<CachedState> {
        let slots = lock_unpoisoned(&self.slots);
        let slot = slots.get(variant)?.clone();
        drop(slots);
        let state = lock_unpoisoned(&slot);
        state.clone()
    }

    /// Drop one variant's cached state.
    pub fn invalidate(&self, variant: &str) {
        lock_unpoisoned(&self.slots).remove(variant);
    }

    /// Drop every cached state.
    pub fn clear(&self) {
        lock_unpoisoned(&self.slots).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
