use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::CacheKey;

/// Identifies a single registered waiter, so that it can be withdrawn again.
pub type WaiterId = u64;

/// Tracks the waiters of all fetches that are currently running.
///
/// A key is pending from the moment its first waiter registers until its waiters are drained.
/// The first waiter for a key is responsible for starting the fetch; all waiters, including the
/// first one, are notified with its result in registration order.
pub struct InFlightRegistry<W> {
    pending: Mutex<FxHashMap<CacheKey, Vec<(WaiterId, W)>>>,
    next_id: AtomicU64,
}

impl<W> Default for InFlightRegistry<W> {
    fn default() -> Self {
        Self {
            pending: Default::default(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<W> fmt::Debug for InFlightRegistry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl<W> InFlightRegistry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `waiter` for `key`.
    ///
    /// Returns the id of the waiter, and whether it is the first one for a key that was not
    /// pending before. Checking and registering happen atomically, so exactly one of any number
    /// of concurrent callers is told to be first.
    pub fn register_waiter(&self, key: &CacheKey, waiter: W) -> (WaiterId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();

        match pending.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push((id, waiter));
                (id, false)
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![(id, waiter)]);
                (id, true)
            }
        }
    }

    /// Atomically takes all waiters for `key` and marks it as no longer pending.
    ///
    /// Waiters are returned in registration order. A waiter registering right after this call
    /// is first for a new fetch.
    pub fn drain_and_clear(&self, key: &CacheKey) -> Vec<W> {
        let mut pending = self.pending.lock();
        pending
            .remove(key)
            .map(|waiters| waiters.into_iter().map(|(_, waiter)| waiter).collect())
            .unwrap_or_default()
    }

    /// Withdraws a single waiter.
    ///
    /// The key stays pending even if this was its last waiter, as the running fetch still has
    /// to complete and drain it.
    pub fn remove_waiter(&self, key: &CacheKey, id: WaiterId) -> Option<W> {
        let mut pending = self.pending.lock();
        let waiters = pending.get_mut(key)?;
        let position = waiters.iter().position(|(waiter_id, _)| *waiter_id == id)?;
        Some(waiters.remove(position).1)
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        let pending = self.pending.lock();
        pending.contains_key(key)
    }

    /// The number of pending keys.
    pub fn len(&self) -> usize {
        let pending = self.pending.lock();
        pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of waiters currently registered for `key`.
    pub fn waiter_count(&self, key: &CacheKey) -> usize {
        let pending = self.pending.lock();
        pending.get(key).map_or(0, Vec::len)
    }
}
