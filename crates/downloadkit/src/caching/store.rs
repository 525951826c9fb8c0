use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{CacheContents, CacheEntry, CacheKey, PersistentStore};

/// The ceilings of an [`EntryStore`]. A value of `0` means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreLimits {
    /// The maximum number of entries.
    pub max_entries: usize,
    /// The maximum aggregate [cost](CacheEntry::cost) of all entries.
    pub max_cost: u64,
}

impl StoreLimits {
    fn exceeded_by(&self, entries: usize, cost: u64) -> bool {
        (self.max_entries != 0 && entries > self.max_entries)
            || (self.max_cost != 0 && cost > self.max_cost)
    }
}

#[derive(Debug)]
struct Slot {
    /// Insertion sequence number, used for oldest-first eviction.
    seq: u64,
    entry: CacheEntry,
}

#[derive(Debug, Default)]
struct Entries {
    by_key: FxHashMap<CacheKey, Slot>,
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
    total_cost: u64,
    limits: StoreLimits,
    /// Keys whose persisted records need to be deleted by the next flush.
    ///
    /// These are queued under the same lock as the removal from memory, so that a flush never
    /// sees one without the other.
    pending_removals: FxHashSet<CacheKey>,
}

impl Entries {
    fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);

        let seq = self.next_seq;
        self.next_seq += 1;

        self.total_cost += entry.cost();
        self.order.insert(seq, entry.key.clone());
        self.by_key.insert(entry.key.clone(), Slot { seq, entry });
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.by_key.remove(key)?;
        self.order.remove(&slot.seq);
        self.total_cost -= slot.entry.cost();
        Some(slot.entry)
    }

    fn would_exceed(&self, entry: &CacheEntry) -> bool {
        self.limits
            .exceeded_by(self.by_key.len() + 1, self.total_cost + entry.cost())
    }

    /// Evicts oldest-inserted entries until the ceilings hold again, never evicting `keep`.
    fn evict(&mut self, keep: &CacheKey) -> usize {
        let mut evicted = 0;
        while self.limits.exceeded_by(self.by_key.len(), self.total_cost) {
            let oldest = self.order.values().find(|key| *key != keep).cloned();
            let Some(oldest) = oldest else {
                break;
            };
            self.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn clear(&mut self) {
        self.by_key.clear();
        self.order.clear();
        self.pending_removals.clear();
        self.total_cost = 0;
    }
}

struct StoreInner {
    entries: Mutex<Entries>,
    backend: Option<Arc<dyn PersistentStore>>,
    /// Whether entries are written through to the `backend`.
    persist: AtomicBool,
    flush_scheduled: AtomicBool,
    /// Serializes all interaction with the `backend`.
    ///
    /// Lock order: `io_lock` before `entries`.
    io_lock: Mutex<()>,
}

impl StoreInner {
    fn queue_removals(&self, entries: &mut Entries, keys: impl IntoIterator<Item = CacheKey>) {
        if self.backend.is_some() {
            entries.pending_removals.extend(keys);
        }
    }

    fn flush(&self) {
        let Some(backend) = &self.backend else {
            return;
        };
        let _io = self.io_lock.lock();
        self.flush_scheduled.store(false, Ordering::Release);

        // removals and dirty entries are taken together, so that a removal never overtakes the
        // write of an entry that was put after it
        let persist = self.persist.load(Ordering::Acquire);
        let (removals, dirty) = {
            let mut entries = self.entries.lock();
            let removals = std::mem::take(&mut entries.pending_removals);
            let dirty: Vec<_> = if persist {
                entries
                    .by_key
                    .values()
                    .filter(|slot| slot.entry.dirty)
                    .map(|slot| (slot.seq, slot.entry.clone()))
                    .collect()
            } else {
                Vec::new()
            };
            (removals, dirty)
        };

        for key in removals {
            if let Err(e) = backend.remove(&key) {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    key = %key,
                    "Failed to remove persisted entry",
                );
            }
        }

        if dirty.is_empty() {
            return;
        }

        let mut written = Vec::with_capacity(dirty.len());
        for (seq, entry) in dirty {
            match backend.write(&entry) {
                Ok(()) => {
                    metric!(counter("store.persist") += 1, "status" => "ok");
                    written.push((seq, entry.key));
                }
                Err(e) => {
                    metric!(counter("store.persist") += 1, "status" => "failure");
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        key = %entry.key,
                        "Failed to persist entry",
                    );
                }
            }
        }

        let mut entries = self.entries.lock();
        for (seq, key) in written {
            // an entry replaced in the meantime needs to be written again
            if let Some(slot) = entries.by_key.get_mut(&key) {
                if slot.seq == seq {
                    slot.entry.dirty = false;
                }
            }
        }
    }
}

/// The in-memory store of [`CacheEntry`]s, optionally written through to a
/// [`PersistentStore`].
///
/// All mutations are serialized under a single lock, which is never held while talking to the
/// persistent store. Persisting happens in the background on the blocking thread pool of the
/// current tokio runtime, or inline when there is none.
#[derive(Clone)]
pub struct EntryStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries.lock();
        f.debug_struct("EntryStore")
            .field("entries", &entries.by_key.len())
            .field("total_cost", &entries.total_cost)
            .field("limits", &entries.limits)
            .field("backend", &self.inner.backend)
            .field("persist", &self.inner.persist)
            .finish()
    }
}

impl EntryStore {
    /// Creates a new store.
    ///
    /// If `persist` is set, all entries of the `backend` are reloaded right away.
    pub fn new(
        limits: StoreLimits,
        backend: Option<Arc<dyn PersistentStore>>,
        persist: bool,
    ) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(Entries {
                    limits,
                    ..Default::default()
                }),
                backend,
                persist: AtomicBool::new(persist),
                flush_scheduled: AtomicBool::new(false),
                io_lock: Default::default(),
            }),
        };

        if persist {
            store.reload();
        }

        store
    }

    /// Creates a purely in-memory store.
    pub fn in_memory(limits: StoreLimits) -> Self {
        Self::new(limits, None, false)
    }

    /// Returns the value for `key` if a non-expired entry exists.
    ///
    /// An expired entry is removed, together with its persisted record.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.get_at(key, Utc::now())
    }

    fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Bytes> {
        {
            let mut entries = self.inner.entries.lock();
            let slot = entries.by_key.get(key)?;
            if !slot.entry.is_expired_at(now) {
                return Some(slot.entry.value.clone());
            }
            entries.remove(key);
            self.inner.queue_removals(&mut entries, [key.clone()]);
        }

        tracing::trace!("Entry `{}` expired", key);
        self.schedule_flush();
        None
    }

    /// Inserts or replaces `entry`.
    ///
    /// The entry becomes the most recently inserted one, and the oldest entries are evicted until
    /// the ceilings hold again. An entry that exceeds the cost ceiling on its own is still kept.
    pub fn put(&self, mut entry: CacheEntry) {
        let (evicted, len) = {
            let mut entries = self.inner.entries.lock();

            let unchanged = entries.by_key.get(&entry.key).is_some_and(|slot| {
                !slot.entry.dirty && slot.entry.same_contents(&entry)
            });
            entry.dirty = !unchanged;
            let key = entry.key.clone();

            entries.insert(entry);
            (entries.evict(&key), entries.by_key.len())
        };

        if evicted > 0 {
            metric!(counter("store.evicted") += evicted as i64);
        }
        metric!(gauge("store.entries") = len as u64);

        self.schedule_flush();
    }

    /// Removes the entry for `key`, together with its persisted record.
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = {
            let mut entries = self.inner.entries.lock();
            let removed = entries.remove(key);
            self.inner.queue_removals(&mut entries, [key.clone()]);
            removed
        };
        self.schedule_flush();
        removed
    }

    /// Removes all entries, and all persisted records.
    ///
    /// This talks to the persistent store on the calling thread.
    pub fn clear(&self) -> CacheContents {
        let _io = self.inner.io_lock.lock();

        self.inner.entries.lock().clear();
        metric!(gauge("store.entries") = 0u64);

        match &self.inner.backend {
            Some(backend) => backend.clear(),
            None => Ok(()),
        }
    }

    /// Removes all expired entries, and their persisted records.
    ///
    /// Returns the number of removed entries.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let purged = {
            let mut entries = self.inner.entries.lock();
            let keys: Vec<_> = entries
                .by_key
                .values()
                .filter(|slot| slot.entry.is_expired_at(now))
                .map(|slot| slot.entry.key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            let purged = keys.len();
            self.inner.queue_removals(&mut entries, keys);
            purged
        };

        if purged > 0 {
            tracing::debug!("Purged {purged} expired entries");
            self.schedule_flush();
        }
        purged
    }

    /// Changes the ceilings for subsequent insertions, without evicting anything right away.
    pub fn set_limits(&self, limits: StoreLimits) {
        self.inner.entries.lock().limits = limits;
    }

    pub fn limits(&self) -> StoreLimits {
        self.inner.entries.lock().limits
    }

    /// Turns writing through to the persistent store on or off.
    ///
    /// Entries that were put while persistence was off are written once it is turned on.
    pub fn set_persistence_enabled(&self, enabled: bool) {
        let was_enabled = self.inner.persist.swap(enabled, Ordering::AcqRel);
        if enabled && !was_enabled {
            self.schedule_flush();
        }
    }

    pub fn persistence_enabled(&self) -> bool {
        self.inner.backend.is_some() && self.inner.persist.load(Ordering::Acquire)
    }

    /// Writes all dirty entries to the persistent store, and deletes the records of removed
    /// entries, on the calling thread.
    pub fn flush(&self) {
        self.inner.flush();
    }

    fn schedule_flush(&self) {
        if self.inner.backend.is_none() {
            return;
        }
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || inner.flush());
            }
            Err(_) => inner.flush(),
        }
    }

    /// Merges all persisted entries into memory.
    ///
    /// Expired and unreadable records are deleted. An in-memory entry wins over the persisted
    /// record for the same key, and persisted entries are only merged as long as they fit the
    /// ceilings, so a reload never evicts anything.
    ///
    /// Entries removed while the reload is running are not brought back, and a concurrent
    /// [`clear`](Self::clear) takes effect either before or after the whole reload.
    ///
    /// Returns the number of merged entries.
    pub fn reload(&self) -> usize {
        self.reload_at(Utc::now())
    }

    fn reload_at(&self, now: DateTime<Utc>) -> usize {
        let Some(backend) = &self.inner.backend else {
            return 0;
        };

        let (merged, expired) = {
            // held until the merge is done, so no removal can be flushed in between
            let _io = self.inner.io_lock.lock();
            let loaded = match backend.load_all() {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        "Failed to reload persisted entries",
                    );
                    return 0;
                }
            };

            let (expired, fresh): (Vec<_>, Vec<_>) = loaded
                .into_iter()
                .partition(|entry| entry.is_expired_at(now));

            let mut entries = self.inner.entries.lock();
            let mut merged = 0;
            for entry in fresh {
                if entries.by_key.contains_key(&entry.key)
                    || entries.pending_removals.contains(&entry.key)
                    || entries.would_exceed(&entry)
                {
                    continue;
                }
                entries.insert(entry);
                merged += 1;
            }

            let expired_count = expired.len();
            self.inner
                .queue_removals(&mut entries, expired.into_iter().map(|entry| entry.key));
            (merged, expired_count)
        };

        // the flush needs the `io_lock` released
        if expired > 0 {
            tracing::debug!("Dropping {expired} expired persisted entries");
            self.schedule_flush();
        }

        metric!(counter("store.reload") += merged as i64);
        metric!(gauge("store.entries") = self.len() as u64);
        tracing::debug!("Reloaded {merged} persisted entries");

        merged
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The aggregate cost of all entries.
    pub fn total_cost(&self) -> u64 {
        self.inner.entries.lock().total_cost
    }

    /// Returns a copy of the entry for `key`, regardless of its expiration.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner
            .entries
            .lock()
            .by_key
            .get(key)
            .map(|slot| slot.entry.clone())
    }
}
