//! # Caching infrastructure
//!
//! Every resource handled by downloadkit goes through the layers in this module before the
//! network is ever touched.
//!
//! ## Cache Layers
//!
//! - An in-memory [`EntryStore`] holding the fetched payloads together with their expiration.
//!   It is bounded by a maximum entry count and a maximum aggregate byte cost, and evicts the
//!   oldest-inserted entries first once either ceiling is exceeded.
//! - An optional [`PersistentStore`] the [`EntryStore`] writes through to, and reloads from on
//!   startup and when the process is resumed. [`FsStore`] is the file-system implementation.
//! - An [`InFlightRegistry`] that is used for request coalescing (deduplicating concurrent
//!   fetches for the same key). It is deliberately separate from the [`EntryStore`], so that
//!   cache reads never contend with in-flight bookkeeping.
//!
//! A fetch request goes through the following steps:
//! - First, it looks up the in-memory layer. Expired entries are treated as absent.
//! - On miss, it registers itself as a waiter for the key. Only the first waiter starts a fetch,
//!   everyone else is notified with the result of that single fetch.
//! - The fetched payload is stored in memory, and written through to the persistent store in
//!   the background if persistence is enabled.
//!
//! ### Metrics
//!
//! - `fetch.access`: All requests.
//! - `fetch.memory.hit`: Requests served by the in-memory layer.
//! - `fetch.dedup`: Requests that joined an already running fetch.
//! - `fetch.start`: Actual fetches, not served by any of the caching layers.
//! - `store.evicted`: Entries evicted because a ceiling was exceeded.
//! - `store.entries`: A gauge of the number of in-memory entries.
//! - `store.persist`: Entries written to the persistent store, tagged by `status`.
//! - `store.reload`: Entries loaded from the persistent store.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! A [`CacheEntry`] is the unit of storage: a key, an immutable payload, an optional absolute
//! expiration time, and a `dirty` flag that tracks whether the entry still needs to be written
//! to the persistent store.
//!
//! [`CacheError`] is the error type shared by all layers. It is `Clone`, as the result of a
//! single fetch is handed to every waiter for that key. Persistence errors are logged, but never
//! surface as errors of a fetch.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is used both as the key for the in-memory layers, and to derive the path of
//! the persisted record. It holds the canonical URL string, which is SHA256-hashed to form a
//! length-bounded and path-safe file name.

mod cache_error;
mod cache_key;
mod entry;
mod inflight;
mod persist;
mod store;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use entry::{CacheEntry, ExpiryPolicy};
pub use inflight::{InFlightRegistry, WaiterId};
pub use persist::{FsStore, PersistentStore, RECORD_VERSION, decode_record, encode_record};
pub use store::{EntryStore, StoreLimits};
