//! A request-deduplicating, expiring fetch-and-cache engine.
//!
//! The [`FetchCoordinator`](service::FetchCoordinator) is the entry point. It looks resources up
//! in the in-memory [`EntryStore`](caching::EntryStore), collapses concurrent requests for the
//! same key into a single in-flight fetch via the [`InFlightRegistry`](caching::InFlightRegistry),
//! and delegates the actual retrieval to a [`Fetcher`](download::Fetcher).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod service;
mod utils;

pub use caching::{CacheContents, CacheEntry, CacheError, CacheKey, ExpiryPolicy};
pub use config::{Config, FetchSettings};
pub use download::{Fetcher, HttpFetcher};
pub use service::{CancelHandle, FetchCoordinator, FetchOptions};
