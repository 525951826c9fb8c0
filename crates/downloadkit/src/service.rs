//! The fetch engine.
//!
//! A [`FetchCoordinator`] serves every request from the [`EntryStore`] if it can. Otherwise the
//! request is registered as a waiter with the [`InFlightRegistry`], and only the first waiter
//! for a key spawns an actual fetch. The result of that fetch is handed out to all waiters in
//! the order they registered in.
//!
//! ```text
//! request -> cache check -> hit: done
//!                        -> miss: register waiter -> first: spawn fetch -> put -> notify all
//!                                                 -> not first: wait for the running fetch
//! ```
//!
//! Cancelling a request only withdraws its own waiter. The fetch keeps running, and still
//! populates the cache for everyone else.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caching::{
    CacheContents, CacheEntry, CacheError, CacheKey, EntryStore, ExpiryPolicy, FsStore,
    InFlightRegistry, PersistentStore, WaiterId,
};
use crate::config::{Config, FetchSettings};
use crate::download::Fetcher;
use crate::utils::defer::defer;

type Waiter = Box<dyn FnOnce(CacheContents<Bytes>) + Send>;

/// Per-request options of a fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Bypasses the cache check, and always fetches the resource anew.
    ///
    /// A fetch that is already running for the same key is joined nevertheless.
    pub force_refresh: bool,

    /// Overrides the configured [`ExpiryPolicy`] for the fetched entry.
    ///
    /// When the request joins a running fetch, the expiration requested by whoever started that
    /// fetch is used.
    pub expires_at: Option<DateTime<Utc>>,

    /// Cancels the request once triggered.
    ///
    /// This is only honored by [`FetchCoordinator::fetch`]. Callback based requests are
    /// cancelled through their [`CancelHandle`].
    pub cancel: Option<CancellationToken>,
}

/// The parts of [`FetchSettings`] that are read by every fetch.
#[derive(Debug)]
struct FetchLimits {
    semaphore: Arc<Semaphore>,
    fetch_timeout: Duration,
    expiry: ExpiryPolicy,
}

impl FetchLimits {
    fn new(settings: &FetchSettings) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1))),
            fetch_timeout: settings.fetch_timeout,
            expiry: settings.expiry,
        }
    }
}

struct Inner {
    store: EntryStore,
    inflight: InFlightRegistry<Waiter>,
    fetcher: Arc<dyn Fetcher>,
    limits: RwLock<FetchLimits>,
}

impl Inner {
    async fn run_fetch(
        &self,
        url: &Url,
        key: &CacheKey,
        options: &FetchOptions,
    ) -> CacheContents<Bytes> {
        // another fetch might have completed right before this one was registered
        if !options.force_refresh {
            if let Some(value) = self.store.get(key) {
                return Ok(value);
            }
        }

        let (semaphore, fetch_timeout, expiry) = {
            let limits = self.limits.read();
            (
                Arc::clone(&limits.semaphore),
                limits.fetch_timeout,
                limits.expiry,
            )
        };
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(CacheError::from_std_error)?;

        metric!(counter("fetch.start") += 1);
        tracing::trace!("Fetching `{}`", url);

        let result = match tokio::time::timeout(fetch_timeout, self.fetcher.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(fetch_timeout)),
        };
        let value = result.and_then(|value| {
            self.fetcher.validate(url, &value)?;
            Ok(value)
        });

        match &value {
            Ok(value) => {
                metric!(counter("fetch.success") += 1);
                let expires_at = options.expires_at.or_else(|| expiry.expires_at());
                self.store
                    .put(CacheEntry::new(key.clone(), value.clone(), expires_at));
            }
            Err(e) => {
                metric!(counter("fetch.failure") += 1, "reason" => e.metrics_tag());
                tracing::debug!(
                    error = e as &dyn std::error::Error,
                    "Failed to fetch `{}`",
                    url
                );
            }
        }

        value
    }

    /// Hands `result` to every waiter of `key`, in registration order.
    fn complete(&self, key: &CacheKey, result: CacheContents<Bytes>) {
        let waiters = self.inflight.drain_and_clear(key);
        tracing::trace!("Notifying {} waiters of `{}`", waiters.len(), key);
        for waiter in waiters {
            waiter(result.clone());
        }
    }
}

/// Withdraws a request made through [`FetchCoordinator::fetch_with_callback`].
#[derive(Clone, Debug)]
pub struct CancelHandle {
    inner: Weak<Inner>,
    key: CacheKey,
    id: WaiterId,
}

impl CancelHandle {
    /// Cancels the request.
    ///
    /// If the request was still waiting, its callback is invoked right away with
    /// [`CacheError::Cancelled`], and `true` is returned. The fetch itself is not affected.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        match inner.inflight.remove_waiter(&self.key, self.id) {
            Some(waiter) => {
                metric!(counter("fetch.cancelled") += 1);
                waiter(Err(CacheError::Cancelled));
                true
            }
            None => false,
        }
    }
}

/// Fetches resources, deduplicating concurrent requests and caching the results.
///
/// This is cheap to clone, all clones share the same caches.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("store", &self.inner.store)
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

impl FetchCoordinator {
    pub fn new(store: EntryStore, fetcher: Arc<dyn Fetcher>, settings: &FetchSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                inflight: InFlightRegistry::new(),
                fetcher,
                limits: RwLock::new(FetchLimits::new(settings)),
            }),
        }
    }

    /// Creates a coordinator according to `config`.
    ///
    /// When a `cache_dir` is configured, entries are persisted in it, and everything persisted
    /// by a previous session is reloaded right away. If the directory cannot be created, the
    /// coordinator runs without persistence.
    ///
    /// The periodic sweep is only started when this is called within a tokio runtime.
    pub fn from_config(config: &Config, fetcher: Arc<dyn Fetcher>) -> Self {
        let backend = config.cache_dir.as_deref().and_then(|cache_dir| {
            match FsStore::new(cache_dir) {
                Ok(backend) => Some(Arc::new(backend) as Arc<dyn PersistentStore>),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Running without persistence",
                    );
                    None
                }
            }
        });

        let store = EntryStore::new(config.fetch.limits(), backend, config.fetch.persist_to_disk);
        let coordinator = Self::new(store, fetcher, &config.fetch);

        if let Some(interval) = config.sweep_interval {
            coordinator.spawn_sweeper(interval);
        }

        coordinator
    }

    /// Periodically purges expired entries for as long as the coordinator is alive.
    fn spawn_sweeper(&self, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, expired entries will not be swept");
            return;
        };

        let inner = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut interval = tokio::time::interval(interval);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.store.purge_expired();
            }
        });
    }

    /// Fetches the resource at `url`.
    ///
    /// A cached, non-expired value is returned right away. Otherwise this joins the fetch that
    /// is already running for `url`, or starts a new one.
    ///
    /// Dropping the returned future, or triggering [`FetchOptions::cancel`], withdraws this
    /// request without affecting the fetch. A cancelled request resolves to
    /// [`CacheError::Cancelled`].
    ///
    /// Fetches are spawned onto the current tokio runtime. Outside of one, a request that is
    /// not served from the cache fails with [`CacheError::InternalError`].
    pub async fn fetch(&self, url: &Url, options: FetchOptions) -> CacheContents<Bytes> {
        let key = CacheKey::from_url(url);
        if let Some(value) = self.cache_check(&key, &options) {
            return Ok(value);
        }

        let cancel = options.cancel.clone();
        if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            return Err(CacheError::Cancelled);
        }

        let (sender, receiver) = oneshot::channel();
        let waiter: Waiter = Box::new(move |result| {
            sender.send(result).ok();
        });
        let id = self.enqueue(url, key.clone(), options, waiter);

        let inner = Arc::clone(&self.inner);
        let withdraw = defer(move || {
            if inner.inflight.remove_waiter(&key, id).is_some() {
                metric!(counter("fetch.cancelled") += 1);
            }
        });

        let received = match cancel {
            Some(token) => tokio::select! {
                biased;
                received = receiver => Some(received),
                _ = token.cancelled() => None,
            },
            None => Some(receiver.await),
        };

        let Some(received) = received else {
            return Err(CacheError::Cancelled);
        };
        withdraw.disarm();

        received.unwrap_or(Err(CacheError::InternalError))
    }

    /// Fetches the resource at `url`, invoking `callback` with the result.
    ///
    /// A cached value is handed to `callback` before this returns, in which case there is
    /// nothing to cancel and `None` is returned. Otherwise `callback` is invoked on the task
    /// completing the fetch, after the callbacks of all earlier requests for the same key.
    ///
    /// Outside of a tokio runtime, a fetch cannot be started, and `callback` is invoked with
    /// [`CacheError::InternalError`] right away.
    pub fn fetch_with_callback<F>(
        &self,
        url: &Url,
        options: FetchOptions,
        callback: F,
    ) -> Option<CancelHandle>
    where
        F: FnOnce(CacheContents<Bytes>) + Send + 'static,
    {
        let key = CacheKey::from_url(url);
        if let Some(value) = self.cache_check(&key, &options) {
            callback(Ok(value));
            return None;
        }

        let id = self.enqueue(url, key.clone(), options, Box::new(callback));
        Some(CancelHandle {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
        })
    }

    fn cache_check(&self, key: &CacheKey, options: &FetchOptions) -> Option<Bytes> {
        metric!(counter("fetch.access") += 1);
        if options.force_refresh {
            return None;
        }

        let value = self.inner.store.get(key)?;
        metric!(counter("fetch.memory.hit") += 1);
        Some(value)
    }

    fn enqueue(
        &self,
        url: &Url,
        key: CacheKey,
        options: FetchOptions,
        waiter: Waiter,
    ) -> WaiterId {
        let (id, is_first) = self.inner.inflight.register_waiter(&key, waiter);
        if is_first {
            self.spawn_fetch(url.clone(), key, options);
        } else {
            metric!(counter("fetch.dedup") += 1);
        }
        id
    }

    /// Spawns the fetch for `key` as a separate task.
    ///
    /// NOTE: The task is spawned eagerly, and completes even if none of its waiters are
    /// interested in the result anymore.
    fn spawn_fetch(&self, url: Url, key: CacheKey, options: FetchOptions) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No runtime available to fetch `{}`", url);
            self.inner.complete(&key, Err(CacheError::InternalError));
            return;
        };
        let inner = Arc::clone(&self.inner);

        let fetch = async move {
            // the waiters must never be left hanging, even if the fetch panics
            let fail_waiters = {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                defer(move || inner.complete(&key, Err(CacheError::InternalError)))
            };

            let result = inner.run_fetch(&url, &key, &options).await;
            fail_waiters.disarm();
            inner.complete(&key, result);
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        runtime.spawn(fetch);
    }

    /// Applies new settings to all subsequent fetches.
    ///
    /// Cached entries stay valid, and no entry is evicted until the next insertion. Fetches
    /// already holding a slot of the previous concurrency limit finish unaffected.
    pub fn configure(&self, settings: &FetchSettings) {
        self.inner.store.set_limits(settings.limits());
        self.inner
            .store
            .set_persistence_enabled(settings.persist_to_disk);

        *self.inner.limits.write() = FetchLimits::new(settings);
    }

    /// Removes all cached entries, including persisted ones, and clears the protocol cache of
    /// the [`Fetcher`].
    ///
    /// Fetches that are running concurrently still populate the cache once they complete.
    pub fn clear_cache(&self) -> CacheContents {
        let result = self.inner.store.clear();
        self.inner.fetcher.clear_protocol_cache();
        result
    }

    /// Signals that the process resumed from the background.
    ///
    /// This reloads persisted entries into memory, and returns how many were merged.
    pub fn resumed(&self) -> usize {
        self.inner.store.reload()
    }

    /// Looks up `url` in the cache without ever fetching it.
    pub fn cached(&self, url: &Url) -> Option<Bytes> {
        self.inner.store.get(&CacheKey::from_url(url))
    }

    pub fn store(&self) -> &EntryStore {
        &self.inner.store
    }

    /// Whether a fetch for `url` is currently running.
    pub fn is_pending(&self, url: &Url) -> bool {
        self.inner.inflight.is_pending(&CacheKey::from_url(url))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::future::{join_all, BoxFuture};
    use futures::FutureExt;

    use crate::caching::StoreLimits;
    use crate::HttpFetcher;
    use downloadkit_test as test;

    use super::*;

    /// A [`Fetcher`] that responds with `<url>#<number of call>` after a delay.
    #[derive(Debug, Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        fail: Option<CacheError>,
        reject: bool,
        cleared: AtomicBool,
    }

    impl CountingFetcher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for CountingFetcher {
        fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Bytes>> {
            async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(running, Ordering::SeqCst);

                tokio::time::sleep(self.delay).await;

                self.running.fetch_sub(1, Ordering::SeqCst);
                match &self.fail {
                    Some(e) => Err(e.clone()),
                    None => Ok(Bytes::from(format!("{url}#{call}"))),
                }
            }
            .boxed()
        }

        fn validate(&self, _url: &Url, _data: &[u8]) -> CacheContents {
            if self.reject {
                return Err(CacheError::DecodeFailed("not an image".into()));
            }
            Ok(())
        }

        fn clear_protocol_cache(&self) {
            self.cleared.store(true, Ordering::SeqCst);
        }
    }

    /// A [`PersistentStore`] that fails every operation.
    #[derive(Debug)]
    struct BrokenStore;

    impl PersistentStore for BrokenStore {
        fn load_all(&self) -> CacheContents<Vec<CacheEntry>> {
            Err(CacheError::PersistenceFailed("unavailable".into()))
        }

        fn write(&self, _entry: &CacheEntry) -> CacheContents {
            Err(CacheError::PersistenceFailed("read-only file system".into()))
        }

        fn remove(&self, _key: &CacheKey) -> CacheContents {
            Err(CacheError::PersistenceFailed("read-only file system".into()))
        }

        fn clear(&self) -> CacheContents {
            Err(CacheError::PersistenceFailed("read-only file system".into()))
        }
    }

    fn url(path: &str) -> Url {
        Url::parse("https://example.com/").unwrap().join(path).unwrap()
    }

    fn coordinator(fetcher: Arc<CountingFetcher>) -> FetchCoordinator {
        let settings = FetchSettings::default();
        let store = EntryStore::in_memory(settings.limits());
        FetchCoordinator::new(store, fetcher, &settings)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_requests_are_deduplicated() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let requests = (0..10).map(|_| {
            let coordinator = coordinator.clone();
            let url = url.clone();
            tokio::spawn(async move { coordinator.fetch(&url, Default::default()).await })
        });
        let results = join_all(requests).await;

        assert_eq!(fetcher.calls(), 1);
        for result in results {
            let value = result.unwrap().unwrap();
            assert_eq!(value.as_ref(), b"https://example.com/image.png#1");
        }
        assert!(!coordinator.is_pending(&url));
        assert_eq!(coordinator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        assert!(coordinator.cached(&url).is_none());
        let first = coordinator.fetch(&url, Default::default()).await.unwrap();
        let second = coordinator.fetch(&url, Default::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.cached(&url), Some(first));
        assert_eq!(coordinator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let options = FetchOptions {
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..Default::default()
        };
        let first = coordinator.fetch(&url, options).await.unwrap();
        assert!(coordinator.cached(&url).is_none());

        let second = coordinator.fetch(&url, Default::default()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(coordinator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        coordinator.fetch(&url, Default::default()).await.unwrap();
        let options = FetchOptions {
            force_refresh: true,
            ..Default::default()
        };
        let refreshed = coordinator.fetch(&url, options).await.unwrap();

        assert_eq!(refreshed.as_ref(), b"https://example.com/image.png#2");
        assert_eq!(coordinator.cached(&url), Some(refreshed));
    }

    #[tokio::test]
    async fn test_failures_are_shared_and_not_cached() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher {
            delay: Duration::from_millis(20),
            fail: Some(CacheError::FetchFailed("connection reset".into())),
            ..Default::default()
        });
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let requests = (0..3).map(|_| coordinator.fetch(&url, Default::default()));
        let results = join_all(requests).await;

        assert_eq!(fetcher.calls(), 1);
        for result in results {
            assert_eq!(
                result,
                Err(CacheError::FetchFailed("connection reset".into()))
            );
        }
        assert!(coordinator.cached(&url).is_none());

        // there is no negative caching
        coordinator.fetch(&url, Default::default()).await.unwrap_err();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_payloads_are_not_cached() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher {
            reject: true,
            ..Default::default()
        });
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let result = coordinator.fetch(&url, Default::default()).await;
        assert_eq!(
            result,
            Err(CacheError::DecodeFailed("not an image".into()))
        );
        assert!(coordinator.store().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(500)));
        let settings = FetchSettings {
            fetch_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let coordinator = FetchCoordinator::new(
            EntryStore::in_memory(settings.limits()),
            fetcher,
            &settings,
        );

        let result = coordinator.fetch(&url("slow.png"), Default::default()).await;
        assert_eq!(result, Err(CacheError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_waiters_are_notified_in_order() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(20)));
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            let handle = coordinator.fetch_with_callback(&url, Default::default(), move |result| {
                assert!(result.is_ok());
                order.lock().unwrap().push(i);
            });
            assert!(handle.is_some());
        }

        // registered last, so every callback has run once this resolves
        coordinator.fetch(&url, Default::default()).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(fetcher.calls(), 1);

        // cache hits are delivered right away
        let hit = Arc::new(AtomicBool::new(false));
        let handle = coordinator.fetch_with_callback(&url, Default::default(), {
            let hit = Arc::clone(&hit);
            move |result| hit.store(result.is_ok(), Ordering::SeqCst)
        });
        assert!(handle.is_none());
        assert!(hit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellation_does_not_abort_the_fetch() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let token = CancellationToken::new();
        let cancelled = tokio::spawn({
            let coordinator = coordinator.clone();
            let url = url.clone();
            let options = FetchOptions {
                cancel: Some(token.clone()),
                ..Default::default()
            };
            async move { coordinator.fetch(&url, options).await }
        });
        let waiting = tokio::spawn({
            let coordinator = coordinator.clone();
            let url = url.clone();
            async move { coordinator.fetch(&url, Default::default()).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_eq!(cancelled.await.unwrap(), Err(CacheError::Cancelled));
        let value = waiting.await.unwrap().unwrap();
        assert_eq!(value.as_ref(), b"https://example.com/image.png#1");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_populates_the_cache() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(20)));
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let result = tokio::time::timeout(
            Duration::from_millis(5),
            coordinator.fetch(&url, Default::default()),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!coordinator.is_pending(&url));
        assert!(coordinator.cached(&url).is_some());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(20)));
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let (sender, receiver) = oneshot::channel();
        let handle = coordinator
            .fetch_with_callback(&url, Default::default(), move |result| {
                sender.send(result).ok();
            })
            .unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(receiver.await.unwrap(), Err(CacheError::Cancelled));

        // a request arriving later still joins the running fetch
        coordinator.fetch(&url, Default::default()).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failures_never_fail_a_fetch() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::default());
        let settings = FetchSettings::default();
        let store = EntryStore::new(settings.limits(), Some(Arc::new(BrokenStore)), true);
        let coordinator = FetchCoordinator::new(store, fetcher.clone(), &settings);
        let url = url("image.png");

        let value = coordinator.fetch(&url, Default::default()).await.unwrap();
        coordinator.store().flush();

        assert_eq!(coordinator.cached(&url), Some(value));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_configure() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(20)));
        let coordinator = coordinator(fetcher.clone());

        for name in ["a", "b", "c"] {
            coordinator.fetch(&url(name), Default::default()).await.unwrap();
        }

        coordinator.configure(&FetchSettings {
            max_entries: 2,
            max_concurrent_fetches: 1,
            ..Default::default()
        });
        // nothing is evicted until the next insertion
        assert_eq!(coordinator.store().len(), 3);
        assert_eq!(
            coordinator.store().limits(),
            StoreLimits {
                max_entries: 2,
                max_cost: FetchSettings::default().max_cost,
            }
        );

        let urls = [url("d"), url("e")];
        let requests = urls
            .iter()
            .map(|url| coordinator.fetch(url, Default::default()));
        for result in join_all(requests).await {
            result.unwrap();
        }

        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().len(), 2);
        assert!(coordinator.cached(&url("a")).is_none());
        assert!(coordinator.cached(&url("e")).is_some());
    }

    #[tokio::test]
    async fn test_clear_cache() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        coordinator.fetch(&url, Default::default()).await.unwrap();
        coordinator.clear_cache().unwrap();

        assert!(coordinator.store().is_empty());
        assert!(fetcher.cleared.load(Ordering::SeqCst));

        coordinator.fetch(&url, Default::default()).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_persisted_entries_survive_restarts() {
        test::setup();
        let cache_dir = test::tempdir();
        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            fetch: FetchSettings {
                persist_to_disk: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let url = url("image.png");

        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = FetchCoordinator::from_config(&config, fetcher.clone());
        let value = coordinator.fetch(&url, Default::default()).await.unwrap();
        coordinator.store().flush();

        let restarted = FetchCoordinator::from_config(&config, fetcher.clone());
        assert_eq!(restarted.cached(&url), Some(value.clone()));
        assert_eq!(restarted.fetch(&url, Default::default()).await, Ok(value));
        assert_eq!(fetcher.calls(), 1);

        // a session that is resumed picks up what others persisted meanwhile
        let other = url.join("other.png").unwrap();
        coordinator.fetch(&other, Default::default()).await.unwrap();
        coordinator.store().flush();

        assert!(restarted.cached(&other).is_none());
        assert_eq!(restarted.resumed(), 1);
        assert!(restarted.cached(&other).is_some());
    }

    #[tokio::test]
    async fn test_unusable_cache_dir() {
        test::setup();
        let cache_dir = test::tempdir();
        let blocker = cache_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let config = Config {
            cache_dir: Some(blocker),
            fetch: FetchSettings {
                persist_to_disk: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = FetchCoordinator::from_config(&config, fetcher);

        assert!(!coordinator.store().persistence_enabled());
        coordinator
            .fetch(&url("image.png"), Default::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper() {
        test::setup();
        let config = Config {
            sweep_interval: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = FetchCoordinator::from_config(&config, fetcher);

        let options = FetchOptions {
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..Default::default()
        };
        coordinator.fetch(&url("image.png"), options).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.store().is_empty());
    }

    #[tokio::test]
    async fn test_http_fetches_are_deduplicated() {
        test::setup();
        let server = test::HitCounter::new();
        let fetcher = HttpFetcher::from_config(&Config::default()).unwrap();
        let coordinator = FetchCoordinator::from_config(&Config::default(), Arc::new(fetcher));
        let url = server.url("delay/50/payload");

        let requests = (0..5).map(|_| coordinator.fetch(&url, Default::default()));
        for result in join_all(requests).await {
            assert_eq!(result.unwrap().as_ref(), b"payload");
        }

        assert_eq!(server.accesses(), 1);
    }

    #[::core::prelude::v1::test]
    fn test_fetch_without_runtime() {
        test::setup();
        let fetcher = Arc::new(CountingFetcher::default());
        let coordinator = coordinator(fetcher.clone());
        let url = url("image.png");

        let result = futures::executor::block_on(coordinator.fetch(&url, Default::default()));
        assert_eq!(result, Err(CacheError::InternalError));
        assert!(!coordinator.is_pending(&url));

        let (sender, receiver) = std::sync::mpsc::channel();
        let handle = coordinator.fetch_with_callback(&url, Default::default(), move |result| {
            sender.send(result).unwrap();
        });
        assert_eq!(receiver.try_recv().unwrap(), Err(CacheError::InternalError));
        assert!(!handle.unwrap().cancel());

        assert_eq!(fetcher.calls(), 0);
    }
}
