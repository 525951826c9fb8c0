//! Retrieval of resources from their origin.
//!
//! The engine only ever talks to the [`Fetcher`] trait. [`HttpFetcher`] is the implementation
//! used in production, performing plain `GET` requests through a shared [`reqwest::Client`].

use std::error::Error;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::Config;

impl CacheError {
    /// Creates a [`CacheError::FetchFailed`] from the innermost cause of `error`.
    pub fn fetch_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::FetchFailed(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::fetch_error(&error)
    }
}

/// Retrieves the raw bytes of a resource.
///
/// Redirects, authentication and retries are entirely up to the implementation.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetches the resource at `url`.
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Bytes>>;

    /// Checks whether the fetched `data` is usable.
    ///
    /// Data rejected with an error, typically [`CacheError::DecodeFailed`], is reported to all
    /// waiters and never cached.
    fn validate(&self, url: &Url, data: &[u8]) -> CacheContents {
        let _ = (url, data);
        Ok(())
    }

    /// Drops any caches the fetcher keeps on its own, like an HTTP cache.
    ///
    /// This is called whenever the cache of the engine is cleared.
    fn clear_protocol_cache(&self) {}
}

/// A [`Fetcher`] that downloads resources via HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Creates a fetcher with a client configured according to `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self::new(client))
    }

    async fn fetch_inner(&self, url: &Url) -> CacheContents<Bytes> {
        tracing::debug!("Fetching `{}`", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if !status.is_success() {
            tracing::debug!("Unexpected status code from `{}`: {}", url, status);
            return Err(CacheError::FetchFailed(status.to_string()));
        }

        let body = response.bytes().await?;
        metric!(time_raw("fetch.size") = body.len() as u64);

        Ok(body)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Bytes>> {
        self.fetch_inner(url).boxed()
    }
}
