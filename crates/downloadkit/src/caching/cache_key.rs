use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The key of a cached resource.
///
/// Two keys are equal if they were created from the same canonical URL string.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    key: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] from an already canonical key string.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        let key = key.into();
        let mut hash = [0; 32];
        hash.copy_from_slice(&Sha256::digest(key.as_bytes()));
        Self { key, hash }
    }

    /// Creates the [`CacheKey`] for the given [`Url`].
    ///
    /// [`Url`] normalizes scheme and host casing as well as percent-encoding, so different
    /// spellings of the same resource map to the same key.
    pub fn from_url(url: &Url) -> Self {
        Self::new(url.as_str())
    }

    /// Returns the canonical key string.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the relative path of the persisted record for this key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        format!(
            "v{version}/{:02x}/{}/{}",
            self.hash[0],
            hex::encode(&self.hash[1..4]),
            hex::encode(&self.hash[4..]),
        )
    }
}
