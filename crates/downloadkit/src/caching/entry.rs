use bytes::Bytes;
use chrono::{DateTime, Days, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::CacheKey;

/// The expiration policy applied to freshly fetched entries.
///
/// The policy is evaluated once, when the entry is created, and yields an absolute expiration
/// time. Calendar based policies are evaluated in the local time zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Entries never expire.
    Never,
    /// Entries expire at the last second of the current calendar day.
    EndOfDay,
    /// Entries expire 7 days after they have been created.
    #[default]
    Weekly,
    /// Entries expire 30 days after they have been created.
    Monthly,
    /// Entries expire the given number of seconds after they have been created.
    Seconds(u64),
}

impl ExpiryPolicy {
    /// Gives the expiration time of an entry created right now.
    ///
    /// `None` means the entry never expires.
    pub fn expires_at(self) -> Option<DateTime<Utc>> {
        self.expires_at_from(Local::now())
    }

    /// Gives the expiration time of an entry created at `now`.
    pub fn expires_at_from<Tz: TimeZone>(self, now: DateTime<Tz>) -> Option<DateTime<Utc>> {
        let expires_at = match self {
            ExpiryPolicy::Never => return None,
            ExpiryPolicy::EndOfDay => now
                .date_naive()
                .and_hms_opt(23, 59, 59)
                .and_then(|end| end.and_local_timezone(now.timezone()).earliest()),
            ExpiryPolicy::Weekly => now.clone().checked_add_days(Days::new(7)),
            ExpiryPolicy::Monthly => now.clone().checked_add_days(Days::new(30)),
            ExpiryPolicy::Seconds(seconds) => {
                // durations chrono cannot represent are as good as never expiring
                let delta = chrono::Duration::from_std(std::time::Duration::from_secs(seconds));
                return delta
                    .ok()
                    .and_then(|delta| now.with_timezone(&Utc).checked_add_signed(delta));
            }
        };

        // fall back to expiring immediately if the calendar computation is impossible
        Some(expires_at.unwrap_or(now).with_timezone(&Utc))
    }
}

/// A single cached resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub(super) key: CacheKey,
    pub(super) value: Bytes,
    pub(super) expires_at: Option<DateTime<Utc>>,
    /// Whether this entry was created or updated since it was last persisted.
    pub(super) dirty: bool,
}

impl CacheEntry {
    /// Creates a new entry, which is considered dirty until it has been persisted.
    pub fn new(key: CacheKey, value: Bytes, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            value,
            expires_at,
            dirty: true,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The "cost" of keeping this entry in memory.
    pub fn cost(&self) -> u64 {
        self.value.len() as u64
    }

    /// Whether this entry is logically absent at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether `other` carries the same payload and expiration as this entry.
    pub(super) fn same_contents(&self, other: &CacheEntry) -> bool {
        self.value == other.value && self.expires_at == other.expires_at
    }
}
