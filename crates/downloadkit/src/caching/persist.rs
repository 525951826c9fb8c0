use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes};
use chrono::{TimeZone, Utc};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::{CacheContents, CacheEntry, CacheError, CacheKey};

/// The version of the persisted record format.
///
/// Records of any other version are treated as corrupt and dropped on reload.
pub const RECORD_VERSION: u8 = 1;

const RECORD_MAGIC: &[u8; 4] = b"DLKT";

/// Magic, version, expiry flag, expiry timestamp and key length.
const RECORD_HEADER_LEN: usize = 4 + 1 + 1 + 8 + 4;

/// Durable storage for [`CacheEntry`]s.
///
/// Implementations are used from blocking contexts only, and never while the in-memory store
/// is locked.
pub trait PersistentStore: Send + Sync + fmt::Debug {
    /// Loads all persisted entries.
    ///
    /// Records that cannot be decoded are dropped and must not fail the whole load. Entries are
    /// returned regardless of their expiration.
    fn load_all(&self) -> CacheContents<Vec<CacheEntry>>;

    /// Persists `entry`, replacing any previously persisted record for the same key.
    fn write(&self, entry: &CacheEntry) -> CacheContents;

    /// Removes the persisted record for `key`, if any.
    fn remove(&self, key: &CacheKey) -> CacheContents;

    /// Removes all persisted records.
    fn clear(&self) -> CacheContents;
}

/// Encodes `entry` into a self-describing record.
///
/// The layout is, with all integers in big endian:
/// `"DLKT" | version: u8 | has_expiry: u8 | expires_at_ms: i64 | key_len: u32 | key | value_len: u64 | value`
pub fn encode_record(entry: &CacheEntry) -> Vec<u8> {
    let key = entry.key.as_str().as_bytes();
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + key.len() + 8 + entry.value.len());

    buf.put_slice(RECORD_MAGIC);
    buf.put_u8(RECORD_VERSION);
    match entry.expires_at {
        Some(expires_at) => {
            buf.put_u8(1);
            buf.put_i64(expires_at.timestamp_millis());
        }
        None => {
            buf.put_u8(0);
            buf.put_i64(0);
        }
    }
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf.put_u64(entry.value.len() as u64);
    buf.put_slice(&entry.value);

    buf
}

fn corrupt(reason: &str) -> CacheError {
    CacheError::PersistenceFailed(format!("corrupt record: {reason}"))
}

/// Decodes a record written by [`encode_record`].
///
/// The decoded entry is clean, as it obviously matches its persisted form.
pub fn decode_record(data: &[u8]) -> CacheContents<CacheEntry> {
    let mut data = data
        .strip_prefix(RECORD_MAGIC.as_slice())
        .ok_or_else(|| corrupt("bad magic"))?;
    if data.remaining() < RECORD_HEADER_LEN - RECORD_MAGIC.len() {
        return Err(corrupt("truncated header"));
    }

    let version = data.get_u8();
    if version != RECORD_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }

    let has_expiry = data.get_u8();
    let expires_at_ms = data.get_i64();
    let expires_at = match has_expiry {
        0 => None,
        1 => Some(
            Utc.timestamp_millis_opt(expires_at_ms)
                .single()
                .ok_or_else(|| corrupt("invalid expiration"))?,
        ),
        _ => return Err(corrupt("invalid expiry flag")),
    };

    let key_len = data.get_u32() as usize;
    match key_len.checked_add(8) {
        Some(needed) if data.remaining() >= needed => {}
        _ => return Err(corrupt("truncated key")),
    }
    let key = std::str::from_utf8(&data[..key_len]).map_err(|_| corrupt("key is not utf-8"))?;
    let key = CacheKey::new(key);
    data.advance(key_len);

    let value_len = data.get_u64();
    if data.remaining() as u64 != value_len {
        return Err(corrupt("value length mismatch"));
    }
    let value = Bytes::copy_from_slice(data);

    Ok(CacheEntry {
        key,
        value,
        expires_at,
        dirty: false,
    })
}

/// A [`PersistentStore`] that keeps one record file per key in a directory.
///
/// Records live in `entries/`, at the path given by [`CacheKey::cache_path`]. They are written
/// to a temporary file in `tmp/` first, and then atomically moved into place.
#[derive(Debug, Clone)]
pub struct FsStore {
    entries_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl FsStore {
    /// Opens the store in `cache_dir`, creating the directory layout if needed.
    ///
    /// Leftover temporary files of a previous process are removed.
    pub fn new(cache_dir: &Path) -> CacheContents<Self> {
        let entries_dir = cache_dir.join("entries");
        let tmp_dir = cache_dir.join("tmp");

        let create = || -> io::Result<()> {
            fs::create_dir_all(&entries_dir)?;
            if tmp_dir.exists() {
                fs::remove_dir_all(&tmp_dir)?;
            }
            fs::create_dir_all(&tmp_dir)
        };
        create().map_err(|e| {
            CacheError::FolderCreationFailed(format!("{}: {e}", cache_dir.display()))
        })?;

        Ok(Self {
            entries_dir,
            tmp_dir,
        })
    }

    /// Returns the absolute path of the record for `key`.
    pub fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir
            .join(key.cache_path(u32::from(RECORD_VERSION)))
    }

    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // Another process might have cleared the directory in the meantime.
        fs::create_dir_all(&self.tmp_dir)?;
        tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)
    }
}

impl PersistentStore for FsStore {
    fn load_all(&self) -> CacheContents<Vec<CacheEntry>> {
        let mut entries = Vec::new();

        for dir_entry in WalkDir::new(&self.entries_dir) {
            let dir_entry = match dir_entry {
                Ok(dir_entry) => dir_entry,
                Err(e) => {
                    tracing::debug!(error = &e as &dyn std::error::Error, "Skipping record");
                    continue;
                }
            };
            if !dir_entry.file_type().is_file() {
                continue;
            }

            let path = dir_entry.path();
            let decoded = fs::read(path)
                .map_err(CacheError::from)
                .and_then(|data| decode_record(&data));

            match decoded {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::debug!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Dropping unreadable record",
                    );
                    if let Err(e) = remove_file(path) {
                        tracing::warn!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to remove unreadable record",
                        );
                    }
                }
            }
        }

        Ok(entries)
    }

    fn write(&self, entry: &CacheEntry) -> CacheContents {
        let path = self.record_path(&entry.key);
        tracing::trace!("Persisting `{}` at path {}", entry.key, path.display());

        let mut temp_file = self.tempfile()?;
        temp_file.write_all(&encode_record(entry))?;
        persist_tempfile(temp_file, &path)?;

        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CacheContents {
        Ok(remove_file(&self.record_path(key))?)
    }

    fn clear(&self) -> CacheContents {
        match fs::remove_dir_all(&self.entries_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.entries_dir)?;
        Ok(())
    }
}

/// Removes a file, treating an already missing file as success.
fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, record_path: &Path) -> io::Result<fs::File> {
    let parent = record_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist record"))?;

    // A concurrent `clear` could potentially remove the parent directories we are
    // operating in, so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!("Failed to create record directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(record_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!("Failed to create record file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}
