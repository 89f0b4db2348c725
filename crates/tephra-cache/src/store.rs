//! Cache Stores
//!
//! A store is a key -> record blob backend. Concurrent stores of the
//! same key race harmlessly: a store is idempotent because identical
//! keys imply identical bytes under deterministic settings, so no
//! cross-build locking exists beyond per-key write atomicity.
//!
//! A record that fails post-load hash validation is reported as a miss
//! and the key is flagged, which forces the next store to overwrite the
//! corrupt entry regardless of the existing-entry policy.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::key::CacheKey;
use crate::policy::{BuildCachePolicy, CachePolicy};
use crate::record::CacheRecord;

/// Cache backend errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache record serialization failed: {0}")]
    Serialization(String),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Key -> record blob store
pub trait CacheStore: Send + Sync {
    /// Fetch a record. Values whose effective policy carries `SKIP_DATA`
    /// come back existence-only. Corrupt records are a miss.
    fn get(&self, key: &CacheKey, policy: &BuildCachePolicy) -> CacheResult<Option<CacheRecord>>;

    /// Store a record. When `overwrite` is false an existing entry is
    /// left untouched, unless the key was flagged corrupt by a previous
    /// `get`.
    fn put(&self, key: &CacheKey, record: &CacheRecord, overwrite: bool) -> CacheResult<()>;

    /// Existence check without touching payload data
    fn contains(&self, key: &CacheKey) -> bool;
}

/// Apply skip-data stripping and validation shared by the backends.
/// Returns `None` (miss) for a corrupt record.
fn filter_record(record: &CacheRecord, policy: &BuildCachePolicy) -> Option<CacheRecord> {
    if !record.validate() {
        return None;
    }
    let mut out = CacheRecord::new();
    for (id, value) in record.iter() {
        if policy.policy_for(id).contains(CachePolicy::SKIP_DATA) {
            out.insert(*id, value.without_data());
        } else {
            out.insert(*id, value.clone());
        }
    }
    Some(out)
}

/// In-memory store, used for tests and in-process sharing
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<ahash::AHashMap<CacheKey, CacheRecord>>,
    corrupt: Mutex<AHashSet<CacheKey>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Test hook: corrupt one stored value's payload in place
    pub fn tamper(&self, key: &CacheKey, id: &crate::record::ValueId) -> bool {
        let mut entries = self.entries.write();
        let Some(record) = entries.get_mut(key) else {
            return false;
        };
        let Some(value) = record.get(id).cloned() else {
            return false;
        };
        let mut bad = value;
        if let Some(data) = bad.data.as_mut() {
            if data.is_empty() {
                data.push(0xFF);
            } else {
                data[0] ^= 0xFF;
            }
        }
        record.insert(*id, bad);
        true
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &CacheKey, policy: &BuildCachePolicy) -> CacheResult<Option<CacheRecord>> {
        let entries = self.entries.read();
        let Some(record) = entries.get(key) else {
            return Ok(None);
        };
        match filter_record(record, policy) {
            Some(filtered) => Ok(Some(filtered)),
            None => {
                log::warn!("cache record {key} failed validation, treating as miss");
                self.corrupt.lock().insert(*key);
                Ok(None)
            }
        }
    }

    fn put(&self, key: &CacheKey, record: &CacheRecord, overwrite: bool) -> CacheResult<()> {
        let was_corrupt = self.corrupt.lock().remove(key);
        let mut entries = self.entries.write();
        if !overwrite && !was_corrupt && entries.contains_key(key) {
            return Ok(());
        }
        entries.insert(*key, record.clone());
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }
}

/// Filesystem store: one file per key under a cache directory
pub struct FileCacheStore {
    root: PathBuf,
    corrupt: Mutex<AHashSet<CacheKey>>,
}

impl FileCacheStore {
    pub fn new(root: impl AsRef<Path>) -> CacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            corrupt: Mutex::new(AHashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.tdd"))
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &CacheKey, policy: &BuildCachePolicy) -> CacheResult<Option<CacheRecord>> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CacheRecord = match bincode::deserialize(&bytes) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("cache entry {key} is unreadable ({e}), treating as miss");
                self.corrupt.lock().insert(*key);
                return Ok(None);
            }
        };

        match filter_record(&record, policy) {
            Some(filtered) => Ok(Some(filtered)),
            None => {
                log::warn!("cache entry {key} failed validation, treating as miss");
                self.corrupt.lock().insert(*key);
                Ok(None)
            }
        }
    }

    fn put(&self, key: &CacheKey, record: &CacheRecord, overwrite: bool) -> CacheResult<()> {
        let path = self.entry_path(key);
        let was_corrupt = self.corrupt.lock().remove(key);
        if !overwrite && !was_corrupt && path.exists() {
            return Ok(());
        }

        let bytes =
            bincode::serialize(record).map_err(|e| CacheError::Serialization(e.to_string()))?;

        // Write-then-rename keeps concurrent readers of the same key away
        // from partially written entries.
        let tmp = self.root.join(format!("{key}.tmp"));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.entry_path(key).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ValueId;

    fn sample_record() -> CacheRecord {
        let mut record = CacheRecord::new();
        record.insert_data(ValueId::Description, vec![1, 2, 3]);
        record.insert_data(ValueId::Mip(0), vec![7; 256]);
        record.insert_data(ValueId::MipTail, vec![9; 32]);
        record
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryCacheStore::new();
        let key = CacheKey::namespaced("TEXTURE", b"abc");
        let record = sample_record();

        store.put(&key, &record, false).unwrap();
        let loaded = store
            .get(&key, &BuildCachePolicy::new(CachePolicy::DEFAULT))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_skip_data_strips_streaming_mips() {
        let store = MemoryCacheStore::new();
        let key = CacheKey::namespaced("TEXTURE", b"abc");
        store.put(&key, &sample_record(), false).unwrap();

        let policy = BuildCachePolicy::new(CachePolicy::DEFAULT | CachePolicy::SKIP_DATA)
            .with_value_policy(ValueId::Description, CachePolicy::DEFAULT)
            .with_value_policy(ValueId::MipTail, CachePolicy::DEFAULT);

        let loaded = store.get(&key, &policy).unwrap().unwrap();
        assert!(loaded.data(&ValueId::Description).is_some());
        assert!(loaded.data(&ValueId::MipTail).is_some());
        assert!(loaded.data(&ValueId::Mip(0)).is_none());
        // Existence and hash still present
        assert!(loaded.contains(&ValueId::Mip(0)));
    }

    #[test]
    fn test_put_does_not_overwrite_by_default() {
        let store = MemoryCacheStore::new();
        let key = CacheKey::namespaced("TEXTURE", b"abc");
        store.put(&key, &sample_record(), false).unwrap();

        let mut other = CacheRecord::new();
        other.insert_data(ValueId::Description, vec![42]);
        store.put(&key, &other, false).unwrap();

        let loaded = store
            .get(&key, &BuildCachePolicy::new(CachePolicy::DEFAULT))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data(&ValueId::Description).unwrap(), &[1, 2, 3]);

        store.put(&key, &other, true).unwrap();
        let loaded = store
            .get(&key, &BuildCachePolicy::new(CachePolicy::DEFAULT))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data(&ValueId::Description).unwrap(), &[42]);
    }

    #[test]
    fn test_corruption_is_a_miss_and_forces_next_store() {
        let store = MemoryCacheStore::new();
        let key = CacheKey::namespaced("TEXTURE", b"abc");
        store.put(&key, &sample_record(), false).unwrap();
        assert!(store.tamper(&key, &ValueId::Mip(0)));

        let policy = BuildCachePolicy::new(CachePolicy::DEFAULT);
        assert!(store.get(&key, &policy).unwrap().is_none());

        // Non-overwriting store now replaces the corrupt entry anyway
        let fresh = sample_record();
        store.put(&key, &fresh, false).unwrap();
        let loaded = store.get(&key, &policy).unwrap().unwrap();
        assert_eq!(loaded, fresh);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("tephra-cache-test-{}", std::process::id()));
        let store = FileCacheStore::new(&dir).unwrap();
        let key = CacheKey::namespaced("TEXTURE", b"file");
        let record = sample_record();

        assert!(!store.contains(&key));
        store.put(&key, &record, false).unwrap();
        assert!(store.contains(&key));

        let loaded = store
            .get(&key, &BuildCachePolicy::new(CachePolicy::DEFAULT))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);

        std::fs::remove_dir_all(&dir).ok();
    }
}
