use parking_lot::RwLock;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    apply_sync_values, apply_version, is_expired_tombstone, KeyLocks, PutOutcome, RawVersioned,
    StorageEngine, StoreEntry, DEFAULT_TOMBSTONE_INTERVAL,
};
use crate::error::{SyncError, SyncResult};
use crate::sync::byte_array::ByteArray;
use crate::sync::vector_clock::now_millis;

/// Persistent engine backed by RocksDB.
///
/// One database directory per store. Values are the bincode encoding of
/// the version list for the key.
pub struct RocksStorageEngine {
    name: String,
    path: PathBuf,
    db: RwLock<Option<DB>>,
    /// Serializes read-modify-write cycles on each key's version list
    key_locks: KeyLocks,
    tombstone_interval: RwLock<Duration>,
}

impl std::fmt::Debug for RocksStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStorageEngine")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl RocksStorageEngine {
    /// Open (or create) the store `name` under `base_dir`
    pub fn open<P: AsRef<Path>>(base_dir: P, name: &str) -> SyncResult<Self> {
        let path = base_dir.as_ref().join(name);
        std::fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        // bound WAL and info log growth for small system stores
        opts.set_max_total_wal_size(16 * 1024 * 1024);
        opts.set_keep_log_file_num(3);

        let db = DB::open(&opts, &path)
            .map_err(|e| SyncError::Storage(format!("Failed to open store '{}': {}", name, e)))?;

        tracing::debug!("Opened persistent store '{}' at {}", name, path.display());

        Ok(Self {
            name: name.to_string(),
            path,
            db: RwLock::new(Some(db)),
            key_locks: KeyLocks::new(),
            tombstone_interval: RwLock::new(DEFAULT_TOMBSTONE_INTERVAL),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<R>(&self, f: impl FnOnce(&DB) -> SyncResult<R>) -> SyncResult<R> {
        let guard = self.db.read();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(SyncError::Storage(format!("store '{}' is closed", self.name))),
        }
    }

    fn read_versions(db: &DB, key: &ByteArray) -> SyncResult<Vec<RawVersioned>> {
        match db.get(key.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_versions(db: &DB, key: &ByteArray, versions: &[RawVersioned]) -> SyncResult<()> {
        if versions.is_empty() {
            db.delete(key.as_bytes())?;
        } else {
            db.put(key.as_bytes(), bincode::serialize(versions)?)?;
        }
        Ok(())
    }
}

impl StorageEngine for RocksStorageEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &ByteArray) -> SyncResult<Vec<RawVersioned>> {
        self.with_db(|db| Self::read_versions(db, key))
    }

    fn put(&self, key: &ByteArray, value: RawVersioned) -> SyncResult<PutOutcome> {
        let _guard = self.key_locks.lock(key);
        self.with_db(|db| {
            let mut versions = Self::read_versions(db, key)?;
            let outcome = apply_version(&mut versions, value);
            if outcome.is_applied() {
                Self::write_versions(db, key, &versions)?;
            }
            Ok(outcome)
        })
    }

    fn write_sync_value(&self, key: &ByteArray, values: Vec<RawVersioned>) -> SyncResult<bool> {
        let _guard = self.key_locks.lock(key);
        self.with_db(|db| {
            let mut versions = Self::read_versions(db, key)?;
            let changed = apply_sync_values(&mut versions, values);
            if changed {
                Self::write_versions(db, key, &versions)?;
            }
            Ok(changed)
        })
    }

    fn entries(&self) -> SyncResult<Vec<StoreEntry>> {
        self.with_db(|db| {
            let mut entries = Vec::new();
            for item in db.iterator(IteratorMode::Start) {
                let (key, value) = item?;
                let versions: Vec<RawVersioned> = bincode::deserialize(&value)?;
                entries.push((ByteArray::from(&key[..]), versions));
            }
            Ok(entries)
        })
    }

    fn truncate(&self) -> SyncResult<()> {
        let _guards = self.key_locks.lock_all();
        self.with_db(|db| {
            let mut batch = WriteBatch::default();
            for item in db.iterator(IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete(&key);
            }
            db.write(batch)?;
            Ok(())
        })
    }

    fn close(&self) -> SyncResult<()> {
        if let Some(db) = self.db.write().take() {
            db.flush()?;
            tracing::debug!("Closed persistent store '{}'", self.name);
        }
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn set_tombstone_interval(&self, interval: Duration) {
        *self.tombstone_interval.write() = interval;
    }

    fn cleanup_task(&self) -> SyncResult<usize> {
        let interval = *self.tombstone_interval.read();
        let cutoff = now_millis() - interval.as_millis() as i64;
        self.with_db(|db| {
            let mut expired = Vec::new();
            for item in db.iterator(IteratorMode::Start) {
                let (key, value) = item?;
                let versions: Vec<RawVersioned> = bincode::deserialize(&value)?;
                if is_expired_tombstone(&versions, cutoff) {
                    expired.push(ByteArray::from(&key[..]));
                }
            }
            let mut removed = 0;
            for key in expired {
                let _guard = self.key_locks.lock(&key);
                // a writer may have revived the key since the scan
                if is_expired_tombstone(&Self::read_versions(db, &key)?, cutoff) {
                    db.delete(key.as_bytes())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}
