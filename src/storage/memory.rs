use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    apply_sync_values, apply_version, is_expired_tombstone, KeyLocks, PutOutcome, RawVersioned,
    StorageEngine, StoreEntry, DEFAULT_TOMBSTONE_INTERVAL,
};
use crate::error::{SyncError, SyncResult};
use crate::sync::byte_array::ByteArray;
use crate::sync::vector_clock::now_millis;

/// Ordered in-memory engine, used for non-persistent stores and tests
pub struct InMemoryStorageEngine {
    name: String,
    data: RwLock<BTreeMap<ByteArray, Vec<RawVersioned>>>,
    key_locks: KeyLocks,
    tombstone_interval: RwLock<Duration>,
    closed: RwLock<bool>,
}

impl InMemoryStorageEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            key_locks: KeyLocks::new(),
            tombstone_interval: RwLock::new(DEFAULT_TOMBSTONE_INTERVAL),
            closed: RwLock::new(false),
        }
    }

    /// Caller holds the key's stripe lock
    fn store_versions(&self, key: &ByteArray, versions: Vec<RawVersioned>) {
        let mut data = self.data.write();
        if versions.is_empty() {
            data.remove(key);
        } else {
            data.insert(key.clone(), versions);
        }
    }

    fn check_open(&self) -> SyncResult<()> {
        if *self.closed.read() {
            return Err(SyncError::Storage(format!("store '{}' is closed", self.name)));
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorageEngine")
            .field("name", &self.name)
            .finish()
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &ByteArray) -> SyncResult<Vec<RawVersioned>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned().unwrap_or_default())
    }

    fn put(&self, key: &ByteArray, value: RawVersioned) -> SyncResult<PutOutcome> {
        self.check_open()?;
        let _guard = self.key_locks.lock(key);
        let mut versions = self.data.read().get(key).cloned().unwrap_or_default();
        let outcome = apply_version(&mut versions, value);
        if outcome.is_applied() {
            self.store_versions(key, versions);
        }
        Ok(outcome)
    }

    fn write_sync_value(&self, key: &ByteArray, values: Vec<RawVersioned>) -> SyncResult<bool> {
        self.check_open()?;
        let _guard = self.key_locks.lock(key);
        let mut versions = self.data.read().get(key).cloned().unwrap_or_default();
        let changed = apply_sync_values(&mut versions, values);
        if changed {
            self.store_versions(key, versions);
        }
        Ok(changed)
    }

    fn entries(&self) -> SyncResult<Vec<StoreEntry>> {
        self.check_open()?;
        Ok(self
            .data
            .read()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn truncate(&self) -> SyncResult<()> {
        self.check_open()?;
        let _guards = self.key_locks.lock_all();
        self.data.write().clear();
        Ok(())
    }

    fn close(&self) -> SyncResult<()> {
        *self.closed.write() = true;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn set_tombstone_interval(&self, interval: Duration) {
        *self.tombstone_interval.write() = interval;
    }

    fn cleanup_task(&self) -> SyncResult<usize> {
        self.check_open()?;
        let interval = *self.tombstone_interval.read();
        let cutoff = now_millis() - interval.as_millis() as i64;
        let expired: Vec<ByteArray> = self
            .data
            .read()
            .iter()
            .filter(|(_, versions)| is_expired_tombstone(versions, cutoff))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            let _guard = self.key_locks.lock(&key);
            let mut data = self.data.write();
            // a writer may have revived the key since the scan
            if data.get(&key).is_some_and(|v| is_expired_tombstone(v, cutoff)) {
                data.remove(&key);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
