//! Storage engines for synchronized stores
//!
//! Every store is a map from [`ByteArray`] to the list of versions
//! currently held for that key. The conflict policy in [`apply_version`]
//! is shared by all engines so local puts and remote syncs behave the same
//! whichever backend holds the data.

pub mod memory;
pub mod pipeline;
pub mod rocks;

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::sync::byte_array::ByteArray;
use crate::sync::vector_clock::{Occurred, VectorClock};
use crate::sync::versioned::Versioned;

pub use memory::InMemoryStorageEngine;
pub use pipeline::{StoreAccess, StorePipeline, StoreStage};
pub use rocks::RocksStorageEngine;

/// Raw value as held by a storage engine
pub type RawVersioned = Versioned<Vec<u8>>;

/// All versions held for one key
pub type StoreEntry = (ByteArray, Vec<RawVersioned>);

/// Default lifetime of a tombstone before cleanup may drop it
pub const DEFAULT_TOMBSTONE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of a single put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The version was stored
    Applied,
    /// An existing version at or after the incoming clock was kept
    Obsolete { existing: VectorClock },
}

impl PutOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PutOutcome::Applied)
    }

    /// Turn an obsolete outcome into [`SyncError::ObsoleteVersion`]
    pub fn into_result(self, store: &str, key: &ByteArray) -> SyncResult<()> {
        match self {
            PutOutcome::Applied => Ok(()),
            PutOutcome::Obsolete { existing } => Err(SyncError::ObsoleteVersion(format!(
                "key {} in store '{}' already at {}",
                key, store, existing
            ))),
        }
    }
}

/// Ordered key -> versions storage.
///
/// Implementations serialize writers internally; callers never need to hold
/// a lock across calls.
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Every version currently held for `key`, tombstones included
    fn get(&self, key: &ByteArray) -> SyncResult<Vec<RawVersioned>>;

    fn get_versions(&self, key: &ByteArray) -> SyncResult<Vec<VectorClock>> {
        Ok(self.get(key)?.into_iter().map(|v| v.into_parts().1).collect())
    }

    /// Apply a locally originated write using the conflict policy
    fn put(&self, key: &ByteArray, value: RawVersioned) -> SyncResult<PutOutcome>;

    /// Merge versions received from a peer. Versions that are obsolete or
    /// already present are skipped. Returns true when anything changed.
    fn write_sync_value(&self, key: &ByteArray, values: Vec<RawVersioned>) -> SyncResult<bool>;

    /// Snapshot of every key with its versions, in key order
    fn entries(&self) -> SyncResult<Vec<StoreEntry>>;

    fn keys(&self) -> SyncResult<Vec<ByteArray>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    fn truncate(&self) -> SyncResult<()>;

    fn close(&self) -> SyncResult<()>;

    fn is_persistent(&self) -> bool;

    fn set_tombstone_interval(&self, interval: Duration);

    /// Drop keys whose versions are all expired tombstones. Returns the
    /// number of keys removed.
    fn cleanup_task(&self) -> SyncResult<usize>;
}

/// Number of lock stripes guarding per-key read-modify-write cycles
const LOCK_STRIPES: usize = 64;

/// Striped mutexes serializing writers of the same key.
///
/// Writers of keys that hash to different stripes proceed in parallel.
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn stripe(&self, key: &ByteArray) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    pub(crate) fn lock(&self, key: &ByteArray) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock()
    }

    /// Lock every stripe in index order, for whole-store rewrites
    pub(crate) fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes.iter().map(|stripe| stripe.lock()).collect()
    }
}

/// Two keys guarded by different stripes of `locks`
#[cfg(test)]
pub(crate) fn keys_on_distinct_stripes(locks: &KeyLocks) -> (ByteArray, ByteArray) {
    let first = ByteArray::from("key-a");
    let stripe = locks.stripe(&first);
    let second = (0..)
        .map(|i| ByteArray::from(format!("key-b{}", i).as_str()))
        .find(|k| locks.stripe(k) != stripe)
        .unwrap();
    (first, second)
}

/// Apply `incoming` to the versions held for one key.
///
/// The incoming clock must come after every version it supersedes:
/// versions it dominates are replaced, concurrent versions are kept side
/// by side, and an existing version that is equal to or after it makes the
/// write obsolete without changing anything.
pub(crate) fn apply_version(existing: &mut Vec<RawVersioned>, incoming: RawVersioned) -> PutOutcome {
    let mut superseded = Vec::new();
    for (idx, current) in existing.iter().enumerate() {
        match incoming.version().compare(current.version()) {
            Occurred::Before | Occurred::Equal => {
                return PutOutcome::Obsolete {
                    existing: current.version().clone(),
                };
            }
            Occurred::After => superseded.push(idx),
            Occurred::Concurrent => {}
        }
    }
    for idx in superseded.into_iter().rev() {
        existing.remove(idx);
    }
    existing.push(incoming);
    PutOutcome::Applied
}

/// Merge a batch of remote versions; returns whether anything changed.
pub(crate) fn apply_sync_values(existing: &mut Vec<RawVersioned>, values: Vec<RawVersioned>) -> bool {
    let mut changed = false;
    for value in values {
        if apply_version(existing, value).is_applied() {
            changed = true;
        }
    }
    changed
}

/// True when every version is a tombstone stamped before `cutoff_millis`
pub(crate) fn is_expired_tombstone(versions: &[RawVersioned], cutoff_millis: i64) -> bool {
    !versions.is_empty()
        && versions
            .iter()
            .all(|v| v.is_tombstone() && v.version().timestamp() < cutoff_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: &str, entries: &[(i16, u64)]) -> RawVersioned {
        Versioned::of(
            value.as_bytes().to_vec(),
            VectorClock::from_entries(entries.iter().copied(), 0),
        )
    }

    #[test]
    fn test_after_replaces_existing() {
        let mut versions = vec![raw("a", &[(1, 1)])];
        let outcome = apply_version(&mut versions, raw("b", &[(1, 2)]));
        assert_eq!(outcome, PutOutcome::Applied);
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value(), Some(&b"b".to_vec()));
    }

    #[test]
    fn test_before_is_obsolete_and_unchanged() {
        let mut versions = vec![raw("a", &[(1, 2)])];
        let outcome = apply_version(&mut versions, raw("b", &[(1, 1)]));
        assert!(matches!(outcome, PutOutcome::Obsolete { .. }));
        assert_eq!(versions, vec![raw("a", &[(1, 2)])]);
    }

    #[test]
    fn test_equal_is_obsolete() {
        let mut versions = vec![raw("a", &[(1, 2)])];
        let outcome = apply_version(&mut versions, raw("other", &[(1, 2)]));
        assert!(!outcome.is_applied());
        assert_eq!(versions[0].value(), Some(&b"a".to_vec()));
    }

    #[test]
    fn test_concurrent_is_retained() {
        let mut versions = vec![raw("a", &[(1, 1)])];
        let outcome = apply_version(&mut versions, raw("b", &[(2, 1)]));
        assert!(outcome.is_applied());
        assert_eq!(versions.len(), 2);

        // dominating both collapses them
        let outcome = apply_version(&mut versions, raw("c", &[(1, 1), (2, 1), (3, 1)]));
        assert!(outcome.is_applied());
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value(), Some(&b"c".to_vec()));
    }

    #[test]
    fn test_sync_values_skip_obsolete() {
        let mut versions = vec![raw("a", &[(1, 3)])];
        let changed = apply_sync_values(&mut versions, vec![raw("x", &[(1, 1)]), raw("y", &[(1, 3)])]);
        assert!(!changed);
        let changed = apply_sync_values(&mut versions, vec![raw("z", &[(1, 4)])]);
        assert!(changed);
    }

    #[test]
    fn test_obsolete_into_result() {
        let key = ByteArray::from("k");
        let err = PutOutcome::Obsolete {
            existing: VectorClock::new(),
        }
        .into_result("apps", &key)
        .unwrap_err();
        assert!(err.is_obsolete());
        assert!(PutOutcome::Applied.into_result("apps", &key).is_ok());
    }

    #[test]
    fn test_same_key_shares_a_stripe() {
        let locks = KeyLocks::new();
        let key = ByteArray::from("apps");
        assert_eq!(locks.stripe(&key), locks.stripe(&ByteArray::from("apps")));

        let (a, b) = keys_on_distinct_stripes(&locks);
        let _held = locks.lock(&a);
        assert!(locks.stripes[locks.stripe(&b)].try_lock().is_some());
        assert!(locks.stripes[locks.stripe(&a)].try_lock().is_none());
    }
}
