//! Typed access to a registered store
//!
//! Keys and values are JSON encoded into the raw byte form understood by
//! the storage engines. Local writes always build on the current version
//! and bump the local node's counter, retrying a bounded number of times
//! when a concurrent writer gets there first.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use super::byte_array::{decode_key, decode_value, encode_key, encode_value};
use super::listener::{ListenerHandle, UpdateOrigin};
use super::store::StoreHandle;
use super::vector_clock::VectorClock;
use super::versioned::{resolve_last_write_wins, Versioned};
use crate::cluster::config::ClusterConfig;
use crate::cluster::node::NodeId;
use crate::error::{SyncError, SyncResult};
use crate::storage::StorageEngine;
use crate::sync::byte_array::ByteArray;

pub struct StoreClient<K, V> {
    store: Arc<StoreHandle>,
    cluster: watch::Receiver<Arc<ClusterConfig>>,
    _types: PhantomData<fn(K, V)>,
}

impl<K, V> Clone for StoreClient<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cluster: self.cluster.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> StoreClient<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Arc<StoreHandle>, cluster: watch::Receiver<Arc<ClusterConfig>>) -> Self {
        Self {
            store,
            cluster,
            _types: PhantomData,
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    fn local_node_id(&self) -> NodeId {
        self.cluster.borrow().local_node_id()
    }

    /// Current value, resolving concurrent versions by last write.
    ///
    /// A missing key yields a version with no value and an empty clock.
    pub fn get(&self, key: &K) -> SyncResult<Versioned<V>> {
        let raw = self.store.get_resolved(&encode_key(key)?)?;
        raw.try_map(|bytes| decode_value(&bytes))
    }

    pub fn get_value(&self, key: &K) -> SyncResult<Option<V>> {
        Ok(self.get(key)?.into_value())
    }

    pub fn get_value_or(&self, key: &K, default: V) -> SyncResult<V> {
        Ok(self.get_value(key)?.unwrap_or(default))
    }

    /// Every version currently stored, unresolved
    pub fn get_versions(&self, key: &K) -> SyncResult<Vec<Versioned<V>>> {
        self.store
            .engine()
            .get(&encode_key(key)?)?
            .into_iter()
            .map(|v| v.try_map(|bytes| decode_value(&bytes)))
            .collect()
    }

    /// Write `value`, retrying on concurrent updates. Returns the new clock.
    ///
    /// The clock is bumped for the local node id. Before bootstrap assigns
    /// one, that is [`UNASSIGNED_NODE_ID`], which every unassigned node
    /// shares. Writes to a global store made in that window replicate once
    /// peers connect, but a write from another unassigned node carrying the
    /// same counter compares equal and is dropped as obsolete. The same
    /// holds for every other write method here. Write global stores only
    /// once the node has an id when those writes must not be lost.
    ///
    /// [`UNASSIGNED_NODE_ID`]: crate::cluster::UNASSIGNED_NODE_ID
    pub fn put(&self, key: &K, value: V) -> SyncResult<VectorClock> {
        self.store
            .put_with_retry(&encode_key(key)?, Some(encode_value(&value)?), self.local_node_id())
    }

    /// Write on top of an explicit version; fails if that version is stale
    pub fn put_versioned(&self, key: &K, value: Versioned<V>) -> SyncResult<VectorClock> {
        let raw_key = encode_key(key)?;
        let (value, base) = value.into_parts();
        let bytes = value.map(|v| encode_value(&v)).transpose()?;
        let (outcome, version) =
            self.store
                .put_versioned(&raw_key, bytes, &base, self.local_node_id())?;
        outcome.into_result(self.store.name(), &raw_key)?;
        Ok(version)
    }

    /// Like [`put_versioned`](Self::put_versioned) but reports a stale
    /// version as `false` instead of an error
    pub fn put_if_not_obsolete(&self, key: &K, value: Versioned<V>) -> SyncResult<bool> {
        match self.put_versioned(key, value) {
            Ok(_) => Ok(true),
            Err(SyncError::ObsoleteVersion(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a tombstone for `key`
    pub fn delete(&self, key: &K) -> SyncResult<()> {
        self.store
            .put_with_retry(&encode_key(key)?, None, self.local_node_id())?;
        Ok(())
    }

    /// Delete on top of an explicit version
    pub fn delete_versioned(&self, key: &K, version: &VectorClock) -> SyncResult<()> {
        let raw_key = encode_key(key)?;
        let (outcome, _) = self
            .store
            .put_versioned(&raw_key, None, version, self.local_node_id())?;
        outcome.into_result(self.store.name(), &raw_key)
    }

    /// Live entries (tombstones skipped), in key order
    pub fn entries(&self) -> SyncResult<Vec<(K, Versioned<V>)>> {
        let mut entries = Vec::new();
        for (key, versions) in self.store.engine().entries()? {
            let Some(resolved) = resolve_last_write_wins(&versions) else {
                continue;
            };
            if resolved.is_tombstone() {
                continue;
            }
            let key: K = decode_key(&key)?;
            entries.push((key, resolved.try_map(|bytes| decode_value(&bytes))?));
        }
        Ok(entries)
    }

    pub fn keys(&self) -> SyncResult<Vec<K>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Subscribe to changes with decoded keys
    pub fn add_listener<F>(&self, f: F) -> ListenerHandle
    where
        K: 'static,
        V: 'static,
        F: Fn(Vec<K>, UpdateOrigin) + Send + Sync + 'static,
    {
        let store = self.store.name().to_string();
        let listener = move |keys: &[ByteArray], origin: UpdateOrigin| -> anyhow::Result<()> {
            let mut decoded = Vec::with_capacity(keys.len());
            for key in keys {
                match decode_key::<K>(key) {
                    Ok(k) => decoded.push(k),
                    Err(e) => warn!("Undecodable key {} in store '{}': {}", key, store, e),
                }
            }
            if !decoded.is_empty() {
                f(decoded, origin);
            }
            Ok(())
        };
        self.store.subscribe(Arc::new(listener))
    }
}
