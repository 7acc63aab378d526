use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::listener::{ListenerHandle, ListenerStage, StoreListener};
use super::propagation::{PropagationQueue, SyncTask};
use super::scope::Scope;
use super::vector_clock::VectorClock;
use super::versioned::{resolve_last_write_wins, Versioned};
use crate::cluster::node::NodeId;
use crate::error::{SyncError, SyncResult};
use crate::storage::{PutOutcome, RawVersioned, StorageEngine, StorePipeline};
use crate::sync::byte_array::ByteArray;

/// Attempts made by a read-increment-write before giving up
pub const MAX_PUT_RETRIES: usize = 16;

/// A registered store: its pipeline plus the handles needed to drive it
pub struct StoreHandle {
    name: String,
    scope: Scope,
    pipeline: Arc<StorePipeline>,
    listeners: Arc<ListenerStage>,
    propagation: Option<PropagationQueue>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTask>>>,
}

impl StoreHandle {
    pub(crate) fn new(
        name: String,
        scope: Scope,
        pipeline: Arc<StorePipeline>,
        listeners: Arc<ListenerStage>,
        propagation: Option<(PropagationQueue, mpsc::UnboundedReceiver<SyncTask>)>,
    ) -> Self {
        let (queue, rx) = match propagation {
            Some((queue, rx)) => (Some(queue), Some(rx)),
            None => (None, None),
        };
        Self {
            name,
            scope,
            pipeline,
            listeners,
            propagation: queue,
            pending_rx: Mutex::new(rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn engine(&self) -> Arc<StorePipeline> {
        self.pipeline.clone()
    }

    pub fn subscribe(&self, listener: Arc<dyn StoreListener>) -> ListenerHandle {
        self.listeners.subscribe(listener)
    }

    pub fn queued_sync_tasks(&self) -> u64 {
        self.propagation.as_ref().map(|q| q.queued()).unwrap_or(0)
    }

    pub(crate) fn take_dispatcher_rx(&self) -> Option<mpsc::UnboundedReceiver<SyncTask>> {
        self.pending_rx.lock().take()
    }

    pub(crate) fn listener_stage(&self) -> &Arc<ListenerStage> {
        &self.listeners
    }

    /// Current versions collapsed to one, or an empty version
    pub fn get_resolved(&self, key: &ByteArray) -> SyncResult<RawVersioned> {
        let versions = self.pipeline.get(key)?;
        Ok(resolve_last_write_wins(&versions).unwrap_or_else(Versioned::empty))
    }

    /// Build on `base`, bumping `node_id`; a dominated write is an error
    pub fn put_versioned(
        &self,
        key: &ByteArray,
        value: Option<Vec<u8>>,
        base: &VectorClock,
        node_id: NodeId,
    ) -> SyncResult<(PutOutcome, VectorClock)> {
        let version = base.incremented(node_id);
        let outcome = self
            .pipeline
            .put(key, Versioned::new(value, version.clone()))?;
        Ok((outcome, version))
    }

    /// Read-increment-write, retried while another writer wins the race
    pub fn put_with_retry(
        &self,
        key: &ByteArray,
        value: Option<Vec<u8>>,
        node_id: NodeId,
    ) -> SyncResult<VectorClock> {
        for _ in 0..MAX_PUT_RETRIES {
            let current = self.get_resolved(key)?;
            let (outcome, version) = self.put_versioned(key, value.clone(), current.version(), node_id)?;
            if outcome.is_applied() {
                return Ok(version);
            }
        }
        Err(SyncError::ObsoleteVersion(format!(
            "key {} in store '{}' kept changing after {} attempts",
            key, self.name, MAX_PUT_RETRIES
        )))
    }

    pub(crate) fn close(&self) -> SyncResult<()> {
        self.listeners.shutdown();
        self.pipeline.close()
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("stages", &self.pipeline.stage_names())
            .finish()
    }
}
