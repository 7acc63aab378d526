//! Outbound propagation of local writes
//!
//! Each GLOBAL store owns a [`PropagationQueue`]. The [`PropagationStage`]
//! pushes every locally committed write onto it and a per-store dispatcher
//! task drains it in commit order, batching whatever is ready into one
//! `SyncValue` message per peer. Delivery to a peer never blocks: a peer
//! that is down or slow only loses messages that the next full sync on
//! reconnect repairs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::listener::UpdateOrigin;
use super::manager::SyncManager;
use crate::error::{SyncError, SyncResult};
use crate::rpc::protocol::{AsyncMessageHeader, KeyedValues, SyncMessage, SyncValueMessage};
use crate::storage::{RawVersioned, StoreStage};
use crate::sync::byte_array::ByteArray;

/// Maximum number of keyed values per propagated message
pub const MAX_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncTask {
    pub key: ByteArray,
    pub value: RawVersioned,
}

#[derive(Clone)]
pub struct PropagationQueue {
    store: String,
    tx: mpsc::UnboundedSender<SyncTask>,
    queued: Arc<AtomicU64>,
}

impl PropagationQueue {
    pub fn channel(store: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<SyncTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store: store.into(),
                tx,
                queued: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn push(&self, key: ByteArray, value: RawVersioned) -> SyncResult<()> {
        self.tx
            .send(SyncTask { key, value })
            .map_err(|_| SyncError::Shutdown)?;
        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Total number of tasks ever queued for this store
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &str {
        &self.store
    }
}

/// Pipeline stage queueing local writes for propagation
pub struct PropagationStage {
    queue: PropagationQueue,
}

impl PropagationStage {
    pub fn new(queue: PropagationQueue) -> Self {
        Self { queue }
    }
}

impl StoreStage for PropagationStage {
    fn name(&self) -> &'static str {
        "propagation"
    }

    fn after_write(
        &self,
        _store: &str,
        key: &ByteArray,
        values: &[RawVersioned],
        origin: UpdateOrigin,
    ) -> SyncResult<()> {
        if origin != UpdateOrigin::Local {
            return Ok(());
        }
        for value in values {
            self.queue.push(key.clone(), value.clone())?;
        }
        Ok(())
    }
}

/// Drain the queue of `store` until shutdown, then flush what is left
pub(crate) async fn run_dispatcher(
    store: String,
    mut rx: mpsc::UnboundedReceiver<SyncTask>,
    manager: SyncManager,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Propagation dispatcher for '{}' started", store);
    loop {
        tokio::select! {
            biased;
            task = rx.recv() => {
                match task {
                    Some(task) => {
                        let mut batch = vec![task];
                        while batch.len() < MAX_BATCH {
                            match rx.try_recv() {
                                Ok(task) => batch.push(task),
                                Err(_) => break,
                            }
                        }
                        send_batch(&store, batch, &manager);
                    }
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                let mut rest = Vec::new();
                while let Ok(task) = rx.try_recv() {
                    rest.push(task);
                }
                for chunk in rest.chunks(MAX_BATCH) {
                    send_batch(&store, chunk.to_vec(), &manager);
                }
                break;
            }
        }
    }
    debug!("Propagation dispatcher for '{}' stopped", store);
}

fn send_batch(store: &str, batch: Vec<SyncTask>, manager: &SyncManager) {
    let count = batch.len();
    let values: Vec<KeyedValues> = batch
        .into_iter()
        .map(|task| KeyedValues::new(task.key, vec![task.value]))
        .collect();
    let msg = SyncMessage::SyncValue(SyncValueMessage {
        header: AsyncMessageHeader::new(manager.rpc().next_transaction_id()),
        store: store.to_string(),
        values,
    });
    let reached = manager.rpc().broadcast(&msg);
    if let Some(counters) = manager.counters() {
        counters.record_sent(store, count * reached);
    }
    trace!("Propagated {} values of '{}' to {} peers", count, store, reached);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::vector_clock::VectorClock;
    use crate::sync::versioned::Versioned;

    #[test]
    fn test_stage_only_queues_local_writes() {
        let (queue, mut rx) = PropagationQueue::channel("apps");
        let stage = PropagationStage::new(queue.clone());
        let value = Versioned::of(vec![1], VectorClock::from_entries([(1, 1)], 0));
        let key = ByteArray::from("k");

        stage
            .after_write("apps", &key, &[value.clone()], UpdateOrigin::Remote)
            .unwrap();
        assert_eq!(queue.queued(), 0);

        stage
            .after_write("apps", &key, &[value], UpdateOrigin::Local)
            .unwrap();
        assert_eq!(queue.queued(), 1);
        let task = rx.try_recv().unwrap();
        assert_eq!(task.key, key);
    }

    #[test]
    fn test_push_after_receiver_dropped_fails() {
        let (queue, rx) = PropagationQueue::channel("apps");
        drop(rx);
        let value = Versioned::of(vec![1], VectorClock::new());
        assert!(matches!(
            queue.push(ByteArray::from("k"), value),
            Err(SyncError::Shutdown)
        ));
    }
}
