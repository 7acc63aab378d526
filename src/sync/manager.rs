//! Sync manager
//!
//! The [`SyncManager`] owns every registered store, the live
//! [`ClusterConfig`], the RPC service and the domain election. Stores are
//! built as a pipeline over a base engine:
//!
//! ```text
//! base engine -> [counters] -> listeners -> [propagation]
//! ```
//!
//! The propagation stage is only installed for GLOBAL stores; each of them
//! gets its own dispatcher task so writes to one store reach peers in the
//! order they were committed.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::byte_array::ByteArray;
use super::client::StoreClient;
use super::counters::{CounterStage, SyncCounters};
use super::listener::{ListenerStage, UpdateOrigin};
use super::propagation::{run_dispatcher, PropagationQueue, PropagationStage, MAX_BATCH};
use super::scope::Scope;
use super::store::StoreHandle;
use super::vector_clock::VectorClock;
use crate::cluster::config::ClusterConfig;
use crate::cluster::election::ElectionManager;
use crate::cluster::node::NodeId;
use crate::cluster::provider::{
    ClusterConfigProvider, FallbackProvider, StaticProvider, SyncStoreProvider,
};
use crate::cluster::service::ClusterService;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::rpc::protocol::{AsyncMessageHeader, KeyedValues, SyncMessage, SyncValueMessage};
use crate::rpc::service::RpcService;
use crate::storage::memory::InMemoryStorageEngine;
use crate::storage::rocks::RocksStorageEngine;
use crate::storage::{StorageEngine, StorePipeline, StoreStage};

/// Cluster membership, one entry per node keyed by node id
pub const SYSTEM_NODE_STORE: &str = "solisync.system.nodes";

/// Per-node bootstrap parameters, never replicated
pub const SYSTEM_UNSYNC_STORE: &str = "solisync.system.unsync";

/// Keys of [`SYSTEM_UNSYNC_STORE`]
pub mod unsync_keys {
    pub const SEEDS: &str = "seeds";
    pub const LOCAL_NODE_ID: &str = "localNodeId";
    pub const LOCAL_NODE_IFACE: &str = "localNodeIface";
    pub const LOCAL_NODE_HOSTNAME: &str = "localNodeHostname";
    pub const LOCAL_NODE_PORT: &str = "localNodePort";
    pub const LOCAL_DOMAIN_ID: &str = "localDomainId";
    pub const AUTH_SCHEME: &str = "authScheme";
    pub const KEYSTORE_PATH: &str = "keyStorePath";
    pub const KEYSTORE_PASSWORD: &str = "keyStorePassword";
}

struct SyncManagerInner {
    config: SyncConfig,
    stores: RwLock<HashMap<String, Arc<StoreHandle>>>,
    cluster_tx: watch::Sender<Arc<ClusterConfig>>,
    provider: Box<dyn ClusterConfigProvider>,
    fallback: FallbackProvider,
    counters: Option<Arc<SyncCounters>>,
    rpc: RpcService,
    election: ElectionManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    refresh: Arc<Notify>,
    /// Serializes reconfiguration and remembers the last applied config
    applied: tokio::sync::Mutex<Option<Arc<ClusterConfig>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Entry point of the sync layer. Cheap to clone.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncManagerInner>,
}

impl SyncManager {
    /// Create a manager and its system stores. Nothing touches the network
    /// until [`start`](Self::start).
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let counters = if config.debug_counters {
            Some(Arc::new(SyncCounters::new()?))
        } else {
            None
        };

        let provider: Box<dyn ClusterConfigProvider> = match &config.nodes {
            Some(nodes) => Box::new(StaticProvider::new(nodes.clone(), config.this_node)),
            None => Box::new(SyncStoreProvider::new()),
        };
        let fallback = FallbackProvider::new();
        let initial = fallback.unassigned(&config)?;

        let (cluster_tx, _) = watch::channel(Arc::new(initial));
        let (shutdown_tx, _) = watch::channel(false);

        let rpc = RpcService::new(config.peer_queue_capacity, config.reconnect_max());
        let election = ElectionManager::new(config.election_timeout());

        let manager = Self {
            inner: Arc::new(SyncManagerInner {
                config,
                stores: RwLock::new(HashMap::new()),
                cluster_tx,
                provider,
                fallback,
                counters,
                rpc,
                election,
                tasks: Mutex::new(Vec::new()),
                dispatchers: Mutex::new(Vec::new()),
                shutdown_tx,
                refresh: Arc::new(Notify::new()),
                applied: tokio::sync::Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        };

        manager.register_persistent_store(SYSTEM_NODE_STORE, Scope::Global)?;
        manager.register_persistent_store(SYSTEM_UNSYNC_STORE, Scope::Unsynchronized)?;
        Ok(manager)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Register an in-memory store. Registering an existing name is a no-op.
    pub fn register_store(&self, name: &str, scope: Scope) -> SyncResult<()> {
        self.register(name, scope, false)
    }

    /// Register a store backed by RocksDB, or by memory when persistence
    /// is disabled. Registering an existing name is a no-op.
    pub fn register_persistent_store(&self, name: &str, scope: Scope) -> SyncResult<()> {
        self.register(name, scope, true)
    }

    fn register(&self, name: &str, scope: Scope, persistent: bool) -> SyncResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }

        let handle = {
            let mut stores = self.inner.stores.write();
            if let Some(existing) = stores.get(name) {
                if existing.scope() != scope {
                    warn!(
                        "Store '{}' already registered as {}, ignoring {}",
                        name,
                        existing.scope(),
                        scope
                    );
                }
                return Ok(());
            }

            let base: Arc<dyn StorageEngine> =
                if persistent && self.inner.config.persistence_enabled {
                    Arc::new(RocksStorageEngine::open(&self.inner.config.db_path, name)?)
                } else {
                    Arc::new(InMemoryStorageEngine::new(name))
                };
            base.set_tombstone_interval(self.inner.config.tombstone_interval());

            let listeners = Arc::new(ListenerStage::new(name)?);
            let mut pipeline = StorePipeline::new(base);
            if let Some(counters) = &self.inner.counters {
                pipeline = pipeline.with_stage(Arc::new(CounterStage::new(counters.clone())));
            }
            pipeline = pipeline.with_stage(listeners.clone() as Arc<dyn StoreStage>);

            let propagation = if scope.propagates() {
                let (queue, rx) = PropagationQueue::channel(name);
                pipeline = pipeline.with_stage(Arc::new(PropagationStage::new(queue.clone())));
                Some((queue, rx))
            } else {
                None
            };

            let handle = Arc::new(StoreHandle::new(
                name.to_string(),
                scope,
                Arc::new(pipeline),
                listeners,
                propagation,
            ));
            stores.insert(name.to_string(), handle.clone());
            handle
        };

        info!(
            "Registered {} store '{}' ({})",
            if persistent { "persistent" } else { "memory" },
            name,
            scope
        );
        if self.inner.started.load(Ordering::SeqCst) {
            self.spawn_dispatcher(&handle);
        }
        Ok(())
    }

    fn spawn_dispatcher(&self, handle: &StoreHandle) {
        let Some(rx) = handle.take_dispatcher_rx() else {
            return;
        };
        let task = tokio::spawn(run_dispatcher(
            handle.name().to_string(),
            rx,
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        self.inner.dispatchers.lock().push(task);
    }

    pub fn store_handle(&self, name: &str) -> SyncResult<Arc<StoreHandle>> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }
        self.inner
            .stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownStore(name.to_string()))
    }

    pub fn store_scope(&self, name: &str) -> SyncResult<Scope> {
        Ok(self.store_handle(name)?.scope())
    }

    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.stores.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Typed client over a registered store
    pub fn get_store_client<K, V>(&self, name: &str) -> SyncResult<StoreClient<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        Ok(StoreClient::new(
            self.store_handle(name)?,
            self.inner.cluster_tx.subscribe(),
        ))
    }

    /// Merge versions received from elsewhere into a store, notifying
    /// listeners with a remote origin. Returns whether anything changed.
    pub fn write_sync_value(
        &self,
        store: &str,
        key: &ByteArray,
        values: Vec<crate::storage::RawVersioned>,
    ) -> SyncResult<bool> {
        self.store_handle(store)?.engine().write_sync_value(key, values)
    }

    /// Apply a batch pushed by a peer; only GLOBAL stores accept one
    pub fn handle_sync_values(&self, store: &str, values: Vec<KeyedValues>) -> SyncResult<u32> {
        let handle = self.store_handle(store)?;
        if !handle.scope().accepts_remote() {
            return Err(SyncError::Protocol(format!(
                "Store '{}' is {} and does not accept remote writes",
                store,
                handle.scope()
            )));
        }
        let engine = handle.engine();
        let mut applied = 0u32;
        for kv in values {
            if engine.write_sync_value(&kv.key, kv.values)? {
                applied += 1;
            }
        }
        debug!("Applied {} synced values to '{}'", applied, store);
        Ok(applied)
    }

    /// Number of propagation tasks ever queued for `store`
    pub fn queued_sync_tasks(&self, store: &str) -> SyncResult<u64> {
        Ok(self.store_handle(store)?.queued_sync_tasks())
    }

    /// Write on behalf of a remote client. Without a base version the
    /// write is retried on top of whatever is current.
    pub fn remote_put(
        &self,
        store: &str,
        key: &ByteArray,
        value: Option<Vec<u8>>,
        version: Option<&VectorClock>,
    ) -> SyncResult<VectorClock> {
        let handle = self.store_handle(store)?;
        let node_id = self.local_node_id();
        match version {
            Some(base) => {
                let (outcome, version) = handle.put_versioned(key, value, base, node_id)?;
                outcome.into_result(store, key)?;
                Ok(version)
            }
            None => handle.put_with_retry(key, value, node_id),
        }
    }

    /// Snapshot of every GLOBAL store, batched for a freshly connected peer
    pub fn full_sync_messages(&self) -> SyncResult<Vec<SyncMessage>> {
        let handles: Vec<Arc<StoreHandle>> = self
            .inner
            .stores
            .read()
            .values()
            .filter(|h| h.scope() == Scope::Global)
            .cloned()
            .collect();

        let mut messages = Vec::new();
        for handle in handles {
            let entries: Vec<KeyedValues> = handle
                .engine()
                .base()
                .entries()?
                .into_iter()
                .map(KeyedValues::from)
                .collect();
            for chunk in entries.chunks(MAX_BATCH) {
                messages.push(SyncMessage::SyncValue(SyncValueMessage {
                    header: AsyncMessageHeader::new(self.inner.rpc.next_transaction_id()),
                    store: handle.name().to_string(),
                    values: chunk.to_vec(),
                }));
            }
        }
        Ok(messages)
    }

    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.inner.cluster_tx.borrow().clone()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<Arc<ClusterConfig>> {
        self.inner.cluster_tx.subscribe()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.cluster_config().local_node_id()
    }

    pub fn rpc(&self) -> &RpcService {
        &self.inner.rpc
    }

    pub fn election(&self) -> &ElectionManager {
        &self.inner.election
    }

    pub fn counters(&self) -> Option<&Arc<SyncCounters>> {
        self.inner.counters.as_ref()
    }

    /// Administrative API over this manager
    pub fn cluster_service(&self) -> ClusterService {
        ClusterService::new(self.clone())
    }

    /// Ask for a configuration refresh without waiting for the timer
    pub fn request_refresh(&self) {
        self.inner.refresh.notify_one();
    }

    pub(crate) fn on_peer_connection_change(&self, node_id: NodeId, connected: bool) {
        debug!(
            "Node {} {}",
            node_id,
            if connected { "connected" } else { "disconnected" }
        );
        self.inner.election.on_connection_change(node_id, connected);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Load the cluster configuration, start listening and dialling peers
    /// and run the background tasks. Calling it again is a no-op.
    pub async fn start(&self) -> SyncResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.election.start(self.clone());

        let handles: Vec<Arc<StoreHandle>> =
            self.inner.stores.read().values().cloned().collect();
        for handle in &handles {
            self.spawn_dispatcher(handle);
        }

        for name in [SYSTEM_NODE_STORE, SYSTEM_UNSYNC_STORE] {
            let refresh = self.inner.refresh.clone();
            self.store_handle(name)?.subscribe(Arc::new(
                move |_keys: &[ByteArray], _origin: UpdateOrigin| -> anyhow::Result<()> {
                    refresh.notify_one();
                    Ok(())
                },
            ));
        }

        self.update_configuration().await?;

        let refresh_task = tokio::spawn(refresh_loop(
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        let cleanup_task = tokio::spawn(cleanup_loop(
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        self.inner.tasks.lock().extend([refresh_task, cleanup_task]);

        info!(
            "Sync manager started as node {}",
            self.cluster_config().local_node_id()
        );
        Ok(())
    }

    /// Ask the providers for a configuration and apply it if it changed.
    ///
    /// A failing provider keeps the current configuration, unless the node
    /// has no id yet, in which case the fallback is used.
    pub async fn update_configuration(&self) -> SyncResult<()> {
        let mut applied = self.inner.applied.lock().await;
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let current = self.cluster_config();
        let next = match self.inner.provider.config(self).await {
            Ok(config) => config,
            Err(e) if current.is_unassigned() => {
                debug!(
                    "{} provider unavailable ({}), using fallback",
                    self.inner.provider.name(),
                    e
                );
                self.inner.fallback.config(self).await?
            }
            Err(e) => {
                warn!("Cannot refresh cluster configuration, keeping current one: {}", e);
                return Ok(());
            }
        };

        if let Some(previous) = applied.as_ref() {
            if **previous == next {
                return Ok(());
            }
        }

        info!(
            "Applying cluster configuration: node {} of {} nodes",
            next.local_node_id(),
            next.node_count()
        );
        let next = Arc::new(next);
        self.inner.cluster_tx.send_replace(next.clone());
        self.inner.rpc.reconfigure(self, &next).await?;
        self.inner.election.on_config_change(&next);
        *applied = Some(next);
        Ok(())
    }

    /// Stop background work, flush propagation queues and close every store.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down sync manager");

        let _ = self.inner.shutdown_tx.send(true);
        let dispatchers = std::mem::take(&mut *self.inner.dispatchers.lock());
        for dispatcher in dispatchers {
            if let Err(e) = dispatcher.await {
                warn!("Propagation dispatcher failed: {}", e);
            }
        }
        for task in std::mem::take(&mut *self.inner.tasks.lock()) {
            task.abort();
        }

        self.inner.election.shutdown();
        self.inner.rpc.shutdown().await;

        let stores: Vec<Arc<StoreHandle>> = self
            .inner
            .stores
            .write()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let closed = tokio::task::spawn_blocking(move || {
            for store in stores {
                if let Err(e) = store.close() {
                    error!("Failed to close store '{}': {}", store.name(), e);
                }
            }
        })
        .await;
        if let Err(e) = closed {
            error!("Closing stores failed: {}", e);
        }
        info!("Sync manager stopped");
    }
}

async fn refresh_loop(manager: SyncManager, mut shutdown: watch::Receiver<bool>) {
    let interval = manager.inner.config.config_refresh_interval();
    let refresh = manager.inner.refresh.clone();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = refresh.notified() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = manager.update_configuration().await {
            warn!("Cluster configuration update failed: {}", e);
        }
    }
}

async fn cleanup_loop(manager: SyncManager, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(manager.inner.config.cleanup_interval());
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let handles: Vec<Arc<StoreHandle>> =
            manager.inner.stores.read().values().cloned().collect();
        for handle in handles {
            match handle.engine().cleanup_task() {
                Ok(0) => {}
                Ok(removed) => debug!("Removed {} tombstones from '{}'", removed, handle.name()),
                Err(e) => warn!("Tombstone cleanup of '{}' failed: {}", handle.name(), e),
            }
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("local_node_id", &self.local_node_id())
            .field("stores", &self.store_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SyncManager {
        let mut config = SyncConfig::new("./unused");
        config.persistence_enabled = false;
        SyncManager::new(config).unwrap()
    }

    #[test]
    fn test_system_stores_registered() {
        let manager = manager();
        assert_eq!(manager.store_scope(SYSTEM_NODE_STORE).unwrap(), Scope::Global);
        assert_eq!(
            manager.store_scope(SYSTEM_UNSYNC_STORE).unwrap(),
            Scope::Unsynchronized
        );
        assert!(manager.cluster_config().is_unassigned());
    }

    #[test]
    fn test_register_store_idempotent() {
        let manager = manager();
        manager.register_store("apps", Scope::Global).unwrap();
        let first = manager.store_handle("apps").unwrap();
        manager.register_store("apps", Scope::Local).unwrap();
        let second = manager.store_handle("apps").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.scope(), Scope::Global);
    }

    #[test]
    fn test_unknown_store() {
        let manager = manager();
        assert!(matches!(
            manager.store_handle("missing"),
            Err(SyncError::UnknownStore(_))
        ));
    }

    #[test]
    fn test_sync_values_rejected_for_local_store() {
        let manager = manager();
        manager.register_store("local", Scope::Local).unwrap();
        let err = manager.handle_sync_values("local", Vec::new()).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn test_full_sync_only_covers_global_stores() {
        let manager = manager();
        manager.register_store("global", Scope::Global).unwrap();
        manager.register_store("unsync", Scope::Unsynchronized).unwrap();
        let global = manager.get_store_client::<String, String>("global").unwrap();
        let unsync = manager.get_store_client::<String, String>("unsync").unwrap();
        global.put(&"a".to_string(), "1".to_string()).unwrap();
        unsync.put(&"b".to_string(), "2".to_string()).unwrap();

        let messages = manager.full_sync_messages().unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            SyncMessage::SyncValue(m) => {
                assert_eq!(m.store, "global");
                assert_eq!(m.values.len(), 1);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = manager();
        manager.register_store("apps", Scope::Global).unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(matches!(manager.store_handle("apps"), Err(SyncError::Shutdown)));
        assert!(matches!(
            manager.register_store("other", Scope::Global),
            Err(SyncError::Shutdown)
        ));
    }
}
