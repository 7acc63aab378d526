pub mod cluster;
pub mod config;
pub mod error;
pub mod rpc;
pub mod storage;
pub mod sync;

pub use cluster::{ClusterConfig, ClusterNode, ClusterService, NodeId};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use storage::{InMemoryStorageEngine, RocksStorageEngine, StorageEngine};
pub use sync::{Scope, StoreClient, SyncManager, UpdateOrigin, VectorClock, Versioned};
