//! Cluster membership, bootstrap and domain leadership

pub mod bootstrap;
pub mod config;
pub mod election;
pub mod iface;
pub mod node;
pub mod provider;
pub mod service;

pub use bootstrap::{process_join_request, BootstrapState};
pub use config::{AuthScheme, ClusterConfig};
pub use election::{ClusterListener, ElectionManager, ElectionState};
pub use node::{ClusterNode, DomainId, NodeId, DEFAULT_PORT, UNASSIGNED_NODE_ID};
pub use provider::{ClusterConfigProvider, FallbackProvider, StaticProvider, SyncStoreProvider};
pub use service::ClusterService;
