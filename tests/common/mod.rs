//! Common test utilities for solisync integration tests
//!
//! Provides shared helpers for:
//! - Creating managers backed by temporary directories
//! - Starting nodes that bootstrap from each other on localhost
//! - Polling for asynchronous conditions with a deadline

#![allow(dead_code)]

use solisync::cluster::{ClusterNode, NodeId};
use solisync::sync::manager::unsync_keys;
use solisync::sync::SYSTEM_UNSYNC_STORE;
use solisync::{SyncConfig, SyncManager};
use std::net::TcpListener;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A running node and the directory holding its persistent stores
pub struct TestNode {
    pub manager: SyncManager,
    pub port: u16,
    pub dir: TempDir,
}

impl TestNode {
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn stored_nodes(&self) -> Vec<ClusterNode> {
        self.manager
            .cluster_service()
            .stored_nodes()
            .unwrap_or_default()
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.manager.cluster_service().local_node_id()
    }
}

/// Configuration with short timers so cluster tests settle quickly
pub fn test_config(dir: &TempDir) -> SyncConfig {
    let mut config = SyncConfig::new(dir.path());
    config.config_refresh_ms = 100;
    config.election_timeout_ms = 300;
    config.reconnect_max_ms = 500;
    config
}

/// Manager with every store in memory
pub fn memory_manager() -> SyncManager {
    let mut config = SyncConfig::new("./unused");
    config.persistence_enabled = false;
    SyncManager::new(config).expect("Failed to create manager")
}

/// Manager with persistent stores in a fresh temporary directory
pub fn persistent_manager() -> (SyncManager, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let manager = SyncManager::new(test_config(&dir)).expect("Failed to create manager");
    (manager, dir)
}

/// A port nothing is listening on right now
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free port")
}

/// Configure and start a node on localhost. An empty `seeds` starts a new
/// cluster.
pub async fn start_node(seeds: &str) -> TestNode {
    start_configured_node(Some(seeds), |_| {}).await
}

/// Start a node after `configure` has run against the stopped manager.
/// Without seeds the node comes up unassigned.
pub async fn start_configured_node<F>(seeds: Option<&str>, configure: F) -> TestNode
where
    F: FnOnce(&SyncManager),
{
    let dir = TempDir::new().expect("Failed to create temp dir");
    start_node_in(dir, seeds, configure).await
}

pub async fn start_node_in<F>(dir: TempDir, seeds: Option<&str>, configure: F) -> TestNode
where
    F: FnOnce(&SyncManager),
{
    let port = free_port();
    let manager = SyncManager::new(test_config(&dir)).expect("Failed to create manager");

    let cluster = manager.cluster_service();
    cluster.set_local_node_port(port).unwrap();
    cluster.set_local_node_host("127.0.0.1").unwrap();
    if let Some(seeds) = seeds {
        cluster.set_seeds(seeds).unwrap();
    }
    configure(&manager);

    manager.start().await.expect("Failed to start manager");
    TestNode { manager, port, dir }
}

/// `localNodeId` as written to the unsynchronized store by bootstrap
pub fn stored_local_node_id(manager: &SyncManager) -> Option<String> {
    manager
        .get_store_client::<String, String>(SYSTEM_UNSYNC_STORE)
        .ok()?
        .get_value(&unsync_keys::LOCAL_NODE_ID.to_string())
        .ok()
        .flatten()
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Shut every node down
pub async fn shutdown_all(nodes: &[TestNode]) {
    for node in nodes {
        node.manager.shutdown().await;
    }
}
