//! Administrative view of the cluster
//!
//! Most setters only write the unsynchronized system store; the change is
//! picked up by the next configuration refresh, which they request.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::config::AuthScheme;
use super::election::ClusterListener;
use super::node::{is_assigned, parse_seeds, ClusterNode, DomainId, NodeId};
use crate::error::{SyncError, SyncResult};
use crate::sync::client::StoreClient;
use crate::sync::manager::{unsync_keys, SyncManager, SYSTEM_NODE_STORE, SYSTEM_UNSYNC_STORE};

#[derive(Clone)]
pub struct ClusterService {
    manager: SyncManager,
}

impl ClusterService {
    pub fn new(manager: SyncManager) -> Self {
        Self { manager }
    }

    fn unsync(&self) -> SyncResult<StoreClient<String, String>> {
        self.manager.get_store_client(SYSTEM_UNSYNC_STORE)
    }

    fn node_store(&self) -> SyncResult<StoreClient<NodeId, ClusterNode>> {
        self.manager.get_store_client(SYSTEM_NODE_STORE)
    }

    fn set(&self, key: &str, value: Option<String>) -> SyncResult<()> {
        let unsync = self.unsync()?;
        match value {
            Some(value) => {
                unsync.put(&key.to_string(), value)?;
            }
            None => unsync.delete(&key.to_string())?,
        }
        self.manager.request_refresh();
        Ok(())
    }

    /// Id of the local node, `None` until bootstrap completed
    pub fn local_node_id(&self) -> Option<NodeId> {
        Some(self.manager.local_node_id()).filter(|id| is_assigned(*id))
    }

    /// Wait until the local node has an id
    pub async fn wait_for_local_node_id(&self, timeout: Duration) -> SyncResult<NodeId> {
        let mut rx = self.manager.subscribe_config();
        let wait = async {
            loop {
                let id = rx.borrow_and_update().local_node_id();
                if is_assigned(id) {
                    return Ok(id);
                }
                if rx.changed().await.is_err() {
                    return Err(SyncError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SyncError::Timeout("waiting for a local node id".to_string()))?
    }

    /// Nodes in the current configuration
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.manager.cluster_config().nodes().cloned().collect()
    }

    /// Nodes as stored in the node store, which may be ahead of the
    /// applied configuration
    pub fn stored_nodes(&self) -> SyncResult<Vec<ClusterNode>> {
        Ok(self
            .node_store()?
            .entries()?
            .into_iter()
            .filter_map(|(_, v)| v.into_value())
            .collect())
    }

    pub fn set_auth_info(
        &self,
        scheme: AuthScheme,
        keystore_path: Option<&Path>,
        keystore_password: Option<&str>,
    ) -> SyncResult<()> {
        self.set(unsync_keys::AUTH_SCHEME, Some(scheme.to_string()))?;
        self.set(
            unsync_keys::KEYSTORE_PATH,
            keystore_path.map(|p| p.display().to_string()),
        )?;
        self.set(
            unsync_keys::KEYSTORE_PASSWORD,
            keystore_password.map(str::to_string),
        )
    }

    /// Comma separated `host:port` list; an empty string starts a new cluster
    pub fn set_seeds(&self, seeds: &str) -> SyncResult<()> {
        let parsed = parse_seeds(seeds)?;
        self.set(unsync_keys::SEEDS, Some(parsed.join(",")))
    }

    pub fn set_local_node_port(&self, port: u16) -> SyncResult<()> {
        self.set(unsync_keys::LOCAL_NODE_PORT, Some(port.to_string()))
    }

    pub fn set_local_node_iface(&self, iface: &str) -> SyncResult<()> {
        self.set(unsync_keys::LOCAL_NODE_IFACE, Some(iface.to_string()))
    }

    pub fn set_local_node_host(&self, host: &str) -> SyncResult<()> {
        self.set(unsync_keys::LOCAL_NODE_HOSTNAME, Some(host.to_string()))
    }

    pub fn set_local_domain_id(&self, domain_id: DomainId) -> SyncResult<()> {
        self.set(unsync_keys::LOCAL_DOMAIN_ID, Some(domain_id.to_string()))
    }

    /// Bootstrap again from the seeds keeping the current id, alone in a
    /// domain of its own
    pub fn reseed(&self) -> SyncResult<()> {
        let node_id = self
            .local_node_id()
            .ok_or_else(|| SyncError::Config("Local node has no id to keep".to_string()))?;
        info!("Reseeding node {}", node_id);
        self.set(unsync_keys::LOCAL_DOMAIN_ID, Some(node_id.to_string()))?;
        self.node_store()?.delete(&node_id)?;
        self.manager.request_refresh();
        Ok(())
    }

    /// Remove another node from the cluster. A live node will rejoin.
    pub fn delete_node(&self, node_id: NodeId) -> SyncResult<()> {
        if self.local_node_id() == Some(node_id) {
            return Err(SyncError::DeleteLocalNode(node_id));
        }
        info!("Deleting node {} from the cluster", node_id);
        self.node_store()?.delete(&node_id)
    }

    pub fn get_domain_leader(&self) -> Option<NodeId> {
        self.manager.election().get_domain_leader()
    }

    pub fn new_election(&self, rigged: bool) {
        self.manager.election().new_election(rigged);
    }

    pub fn register_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.manager.election().register_listener(listener);
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.manager.rpc().is_connected(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    fn service() -> ClusterService {
        let mut config = SyncConfig::new("./unused");
        config.persistence_enabled = false;
        SyncManager::new(config).unwrap().cluster_service()
    }

    #[test]
    fn test_setters_write_unsync_store() {
        let service = service();
        service.set_seeds("a:1, b").unwrap();
        service.set_local_node_port(7001).unwrap();
        service.set_local_node_host("10.0.0.1").unwrap();

        let unsync = service.unsync().unwrap();
        let get = |k: &str| unsync.get_value(&k.to_string()).unwrap();
        assert_eq!(get(unsync_keys::SEEDS), Some("a:1,b:6642".to_string()));
        assert_eq!(get(unsync_keys::LOCAL_NODE_PORT), Some("7001".to_string()));
        assert_eq!(get(unsync_keys::LOCAL_NODE_HOSTNAME), Some("10.0.0.1".to_string()));
    }

    #[test]
    fn test_unassigned_node_has_no_id() {
        let service = service();
        assert_eq!(service.local_node_id(), None);
        assert!(matches!(service.reseed(), Err(SyncError::Config(_))));
        assert_eq!(service.get_domain_leader(), None);
    }

    #[test]
    fn test_clearing_keystore_path() {
        let service = service();
        service
            .set_auth_info(AuthScheme::ChallengeResponse, Some(Path::new("/tmp/ks")), None)
            .unwrap();
        let unsync = service.unsync().unwrap();
        assert_eq!(
            unsync.get_value(&unsync_keys::AUTH_SCHEME.to_string()).unwrap(),
            Some("CHALLENGE_RESPONSE".to_string())
        );
        assert_eq!(
            unsync.get_value(&unsync_keys::KEYSTORE_PASSWORD.to_string()).unwrap(),
            None
        );
    }
}
