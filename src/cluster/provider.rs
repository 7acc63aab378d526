//! Where the cluster configuration comes from
//!
//! The manager asks its primary provider for a configuration on every
//! refresh: a [`StaticProvider`] when the node list is fixed in the
//! configuration file, a [`SyncStoreProvider`] otherwise. While the local
//! node has no id yet, a failing primary is replaced by the
//! [`FallbackProvider`], which describes a lone unassigned node.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::bootstrap::{allocate_node_id, bootstrap_seeds, write_node_entry};
use super::config::{AuthScheme, ClusterConfig};
use super::iface::interface_address;
use super::node::{parse_seeds, ClusterNode, DomainId, NodeId, UNASSIGNED_NODE_ID};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::rpc::auth::AuthContext;
use crate::rpc::protocol::NodeDescriptor;
use crate::sync::byte_array::{encode_key, encode_value};
use crate::sync::manager::{unsync_keys, SyncManager, SYSTEM_NODE_STORE, SYSTEM_UNSYNC_STORE};

#[async_trait]
pub trait ClusterConfigProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn config(&self, manager: &SyncManager) -> SyncResult<ClusterConfig>;
}

/// Per-node settings held in the unsynchronized system store, with the
/// manager's configuration as defaults
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub seeds: Option<String>,
    pub node_id: Option<NodeId>,
    pub domain_id: Option<DomainId>,
    pub hostname: String,
    pub port: u16,
    pub auth_scheme: AuthScheme,
    pub keystore_path: Option<PathBuf>,
    pub keystore_password: Option<String>,
}

impl LocalSettings {
    pub fn load(manager: &SyncManager) -> SyncResult<Self> {
        let unsync = manager.get_store_client::<String, String>(SYSTEM_UNSYNC_STORE)?;
        let get = |key: &str| unsync.get_value(&key.to_string());
        let config = manager.config();

        let node_id = get(unsync_keys::LOCAL_NODE_ID)?
            .map(|v| parse_number::<NodeId>(unsync_keys::LOCAL_NODE_ID, &v))
            .transpose()?;
        let domain_id = get(unsync_keys::LOCAL_DOMAIN_ID)?
            .map(|v| parse_number::<DomainId>(unsync_keys::LOCAL_DOMAIN_ID, &v))
            .transpose()?;
        let port = get(unsync_keys::LOCAL_NODE_PORT)?
            .map(|v| parse_number::<u16>(unsync_keys::LOCAL_NODE_PORT, &v))
            .transpose()?
            .unwrap_or(config.default_port);

        let hostname = match get(unsync_keys::LOCAL_NODE_HOSTNAME)? {
            Some(host) => host,
            None => match get(unsync_keys::LOCAL_NODE_IFACE)? {
                Some(iface) => interface_address(&iface)?.to_string(),
                None => system_hostname(),
            },
        };

        let auth_scheme = match get(unsync_keys::AUTH_SCHEME)? {
            Some(scheme) => scheme.parse()?,
            None => config.auth_scheme,
        };
        let keystore_path = get(unsync_keys::KEYSTORE_PATH)?
            .map(PathBuf::from)
            .or_else(|| config.keystore_path.clone());
        let keystore_password =
            get(unsync_keys::KEYSTORE_PASSWORD)?.or_else(|| config.keystore_password.clone());

        Ok(Self {
            seeds: get(unsync_keys::SEEDS)?,
            node_id,
            domain_id,
            hostname,
            port,
            auth_scheme,
            keystore_path,
            keystore_password,
        })
    }

    pub fn auth(&self) -> SyncResult<AuthContext> {
        AuthContext::from_settings(
            self.auth_scheme,
            self.keystore_path.as_deref(),
            self.keystore_password.as_deref(),
        )
    }

    fn descriptor(&self, node_id: Option<NodeId>, domain_id: Option<DomainId>) -> NodeDescriptor {
        NodeDescriptor {
            hostname: self.hostname.clone(),
            port: self.port,
            node_id,
            domain_id,
        }
    }

    fn apply_to(&self, config: ClusterConfig, leader_allowed: bool) -> ClusterConfig {
        config
            .with_auth(
                self.auth_scheme,
                self.keystore_path.clone(),
                self.keystore_password.clone(),
            )
            .with_leader_allowed(leader_allowed)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SyncResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("Invalid value '{}' for {}", value, key)))
}

fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Fixed membership from [`SyncConfig::nodes`]
pub struct StaticProvider {
    nodes: Vec<ClusterNode>,
    this_node: Option<NodeId>,
}

impl StaticProvider {
    pub fn new(nodes: Vec<ClusterNode>, this_node: Option<NodeId>) -> Self {
        Self { nodes, this_node }
    }
}

#[async_trait]
impl ClusterConfigProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn config(&self, manager: &SyncManager) -> SyncResult<ClusterConfig> {
        let this_node = self
            .this_node
            .ok_or_else(|| SyncError::Config("this_node is required with a static node list".to_string()))?;
        let config = manager.config();
        Ok(ClusterConfig::new(self.nodes.clone(), this_node)?
            .with_auth(
                config.auth_scheme,
                config.keystore_path.clone(),
                config.keystore_password.clone(),
            )
            .with_leader_allowed(config.leader_allowed))
    }
}

/// Membership kept in the system node store, joined through bootstrap
#[derive(Default)]
pub struct SyncStoreProvider;

impl SyncStoreProvider {
    pub fn new() -> Self {
        Self
    }

    fn live_nodes(manager: &SyncManager) -> SyncResult<Vec<ClusterNode>> {
        let nodes = manager.get_store_client::<NodeId, ClusterNode>(SYSTEM_NODE_STORE)?;
        Ok(nodes
            .entries()?
            .into_iter()
            .filter_map(|(_, v)| v.into_value())
            .collect())
    }

    fn store_local_node_id(manager: &SyncManager, node_id: NodeId) -> SyncResult<()> {
        manager.store_handle(SYSTEM_UNSYNC_STORE)?.put_with_retry(
            &encode_key(&unsync_keys::LOCAL_NODE_ID.to_string())?,
            Some(encode_value(&node_id.to_string())?),
            node_id,
        )?;
        Ok(())
    }

    /// First node of a new cluster
    fn start_cluster(manager: &SyncManager, settings: &LocalSettings) -> SyncResult<NodeId> {
        let taken: HashSet<NodeId> = Self::live_nodes(manager)?.iter().map(|n| n.node_id).collect();
        let node_id = allocate_node_id(&taken)?;
        let domain_id = settings.domain_id.unwrap_or(node_id);
        let node = ClusterNode::new(settings.hostname.clone(), settings.port, node_id, domain_id);
        write_node_entry(manager, &node, node_id)?;
        Self::store_local_node_id(manager, node_id)?;
        info!("Started a new cluster as {}", node);
        Ok(node_id)
    }
}

#[async_trait]
impl ClusterConfigProvider for SyncStoreProvider {
    fn name(&self) -> &'static str {
        "sync-store"
    }

    async fn config(&self, manager: &SyncManager) -> SyncResult<ClusterConfig> {
        let settings = LocalSettings::load(manager)?;
        let seeds = match settings.seeds.as_deref() {
            Some(seeds) => Some(parse_seeds(seeds)?),
            None => None,
        };

        let node_id = match (settings.node_id, &seeds) {
            (Some(node_id), _) => node_id,
            (None, None) => {
                return Err(SyncError::Config(
                    "Cluster not configured: no seeds and no local node id".to_string(),
                ))
            }
            (None, Some(seeds)) if seeds.is_empty() => Self::start_cluster(manager, &settings)?,
            (None, Some(seeds)) => {
                let auth = settings.auth()?;
                let local = settings.descriptor(None, settings.domain_id);
                bootstrap_seeds(manager, seeds, &auth, &local)
                    .await?
                    .ok_or_else(|| SyncError::Protocol("Seed did not assign a node id".to_string()))?
            }
        };

        let nodes = Self::live_nodes(manager)?;
        match nodes.iter().find(|n| n.node_id == node_id) {
            None => {
                let domain_id = settings.domain_id.unwrap_or(node_id);
                match seeds.as_deref() {
                    Some(seeds) if !seeds.is_empty() => {
                        info!("Node {} is missing from the node store, bootstrapping again", node_id);
                        let auth = settings.auth()?;
                        let local = settings.descriptor(Some(node_id), Some(domain_id));
                        bootstrap_seeds(manager, seeds, &auth, &local).await?;
                    }
                    _ => {
                        let node =
                            ClusterNode::new(settings.hostname.clone(), settings.port, node_id, domain_id);
                        info!("Re-adding {} to the node store", node);
                        write_node_entry(manager, &node, node_id)?;
                    }
                }
            }
            Some(own) => {
                let domain_id = settings.domain_id.unwrap_or(own.domain_id);
                if own.hostname != settings.hostname
                    || own.port != settings.port
                    || own.domain_id != domain_id
                {
                    let node =
                        ClusterNode::new(settings.hostname.clone(), settings.port, node_id, domain_id);
                    info!("Updating local node entry to {}", node);
                    write_node_entry(manager, &node, node_id)?;
                }
            }
        }

        let nodes = Self::live_nodes(manager)?;
        let config = ClusterConfig::new(nodes, node_id)?;
        Ok(settings.apply_to(config, manager.config().leader_allowed))
    }
}

/// A lone node without an id, listening for administrative requests
#[derive(Default)]
pub struct FallbackProvider {
    warned: AtomicBool,
}

impl FallbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration used before anything else is known
    pub fn unassigned(&self, config: &SyncConfig) -> SyncResult<ClusterConfig> {
        let node = ClusterNode::new("localhost", config.default_port, UNASSIGNED_NODE_ID, UNASSIGNED_NODE_ID);
        Ok(ClusterConfig::new(vec![node], UNASSIGNED_NODE_ID)?
            .with_auth(
                config.auth_scheme,
                config.keystore_path.clone(),
                config.keystore_password.clone(),
            )
            .with_leader_allowed(config.leader_allowed))
    }
}

#[async_trait]
impl ClusterConfigProvider for FallbackProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn config(&self, manager: &SyncManager) -> SyncResult<ClusterConfig> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            info!("Cluster not yet configured; using fallback local configuration");
        }
        let settings = match LocalSettings::load(manager) {
            Ok(settings) => settings,
            Err(e) => {
                debug!("Ignoring unreadable local settings: {}", e);
                return self.unassigned(manager.config());
            }
        };
        let node = ClusterNode::new("localhost", settings.port, UNASSIGNED_NODE_ID, UNASSIGNED_NODE_ID);
        let config = ClusterConfig::new(vec![node], UNASSIGNED_NODE_ID)?;
        Ok(settings.apply_to(config, manager.config().leader_allowed))
    }
}
