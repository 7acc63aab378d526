use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::node::{is_assigned, ClusterNode, DomainId, NodeId};
use crate::error::{SyncError, SyncResult};

/// How nodes authenticate each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthScheme {
    #[default]
    NoAuth,
    ChallengeResponse,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::NoAuth => write!(f, "NO_AUTH"),
            AuthScheme::ChallengeResponse => write!(f, "CHALLENGE_RESPONSE"),
        }
    }
}

impl FromStr for AuthScheme {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NO_AUTH" | "NOAUTH" | "NONE" => Ok(AuthScheme::NoAuth),
            "CHALLENGE_RESPONSE" => Ok(AuthScheme::ChallengeResponse),
            other => Err(SyncError::Config(format!("Unknown auth scheme '{}'", other))),
        }
    }
}

/// Immutable snapshot of cluster membership as seen by this node.
///
/// A new snapshot replaces the old one wholesale whenever membership or
/// local settings change.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    nodes: BTreeMap<NodeId, ClusterNode>,
    local_node_id: NodeId,
    auth_scheme: AuthScheme,
    keystore_path: Option<PathBuf>,
    keystore_password: Option<String>,
    leader_allowed: bool,
}

impl ClusterConfig {
    /// Create a configuration; `local_node_id` must be one of `nodes`
    pub fn new(nodes: Vec<ClusterNode>, local_node_id: NodeId) -> SyncResult<Self> {
        let nodes: BTreeMap<NodeId, ClusterNode> =
            nodes.into_iter().map(|n| (n.node_id, n)).collect();
        if !nodes.contains_key(&local_node_id) {
            return Err(SyncError::Config(format!(
                "Local node {} is not part of the node list",
                local_node_id
            )));
        }
        Ok(Self {
            nodes,
            local_node_id,
            auth_scheme: AuthScheme::NoAuth,
            keystore_path: None,
            keystore_password: None,
            leader_allowed: true,
        })
    }

    pub fn with_auth(
        mut self,
        scheme: AuthScheme,
        keystore_path: Option<PathBuf>,
        keystore_password: Option<String>,
    ) -> Self {
        self.auth_scheme = scheme;
        self.keystore_path = keystore_path;
        self.keystore_password = keystore_password;
        self
    }

    pub fn with_leader_allowed(mut self, allowed: bool) -> Self {
        self.leader_allowed = allowed;
        self
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, node_id: NodeId) -> Option<&ClusterNode> {
        self.nodes.get(&node_id)
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn local_node(&self) -> &ClusterNode {
        // checked in `new`
        &self.nodes[&self.local_node_id]
    }

    pub fn local_domain_id(&self) -> DomainId {
        self.local_node().domain_id
    }

    /// Every node except the local one
    pub fn peers(&self) -> impl Iterator<Item = &ClusterNode> {
        let local = self.local_node_id;
        self.nodes.values().filter(move |n| n.node_id != local)
    }

    /// Nodes sharing the local node's domain, local node included
    pub fn domain_nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        let domain = self.local_domain_id();
        self.nodes.values().filter(move |n| n.domain_id == domain)
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }

    pub fn keystore_path(&self) -> Option<&Path> {
        self.keystore_path.as_deref()
    }

    pub fn keystore_password(&self) -> Option<&str> {
        self.keystore_password.as_deref()
    }

    pub fn leader_allowed(&self) -> bool {
        self.leader_allowed
    }

    /// True while the local node has not been given an id
    pub fn is_unassigned(&self) -> bool {
        !is_assigned(self.local_node_id)
    }

    /// Address the RPC listener binds to
    pub fn listen_address(&self) -> String {
        format!("0.0.0.0:{}", self.local_node().port)
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("nodes", &self.nodes.values().collect::<Vec<_>>())
            .field("local_node_id", &self.local_node_id)
            .field("auth_scheme", &self.auth_scheme)
            .field("keystore_path", &self.keystore_path)
            .field("leader_allowed", &self.leader_allowed)
            .finish()
    }
}

impl fmt::Display for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<String> = self.nodes.values().map(|n| n.to_string()).collect();
        write!(
            f,
            "ClusterConfig[local={}, nodes=[{}], auth={}]",
            self.local_node_id,
            nodes.join(", "),
            self.auth_scheme
        )
    }
}
