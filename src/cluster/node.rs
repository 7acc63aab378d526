use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Unique identifier for a node in the cluster
pub type NodeId = i16;

/// Identifier of a leadership domain
pub type DomainId = i16;

/// Id carried by a node that has not completed bootstrap yet
pub const UNASSIGNED_NODE_ID: NodeId = i16::MAX;

/// Port used when nothing else is configured
pub const DEFAULT_PORT: u16 = 6642;

pub fn is_assigned(node_id: NodeId) -> bool {
    node_id >= 0 && node_id != UNASSIGNED_NODE_ID
}

/// Membership entry stored in the system node store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClusterNode {
    pub hostname: String,
    pub port: u16,
    pub node_id: NodeId,
    pub domain_id: DomainId,
}

impl ClusterNode {
    pub fn new(hostname: impl Into<String>, port: u16, node_id: NodeId, domain_id: DomainId) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            node_id,
            domain_id,
        }
    }

    /// Address used to dial this node
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Same node id and domain, possibly different address
    pub fn same_identity(&self, other: &ClusterNode) -> bool {
        self.node_id == other.node_id && self.domain_id == other.domain_id
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node[id={}, domain={}, {}:{}]",
            self.node_id, self.domain_id, self.hostname, self.port
        )
    }
}

/// Parse a comma separated list of `host:port` seeds.
///
/// Whitespace is trimmed, empty entries are skipped and a missing port
/// falls back to [`DEFAULT_PORT`]. Returns the normalized list.
pub fn parse_seeds(seeds: &str) -> SyncResult<Vec<String>> {
    let mut parsed = Vec::new();
    for raw in seeds.split(',') {
        let seed = raw.trim();
        if seed.is_empty() {
            continue;
        }
        let (host, port) = match seed.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| SyncError::Config(format!("Invalid port in seed '{}'", seed)))?;
                (host, port)
            }
            None => (seed, DEFAULT_PORT),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(SyncError::Config(format!("Invalid host in seed '{}'", seed)));
        }
        if port == 0 {
            return Err(SyncError::Config(format!("Invalid port in seed '{}'", seed)));
        }
        parsed.push(format!("{}:{}", host, port));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seeds_normalizes() {
        let seeds = parse_seeds(" 10.0.0.1:6642 , node-b ,,node-c:7000").unwrap();
        assert_eq!(seeds, vec!["10.0.0.1:6642", "node-b:6642", "node-c:7000"]);
    }

    #[test]
    fn test_parse_seeds_empty() {
        assert!(parse_seeds("").unwrap().is_empty());
        assert!(parse_seeds(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_seeds_rejects_garbage() {
        assert!(parse_seeds("host:notaport").is_err());
        assert!(parse_seeds("host:0").is_err());
        assert!(parse_seeds(":6642").is_err());
    }

    #[test]
    fn test_unassigned() {
        assert!(!is_assigned(UNASSIGNED_NODE_ID));
        assert!(!is_assigned(-1));
        assert!(is_assigned(0));
        assert!(is_assigned(42));
    }

    #[test]
    fn test_node_display() {
        let node = ClusterNode::new("localhost", 6642, 3, 1);
        assert_eq!(node.to_string(), "Node[id=3, domain=1, localhost:6642]");
        assert_eq!(node.address(), "localhost:6642");
    }
}
