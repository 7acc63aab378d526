//! Node configuration
//!
//! A [`SyncConfig`] is handed to [`crate::SyncManager::new`]; nothing is
//! read from ambient global state afterwards. It can be built in code,
//! loaded from a TOML file, and adjusted through environment variables:
//!
//! - `SOLISYNC_DB_PATH` - directory for persistent stores
//! - `SOLISYNC_PERSISTENCE` - `true`/`false`
//! - `SOLISYNC_AUTH_SCHEME` - `NO_AUTH` or `CHALLENGE_RESPONSE`
//! - `SOLISYNC_KEYSTORE_PATH` / `SOLISYNC_KEYSTORE_PASSWORD`
//! - `SOLISYNC_PORT` - default listening port
//!
//! These can also be set in a `.env` file next to the config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::config::AuthScheme;
use crate::cluster::node::{ClusterNode, NodeId, DEFAULT_PORT};
use crate::error::{SyncError, SyncResult};

pub const ENV_DB_PATH: &str = "SOLISYNC_DB_PATH";
pub const ENV_PERSISTENCE: &str = "SOLISYNC_PERSISTENCE";
pub const ENV_AUTH_SCHEME: &str = "SOLISYNC_AUTH_SCHEME";
pub const ENV_KEYSTORE_PATH: &str = "SOLISYNC_KEYSTORE_PATH";
pub const ENV_KEYSTORE_PASSWORD: &str = "SOLISYNC_KEYSTORE_PASSWORD";
pub const ENV_PORT: &str = "SOLISYNC_PORT";

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding persistent stores
    pub db_path: PathBuf,
    /// When false, persistent stores fall back to memory
    pub persistence_enabled: bool,
    /// Fixed membership; when set, bootstrap is not used
    pub nodes: Option<Vec<ClusterNode>>,
    /// Local node id within `nodes`
    pub this_node: Option<NodeId>,
    pub auth_scheme: AuthScheme,
    pub keystore_path: Option<PathBuf>,
    pub keystore_password: Option<String>,
    /// Whether this node may become domain leader
    pub leader_allowed: bool,
    pub debug_counters: bool,
    pub default_port: u16,
    pub tombstone_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub config_refresh_ms: u64,
    pub election_timeout_ms: u64,
    pub reconnect_max_ms: u64,
    pub peer_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./sync-db"),
            persistence_enabled: true,
            nodes: None,
            this_node: None,
            auth_scheme: AuthScheme::NoAuth,
            keystore_path: None,
            keystore_password: None,
            leader_allowed: true,
            debug_counters: false,
            default_port: DEFAULT_PORT,
            tombstone_interval_secs: 24 * 60 * 60,
            cleanup_interval_secs: 10 * 60,
            config_refresh_ms: 1000,
            election_timeout_ms: 1000,
            reconnect_max_ms: 5000,
            peer_queue_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("db_path", &self.db_path)
            .field("persistence_enabled", &self.persistence_enabled)
            .field("nodes", &self.nodes)
            .field("this_node", &self.this_node)
            .field("auth_scheme", &self.auth_scheme)
            .field("keystore_path", &self.keystore_path)
            .field("leader_allowed", &self.leader_allowed)
            .field("default_port", &self.default_port)
            .finish()
    }
}

impl SyncConfig {
    /// In-memory configuration rooted at `db_path`
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file, honouring a sibling `.env` and environment
    /// overrides
    pub fn load(path: &Path) -> SyncResult<Self> {
        if let Some(dir) = path.parent() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config: SyncConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> SyncResult<()> {
        if let Ok(db_path) = std::env::var(ENV_DB_PATH) {
            if !db_path.is_empty() {
                self.db_path = PathBuf::from(db_path);
            }
        }

        if let Ok(flag) = std::env::var(ENV_PERSISTENCE) {
            if let Ok(enabled) = flag.parse::<bool>() {
                self.persistence_enabled = enabled;
            }
        }

        if let Ok(scheme) = std::env::var(ENV_AUTH_SCHEME) {
            if !scheme.is_empty() {
                self.auth_scheme = scheme.parse()?;
            }
        }

        if let Ok(path) = std::env::var(ENV_KEYSTORE_PATH) {
            if !path.is_empty() {
                self.keystore_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(password) = std::env::var(ENV_KEYSTORE_PASSWORD) {
            self.keystore_password = Some(password);
        }

        if let Ok(port) = std::env::var(ENV_PORT) {
            if let Ok(port) = port.parse::<u16>() {
                self.default_port = port;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if let Some(nodes) = &self.nodes {
            let this_node = self.this_node.ok_or_else(|| {
                SyncError::Config("A static node list requires 'this_node'".to_string())
            })?;
            if !nodes.iter().any(|n| n.node_id == this_node) {
                return Err(SyncError::Config(format!(
                    "this_node {} is not in the node list",
                    this_node
                )));
            }
        }
        if self.auth_scheme == AuthScheme::ChallengeResponse && self.keystore_path.is_none() {
            return Err(SyncError::Config(
                "CHALLENGE_RESPONSE requires keystore_path".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tombstone_interval(&self) -> Duration {
        Duration::from_secs(self.tombstone_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn config_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.config_refresh_ms.max(10))
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.persistence_enabled);
        assert_eq!(config.default_port, 6642);
        assert_eq!(config.election_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_with_static_nodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("solisync.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/var/lib/solisync"
persistence_enabled = false
this_node = 2
leader_allowed = false

[[nodes]]
hostname = "10.0.0.1"
port = 6642
node_id = 1
domain_id = 1

[[nodes]]
hostname = "10.0.0.2"
port = 6642
node_id = 2
domain_id = 1
"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/solisync"));
        assert!(!config.persistence_enabled);
        assert!(!config.leader_allowed);
        assert_eq!(config.nodes.as_ref().map(|n| n.len()), Some(2));
        assert_eq!(config.this_node, Some(2));
        assert_eq!(config.config_refresh_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_inconsistent_static_config() {
        let mut config = SyncConfig::default();
        config.nodes = Some(vec![ClusterNode::new("a", 6642, 1, 1)]);
        assert!(config.validate().is_err());
        config.this_node = Some(3);
        assert!(config.validate().is_err());
        config.this_node = Some(1);
        assert!(config.validate().is_ok());

        config.auth_scheme = AuthScheme::ChallengeResponse;
        assert!(config.validate().is_err());
    }
}
