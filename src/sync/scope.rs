use serde::{Deserialize, Serialize};
use std::fmt;

/// Replication policy of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Replicated to every node in the cluster
    Global,
    /// Per node; watched locally but never replicated in or out
    Local,
    /// Per node bootstrap data, never replicated
    Unsynchronized,
}

impl Scope {
    /// Whether local writes are queued for propagation
    pub fn propagates(&self) -> bool {
        matches!(self, Scope::Global)
    }

    /// Whether writes received from peers are accepted
    pub fn accepts_remote(&self) -> bool {
        matches!(self, Scope::Global)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Global => "GLOBAL",
            Scope::Local => "LOCAL",
            Scope::Unsynchronized => "UNSYNCHRONIZED",
        };
        write!(f, "{}", s)
    }
}
