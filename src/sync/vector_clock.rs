//! Vector clocks for causality tracking
//!
//! Each node bumps only its own counter when it originates a write. Two
//! clocks are then ordered (one happened before the other), equal, or
//! concurrent. The wall-clock timestamp never takes part in ordering; it
//! is only used for tombstone expiry and last-write-wins resolution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::cluster::node::NodeId;

/// Relationship between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurred {
    /// Self happened before other
    Before,
    /// Self happened after other
    After,
    /// Same counters
    Equal,
    /// Neither dominates
    Concurrent,
}

impl Occurred {
    /// The relationship seen from the other side
    pub fn mirror(self) -> Occurred {
        match self {
            Occurred::Before => Occurred::After,
            Occurred::After => Occurred::Before,
            other => other,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VectorClock {
    /// node id -> logical counter
    entries: BTreeMap<NodeId, u64>,
    /// Milliseconds since the epoch of the last increment
    timestamp: i64,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp(timestamp: i64) -> Self {
        Self {
            entries: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (NodeId, u64)>, timestamp: i64) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            timestamp,
        }
    }

    /// Bump the counter for `node_id`, stamping the current time.
    pub fn increment(&mut self, node_id: NodeId) -> u64 {
        self.increment_at(node_id, now_millis())
    }

    pub fn increment_at(&mut self, node_id: NodeId, timestamp: i64) -> u64 {
        let counter = self.entries.entry(node_id).or_insert(0);
        *counter += 1;
        self.timestamp = timestamp;
        *counter
    }

    /// Copy of this clock with `node_id` bumped
    pub fn incremented(&self, node_id: NodeId) -> VectorClock {
        let mut next = self.clone();
        next.increment(node_id);
        next
    }

    pub fn version(&self, node_id: NodeId) -> u64 {
        self.entries.get(&node_id).copied().unwrap_or(0)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn entries(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Determine how `self` relates to `other`
    pub fn compare(&self, other: &VectorClock) -> Occurred {
        let mut self_bigger = false;
        let mut other_bigger = false;

        for (node_id, counter) in &self.entries {
            let theirs = other.version(*node_id);
            if *counter > theirs {
                self_bigger = true;
            } else if *counter < theirs {
                other_bigger = true;
            }
        }
        for (node_id, counter) in &other.entries {
            if !self.entries.contains_key(node_id) && *counter > 0 {
                other_bigger = true;
            }
        }

        match (self_bigger, other_bigger) {
            (false, false) => Occurred::Equal,
            (true, false) => Occurred::After,
            (false, true) => Occurred::Before,
            (true, true) => Occurred::Concurrent,
        }
    }

    /// Componentwise maximum; keeps the newer timestamp
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, counter) in &other.entries {
            let mine = self.entries.entry(*node_id).or_insert(0);
            if *counter > *mine {
                *mine = *counter;
            }
        }
        self.timestamp = self.timestamp.max(other.timestamp);
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Occurred::Equal
    }
}

impl Eq for VectorClock {}

impl Hash for VectorClock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (k, v) in &self.entries {
            if *v > 0 {
                k.hash(state);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        write!(f, "[{}] ts:{}", entries.join(", "), self.timestamp)
    }
}
