use serde::{Deserialize, Serialize};

use super::vector_clock::{Occurred, VectorClock};

/// A value tagged with the vector clock that produced it.
///
/// A missing value is a tombstone: the key was deleted at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    value: Option<T>,
    version: VectorClock,
}

impl<T> Versioned<T> {
    pub fn new(value: Option<T>, version: VectorClock) -> Self {
        Self { value, version }
    }

    pub fn of(value: T, version: VectorClock) -> Self {
        Self::new(Some(value), version)
    }

    pub fn tombstone(version: VectorClock) -> Self {
        Self::new(None, version)
    }

    /// No value and an empty clock, returned for keys never written
    pub fn empty() -> Self {
        Self::new(None, VectorClock::new())
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn version(&self) -> &VectorClock {
        &self.version
    }

    pub fn set_value(&mut self, value: Option<T>) {
        self.value = value;
    }

    pub fn set_version(&mut self, version: VectorClock) {
        self.version = version;
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn into_parts(self) -> (Option<T>, VectorClock) {
        (self.value, self.version)
    }

    pub fn compare(&self, other: &Versioned<T>) -> Occurred {
        self.version.compare(&other.version)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            value: self.value.map(f),
            version: self.version,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Versioned<U>, E> {
        let value = match self.value {
            Some(v) => Some(f(v)?),
            None => None,
        };
        Ok(Versioned {
            value,
            version: self.version,
        })
    }
}

/// Collapse a set of versions into one using last-write-wins on the clock
/// timestamp.
///
/// Versions dominated by another member of the set are discarded first.
/// The winner keeps its value but carries the merge of every surviving
/// clock, so a write built on top of it dominates all the siblings.
/// Ties on the timestamp go to the version with the larger clock entries.
pub fn resolve_last_write_wins<T: Clone>(versions: &[Versioned<T>]) -> Option<Versioned<T>> {
    let live: Vec<&Versioned<T>> = versions
        .iter()
        .filter(|candidate| {
            !versions
                .iter()
                .any(|other| other.version.compare(&candidate.version) == Occurred::After)
        })
        .collect();

    let winner = live.iter().copied().max_by(|a, b| {
        a.version
            .timestamp()
            .cmp(&b.version.timestamp())
            .then_with(|| {
                let ka: Vec<_> = a.version.entries().collect();
                let kb: Vec<_> = b.version.entries().collect();
                ka.cmp(&kb)
            })
    })?;

    let mut merged = winner.version.clone();
    for v in &live {
        merged.merge(&v.version);
    }
    Some(Versioned::new(winner.value.clone(), merged))
}
