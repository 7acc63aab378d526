//! Composable write pipeline
//!
//! A [`StorePipeline`] wraps a base engine and runs an ordered list of
//! [`StoreStage`]s around it. Stages see every access (for counters) and
//! every successful write together with its origin (for listeners and
//! propagation). A failing stage is logged and skipped; it never fails the
//! write that already committed.

use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use super::{PutOutcome, RawVersioned, StorageEngine, StoreEntry};
use crate::error::SyncResult;
use crate::sync::byte_array::ByteArray;
use crate::sync::listener::UpdateOrigin;

/// Kind of operation reported to [`StoreStage::on_access`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAccess {
    Get,
    Put,
    Iterate,
    SyncIn,
}

impl StoreAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreAccess::Get => "get",
            StoreAccess::Put => "put",
            StoreAccess::Iterate => "iterate",
            StoreAccess::SyncIn => "sync_in",
        }
    }
}

pub trait StoreStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_access(&self, _store: &str, _access: StoreAccess) {}

    /// Called after `values` were committed for `key`
    fn after_write(
        &self,
        store: &str,
        key: &ByteArray,
        values: &[RawVersioned],
        origin: UpdateOrigin,
    ) -> SyncResult<()>;
}

pub struct StorePipeline {
    engine: Arc<dyn StorageEngine>,
    stages: Vec<Arc<dyn StoreStage>>,
}

impl StorePipeline {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            stages: Vec::new(),
        }
    }

    /// Append a stage; stages run in insertion order
    pub fn with_stage(mut self, stage: Arc<dyn StoreStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn base(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    fn record(&self, access: StoreAccess) {
        for stage in &self.stages {
            stage.on_access(self.engine.name(), access);
        }
    }

    fn notify(&self, key: &ByteArray, values: &[RawVersioned], origin: UpdateOrigin) {
        for stage in &self.stages {
            if let Err(e) = stage.after_write(self.engine.name(), key, values, origin) {
                error!(
                    "Stage '{}' failed for key {} in store '{}': {}",
                    stage.name(),
                    key,
                    self.engine.name(),
                    e
                );
            }
        }
    }
}

impl StorageEngine for StorePipeline {
    fn name(&self) -> &str {
        self.engine.name()
    }

    fn get(&self, key: &ByteArray) -> SyncResult<Vec<RawVersioned>> {
        self.record(StoreAccess::Get);
        self.engine.get(key)
    }

    fn put(&self, key: &ByteArray, value: RawVersioned) -> SyncResult<PutOutcome> {
        self.record(StoreAccess::Put);
        let outcome = self.engine.put(key, value.clone())?;
        if outcome.is_applied() {
            self.notify(key, std::slice::from_ref(&value), UpdateOrigin::Local);
        }
        Ok(outcome)
    }

    fn write_sync_value(&self, key: &ByteArray, values: Vec<RawVersioned>) -> SyncResult<bool> {
        self.record(StoreAccess::SyncIn);
        let changed = self.engine.write_sync_value(key, values.clone())?;
        if changed {
            self.notify(key, &values, UpdateOrigin::Remote);
        }
        Ok(changed)
    }

    fn entries(&self) -> SyncResult<Vec<StoreEntry>> {
        self.record(StoreAccess::Iterate);
        self.engine.entries()
    }

    fn keys(&self) -> SyncResult<Vec<ByteArray>> {
        self.record(StoreAccess::Iterate);
        self.engine.keys()
    }

    fn truncate(&self) -> SyncResult<()> {
        self.engine.truncate()
    }

    fn close(&self) -> SyncResult<()> {
        self.engine.close()
    }

    fn is_persistent(&self) -> bool {
        self.engine.is_persistent()
    }

    fn set_tombstone_interval(&self, interval: Duration) {
        self.engine.set_tombstone_interval(interval)
    }

    fn cleanup_task(&self) -> SyncResult<usize> {
        self.engine.cleanup_task()
    }
}
