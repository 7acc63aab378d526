use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{SyncError, SyncResult};
use crate::storage::{RawVersioned, StoreAccess, StoreStage};
use crate::sync::byte_array::ByteArray;
use crate::sync::listener::UpdateOrigin;

/// Debug counters for store activity, labelled by store name
pub struct SyncCounters {
    registry: Registry,
    accesses: IntCounterVec,
    writes: IntCounterVec,
    sync_values_sent: IntCounterVec,
}

impl SyncCounters {
    pub fn new() -> SyncResult<Self> {
        let registry = Registry::new();
        let accesses = IntCounterVec::new(
            Opts::new("solisync_store_operations_total", "Store operations by kind"),
            &["store", "op"],
        )
        .map_err(metrics_error)?;
        let writes = IntCounterVec::new(
            Opts::new("solisync_store_writes_total", "Committed writes by origin"),
            &["store", "origin"],
        )
        .map_err(metrics_error)?;
        let sync_values_sent = IntCounterVec::new(
            Opts::new("solisync_sync_values_sent_total", "Keyed values shipped to peers"),
            &["store"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(accesses.clone())).map_err(metrics_error)?;
        registry.register(Box::new(writes.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(sync_values_sent.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            accesses,
            writes,
            sync_values_sent,
        })
    }

    pub fn record_access(&self, store: &str, access: StoreAccess) {
        self.accesses.with_label_values(&[store, access.as_str()]).inc();
    }

    pub fn record_write(&self, store: &str, origin: UpdateOrigin) {
        let origin = match origin {
            UpdateOrigin::Local => "local",
            UpdateOrigin::Remote => "remote",
        };
        self.writes.with_label_values(&[store, origin]).inc();
    }

    pub fn record_sent(&self, store: &str, count: usize) {
        self.sync_values_sent
            .with_label_values(&[store])
            .inc_by(count as u64);
    }

    pub fn access_count(&self, store: &str, access: StoreAccess) -> u64 {
        self.accesses.with_label_values(&[store, access.as_str()]).get()
    }

    /// Render all counters in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode counters: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn metrics_error(e: prometheus::Error) -> SyncError {
    SyncError::Internal(format!("metrics: {}", e))
}

/// Pipeline stage that feeds [`SyncCounters`]
pub struct CounterStage {
    counters: std::sync::Arc<SyncCounters>,
}

impl CounterStage {
    pub fn new(counters: std::sync::Arc<SyncCounters>) -> Self {
        Self { counters }
    }
}

impl StoreStage for CounterStage {
    fn name(&self) -> &'static str {
        "counters"
    }

    fn on_access(&self, store: &str, access: StoreAccess) {
        self.counters.record_access(store, access);
    }

    fn after_write(
        &self,
        store: &str,
        _key: &ByteArray,
        _values: &[RawVersioned],
        origin: UpdateOrigin,
    ) -> SyncResult<()> {
        self.counters.record_write(store, origin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_render() {
        let counters = SyncCounters::new().unwrap();
        counters.record_access("apps", StoreAccess::Get);
        counters.record_access("apps", StoreAccess::Get);
        counters.record_write("apps", UpdateOrigin::Remote);
        counters.record_sent("apps", 3);

        assert_eq!(counters.access_count("apps", StoreAccess::Get), 2);
        assert_eq!(counters.access_count("apps", StoreAccess::Put), 0);

        let text = counters.render();
        assert!(text.contains("# TYPE solisync_store_operations_total counter"));
        assert!(text.contains("op=\"get\""));
        assert!(text.contains("solisync_sync_values_sent_total{store=\"apps\"} 3"));
    }
}
