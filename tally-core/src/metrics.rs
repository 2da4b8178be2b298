//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `tally_documents_allocated_total` - Documents committed by the allocator
//! - `tally_balance_updates_total{method}` - Committed balance updates per path
//! - `tally_transfers_total{outcome}` - Transfers by outcome
//! - `tally_contention_total` - Operations that gave up waiting on a lock
//! - `tally_operation_duration_seconds{operation}` - Latency per operation

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::Error;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Documents committed
    pub documents_allocated: IntCounter,

    /// Balance updates by method
    pub balance_updates: IntCounterVec,

    /// Transfers by outcome
    pub transfers: IntCounterVec,

    /// Lock waits that timed out
    pub contention: IntCounter,

    /// Operation latency
    pub operation_duration: HistogramVec,

    registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let documents_allocated = IntCounter::new(
            "tally_documents_allocated_total",
            "Documents committed by the sequence allocator",
        )?;
        registry.register(Box::new(documents_allocated.clone()))?;

        let balance_updates = IntCounterVec::new(
            Opts::new("tally_balance_updates_total", "Committed balance updates"),
            &["method"],
        )?;
        registry.register(Box::new(balance_updates.clone()))?;

        let transfers = IntCounterVec::new(
            Opts::new("tally_transfers_total", "Transfers by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(transfers.clone()))?;

        let contention = IntCounter::new(
            "tally_contention_total",
            "Operations that timed out waiting on a lock",
        )?;
        registry.register(Box::new(contention.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "tally_operation_duration_seconds",
                "Latency of core operations",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            documents_allocated,
            balance_updates,
            transfers,
            contention,
            operation_duration,
            registry,
        })
    }

    /// Record a committed allocation
    pub fn record_allocation(&self) {
        self.documents_allocated.inc();
    }

    /// Record a committed balance update
    pub fn record_balance_update(&self, method: &str) {
        self.balance_updates.with_label_values(&[method]).inc();
    }

    /// Record a transfer outcome
    pub fn record_transfer(&self, outcome: &str) {
        self.transfers.with_label_values(&[outcome]).inc();
    }

    /// Count the error if it is a lock timeout
    pub fn record_error(&self, err: &Error) {
        if err.is_retryable() {
            self.contention.inc();
        }
    }

    /// Record operation latency
    pub fn record_duration(&self, operation: &str, duration_seconds: f64) {
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation_is_repeatable() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        assert_eq!(first.documents_allocated.get(), 0);
        assert_eq!(second.contention.get(), 0);
    }

    #[test]
    fn test_record_balance_update() {
        let metrics = Metrics::new().unwrap();
        metrics.record_balance_update("with-transaction");
        metrics.record_balance_update("with-transaction");
        metrics.record_balance_update("without-transaction");

        assert_eq!(
            metrics
                .balance_updates
                .with_label_values(&["with-transaction"])
                .get(),
            2
        );
    }

    #[test]
    fn test_only_contention_errors_counted() {
        let metrics = Metrics::new().unwrap();
        metrics.record_error(&Error::Contention("lock timeout".into()));
        metrics.record_error(&Error::StoreUnavailable("down".into()));
        assert_eq!(metrics.contention.get(), 1);
    }

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_allocation();
        metrics.record_duration("allocate", 0.002);

        let text = metrics.render();
        assert!(text.contains("tally_documents_allocated_total 1"));
        assert!(text.contains("tally_operation_duration_seconds"));
    }
}
