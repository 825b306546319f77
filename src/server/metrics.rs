//! Prometheus metrics for the elastic IP controller
//!
//! - Reconciliation counts and durations per reconciler
//! - Elastic IP reassignments

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Reconciler label for node passes
pub const NODES: &str = "nodes";
/// Reconciler label for service passes
pub const SERVICES: &str = "services";

/// Controller metrics registry
///
/// Clone is cheap (the collectors are reference counted).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Reconciliations by reconciler and result (success, error, skipped)
    pub reconciliations_total: IntCounterVec,
    pub reconciliation_duration_seconds: HistogramVec,
    /// Elastic IP moves by result (success, error)
    pub reassignments_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new("eip_reconciliations_total", "Total number of reconciliations"),
            &["reconciler", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        // Dominated by the Metal API and the 5s probe timeout
        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "eip_reconciliation_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["reconciler"],
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let reassignments_total = IntCounterVec::new(
            Opts::new(
                "eip_reassignments_total",
                "Total number of elastic IP reassignment attempts",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reassignments_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            reassignments_total,
        })
    }

    pub fn record_reconciliation_success(&self, reconciler: &str, duration_secs: f64) {
        self.record(reconciler, "success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, reconciler: &str, duration_secs: f64) {
        self.record(reconciler, "error", duration_secs);
    }

    /// Record a pass that did not run because another one was in flight
    pub fn record_reconciliation_skipped(&self, reconciler: &str) {
        self.reconciliations_total
            .with_label_values(&[reconciler, "skipped"])
            .inc();
    }

    pub fn record_reassignment(&self, succeeded: bool) {
        let result = if succeeded { "success" } else { "error" };
        self.reassignments_total.with_label_values(&[result]).inc();
    }

    fn record(&self, reconciler: &str, result: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[reconciler, result])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[reconciler])
            .observe(duration_secs);
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle for use across the controller
pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
