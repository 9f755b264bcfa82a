//! Prometheus metrics for the GCP infrastructure controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `gcp_infrastructure_reconcile_duration_seconds` (histogram): operation duration labeled by controller and operation.
//! - `gcp_infrastructure_reconcile_errors_total` (counter): errors labeled by controller and kind.
//! - `gcp_infrastructure_engine_selections_total` (counter): engine choices labeled by operation and engine.
//! - `gcp_infrastructure_operations_total` (counter): finished operations labeled by operation and state.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile duration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "infrastructure"
    pub controller: String,
    /// One of reconcile, delete, restore, migrate
    pub operation: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "kube", "gcp", "terraformer"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EngineLabels {
    pub operation: String,
    /// "terraform" or "flow"
    pub engine: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
    /// "Succeeded" or "Error"
    pub state: String,
}

/// Histogram tracking operation duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // Terraformer runs take minutes: 100ms .. ~55min across 16 buckets.
        Histogram::new(exponential_buckets(0.1, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static ENGINE_SELECTIONS_TOTAL: Lazy<Family<EngineLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static OPERATIONS_TOTAL: Lazy<Family<OperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "gcp_infrastructure_reconcile_duration_seconds",
        "Duration of infrastructure operations in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "gcp_infrastructure_reconcile_errors_total",
        "Total number of infrastructure operation errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "gcp_infrastructure_engine_selections_total",
        "Reconcile engine chosen per operation",
        ENGINE_SELECTIONS_TOTAL.clone(),
    );
    registry.register(
        "gcp_infrastructure_operations_total",
        "Finished infrastructure operations by outcome",
        OPERATIONS_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, operation: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
        operation: operation.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_engine_selection(operation: &str, engine: &str) {
    let labels = EngineLabels {
        operation: operation.to_string(),
        engine: engine.to_string(),
    };
    ENGINE_SELECTIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_operation(operation: &str, state: &str) {
    let labels = OperationLabels {
        operation: operation.to_string(),
        state: state.to_string(),
    };
    OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_exports_metrics() {
        inc_engine_selection("reconcile", "flow");
        inc_reconcile_error("infrastructure", "gcp");
        observe_reconcile_duration_seconds("infrastructure", "reconcile", 1.5);
        inc_operation("reconcile", "Succeeded");

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();

        assert!(buffer.contains("gcp_infrastructure_engine_selections_total"));
        assert!(buffer.contains(r#"engine="flow""#));
        assert!(buffer.contains("gcp_infrastructure_reconcile_errors_total"));
        assert!(buffer.contains("gcp_infrastructure_reconcile_duration_seconds"));
        assert!(buffer.contains(r#"state="Succeeded""#));
    }

    #[test]
    fn test_engine_selection_counts() {
        let labels = EngineLabels {
            operation: "migrate".to_string(),
            engine: "flow".to_string(),
        };
        let before = ENGINE_SELECTIONS_TOTAL.get_or_create(&labels).get();
        inc_engine_selection("migrate", "flow");
        assert_eq!(ENGINE_SELECTIONS_TOTAL.get_or_create(&labels).get(), before + 1);
    }
}
