//! Metrics for the sync engine
//!
//! Steady-state failures are never fatal, so these instruments (together
//! with logs) are how persistent reconcile problems become visible.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("vkube"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconcile duration
///
/// Labels:
/// - `syncer`: syncer or controller name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("vkube_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `syncer`: syncer or controller name
/// - `error_type`: conflict, ownership, kube, ...
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vkube_reconcile_errors_total")
        .with_description("Total number of failed reconcile passes")
        .with_unit("{errors}")
        .build()
});

/// Counter of panics recovered by the work queue
pub static RECONCILE_PANICS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vkube_reconcile_panics_total")
        .with_description("Total number of reconcile passes that panicked")
        .with_unit("{panics}")
        .build()
});

/// Number of keys waiting in a work queue
///
/// Labels:
/// - `syncer`: syncer name
pub static QUEUE_DEPTH: Lazy<UpDownCounter<i64>> = Lazy::new(|| {
    METER
        .i64_up_down_counter("vkube_queue_depth")
        .with_description("Keys queued for reconcile")
        .with_unit("{keys}")
        .build()
});

// ============================================================================
// Write Metrics
// ============================================================================

/// Counter of writes issued by syncers
///
/// Labels:
/// - `syncer`: syncer name
/// - `cluster`: virtual, physical
/// - `operation`: create, update, update_status, delete
pub static OBJECT_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vkube_object_writes_total")
        .with_description("Total number of object writes issued by syncers")
        .with_unit("{writes}")
        .build()
});

/// Which side of the sync a write targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSide {
    /// Tenant-facing API
    Virtual,
    /// Shared host cluster
    Physical,
}

impl ClusterSide {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterSide::Virtual => "virtual",
            ClusterSide::Physical => "physical",
        }
    }
}

/// Record a single write
pub fn record_write(syncer: &str, side: ClusterSide, operation: &'static str) {
    OBJECT_WRITES.add(
        1,
        &[
            KeyValue::new("syncer", syncer.to_string()),
            KeyValue::new("cluster", side.as_str()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Adjust the queue depth gauge of a syncer by `delta`
pub fn record_queue_depth(syncer: &str, delta: i64) {
    QUEUE_DEPTH.add(delta, &[KeyValue::new("syncer", syncer.to_string())]);
}

/// Record a panic recovered from a reconcile
pub fn record_panic(syncer: &str) {
    RECONCILE_PANICS.add(1, &[KeyValue::new("syncer", syncer.to_string())]);
}

/// Times one reconcile pass
pub struct ReconcileTimer {
    syncer: String,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile for the given syncer
    pub fn start(syncer: impl Into<String>) -> Self {
        Self {
            syncer: syncer.into(),
            start: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("syncer", self.syncer),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record failed completion
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("syncer", self.syncer.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("syncer", self.syncer),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_side_labels() {
        assert_eq!(ClusterSide::Virtual.as_str(), "virtual");
        assert_eq!(ClusterSide::Physical.as_str(), "physical");
    }

    #[test]
    fn test_reconcile_timer_records_without_provider() {
        ReconcileTimer::start("configmaps").success();
        ReconcileTimer::start("configmaps").error("conflict");
        record_write("configmaps", ClusterSide::Physical, "create");
        record_queue_depth("configmaps", 1);
        record_queue_depth("configmaps", -1);
        record_panic("configmaps");
    }
}
