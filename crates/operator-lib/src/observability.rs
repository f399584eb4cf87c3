//! Observability for the operator
//!
//! Provides:
//! - Prometheus metrics (reconcile latency and outcomes, phase transitions, queue depth)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

static GLOBAL_METRICS: OnceLock<OperatorMetricsInner> = OnceLock::new();

struct OperatorMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconciliations_total: IntCounterVec,
    phase_transitions_total: IntCounterVec,
    child_pods_created_total: IntCounter,
    queue_retries_total: IntCounter,
    queue_depth: IntGauge,
    workers_busy: IntGauge,
}

impl OperatorMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "podmonitor_reconcile_duration_seconds",
                "Time spent in a single reconciliation pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconciliations_total: register_int_counter_vec!(
                "podmonitor_reconciliations_total",
                "Reconciliation passes by outcome",
                &["result"]
            )
            .expect("Failed to register reconciliations_total"),

            phase_transitions_total: register_int_counter_vec!(
                "podmonitor_phase_transitions_total",
                "PodMonitor phase changes written to the store",
                &["from", "to"]
            )
            .expect("Failed to register phase_transitions_total"),

            child_pods_created_total: register_int_counter!(
                "podmonitor_child_pods_created_total",
                "Monitor child pods created"
            )
            .expect("Failed to register child_pods_created_total"),

            queue_retries_total: register_int_counter!(
                "podmonitor_queue_retries_total",
                "Keys re-added with backoff after a failed sync"
            )
            .expect("Failed to register queue_retries_total"),

            queue_depth: register_int_gauge!(
                "podmonitor_queue_depth",
                "Keys waiting in the work queue"
            )
            .expect("Failed to register queue_depth"),

            workers_busy: register_int_gauge!(
                "podmonitor_workers_busy",
                "Workers currently reconciling a key"
            )
            .expect("Failed to register workers_busy"),
        }
    }
}

/// Outcome label for `podmonitor_reconciliations_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    Retry,
    Dropped,
}

impl ReconcileResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Retry => "retry",
            ReconcileResult::Dropped => "dropped",
        }
    }
}

/// Handle to the process-wide metrics.
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct OperatorMetrics {
    _private: (),
}

impl Default for OperatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OperatorMetricsInner {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new)
    }

    pub fn observe_reconcile(&self, elapsed: Duration, result: ReconcileResult) {
        let inner = self.inner();
        inner
            .reconcile_duration_seconds
            .observe(elapsed.as_secs_f64());
        inner
            .reconciliations_total
            .with_label_values(&[result.as_str()])
            .inc();
    }

    pub fn inc_phase_transition(&self, from: &str, to: &str) {
        self.inner()
            .phase_transitions_total
            .with_label_values(&[from, to])
            .inc();
    }

    pub fn inc_child_pods_created(&self) {
        self.inner().child_pods_created_total.inc();
    }

    pub fn inc_queue_retries(&self) {
        self.inner().queue_retries_total.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.inner().queue_depth.set(depth as i64);
    }

    pub fn worker_started(&self) {
        self.inner().workers_busy.inc();
    }

    pub fn worker_finished(&self) {
        self.inner().workers_busy.dec();
    }

    /// Total reconciliations recorded with `result`
    pub fn reconciliations(&self, result: ReconcileResult) -> u64 {
        self.inner()
            .reconciliations_total
            .with_label_values(&[result.as_str()])
            .get()
    }
}

/// Fixed-shape lifecycle logs for the operator
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, workers: usize) {
        info!(
            event = "operator_started",
            component = %self.component,
            version = %version,
            workers = workers,
            "PodMonitor operator started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "operator_shutdown",
            component = %self.component,
            reason = %reason,
            "PodMonitor operator shutting down"
        );
    }

    pub fn log_phase_transition(&self, resource: &str, from: &str, to: &str, reason: &str) {
        if reason.is_empty() {
            info!(
                event = "phase_transition",
                component = %self.component,
                resource = %resource,
                from = %from,
                to = %to,
                "PodMonitor phase changed"
            );
        } else {
            warn!(
                event = "phase_transition",
                component = %self.component,
                resource = %resource,
                from = %from,
                to = %to,
                reason = %reason,
                "PodMonitor phase changed"
            );
        }
    }

    pub fn log_child_created(&self, resource: &str, pod: &str, sample_interval_secs: i32) {
        info!(
            event = "child_pod_created",
            component = %self.component,
            resource = %resource,
            pod = %pod,
            sample_interval_secs = sample_interval_secs,
            "Created monitor child pod"
        );
    }

    pub fn log_sync_error(&self, key: &str, error: &str, retry_in: Duration, attempts: u32) {
        warn!(
            event = "sync_failed",
            component = %self.component,
            key = %key,
            error = %error,
            retry_in_ms = retry_in.as_millis() as u64,
            attempts = attempts,
            "Sync failed, requeued with backoff"
        );
    }

    pub fn log_dropped_key(&self, key: &str, error: &str) {
        error!(
            event = "key_dropped",
            component = %self.component,
            key = %key,
            error = %error,
            "Dropping key that cannot be reconciled"
        );
    }
}
