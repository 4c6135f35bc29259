//! Observability metrics for the constraint engine.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_admissions_total` | Counter | `mode` | Admission decisions (sync, async) |
//! | `sluice_consumer_transitions_total` | Counter | `to_state`, `reason` | Consumer state transitions |
//! | `sluice_promotions_total` | Counter | - | Consumers promoted from the queue |
//! | `sluice_rejections_total` | Counter | `reason` | Consumers rejected |
//! | `sluice_conflict_retries_total` | Counter | `operation` | Optimistic commit conflicts |
//! | `sluice_resume_signals_total` | Counter | `outcome` | Resume signals delivered |
//! | `sluice_queue_depth` | Gauge | `unit` | BLOCKED consumers per resource unit |
//! | `sluice_operation_duration_seconds` | Histogram | `operation` | Engine operation latency |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sluice_flow::metrics::ConstraintMetrics;
//!
//! let metrics = ConstraintMetrics::new();
//! metrics.record_admission("sync");
//! metrics.record_promotions(2);
//! ```
//!
//! Metrics go through the `metrics` crate facade; install any recorder (for
//! example a Prometheus exporter) in the hosting binary.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Admission decisions by mode.
    pub const ADMISSIONS_TOTAL: &str = "sluice_admissions_total";
    /// Counter: Consumer state transitions.
    pub const CONSUMER_TRANSITIONS_TOTAL: &str = "sluice_consumer_transitions_total";
    /// Counter: Consumers promoted from BLOCKED to ACTIVE.
    pub const PROMOTIONS_TOTAL: &str = "sluice_promotions_total";
    /// Counter: Consumers rejected.
    pub const REJECTIONS_TOTAL: &str = "sluice_rejections_total";
    /// Counter: Optimistic concurrency conflicts.
    pub const CONFLICT_RETRIES_TOTAL: &str = "sluice_conflict_retries_total";
    /// Counter: Resume signals delivered to the engine.
    pub const RESUME_SIGNALS_TOTAL: &str = "sluice_resume_signals_total";
    /// Gauge: BLOCKED consumers on a unit.
    pub const QUEUE_DEPTH: &str = "sluice_queue_depth";
    /// Histogram: Engine operation latency in seconds.
    pub const OPERATION_DURATION_SECONDS: &str = "sluice_operation_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Execution mode (sync, async).
    pub const MODE: &str = "mode";
    /// Target consumer state.
    pub const TO_STATE: &str = "to_state";
    /// Transition reason.
    pub const REASON: &str = "reason";
    /// Engine operation name.
    pub const OPERATION: &str = "operation";
    /// Resume outcome (promoted, rejected, expired).
    pub const OUTCOME: &str = "outcome";
    /// Resource unit key (`constraint_id/unit`).
    pub const UNIT: &str = "unit";
}

/// High-level interface for recording constraint metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ConstraintMetrics;

impl ConstraintMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records an admission decision.
    pub fn record_admission(&self, mode: &str) {
        counter!(names::ADMISSIONS_TOTAL, labels::MODE => mode.to_string()).increment(1);
    }

    /// Records a consumer state transition.
    pub fn record_transition(&self, to_state: &str, reason: &str) {
        counter!(
            names::CONSUMER_TRANSITIONS_TOTAL,
            labels::TO_STATE => to_state.to_string(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Records promoted consumers.
    pub fn record_promotions(&self, count: usize) {
        if count > 0 {
            counter!(names::PROMOTIONS_TOTAL).increment(count as u64);
        }
    }

    /// Records rejected consumers.
    pub fn record_rejections(&self, reason: &str, count: usize) {
        if count > 0 {
            counter!(names::REJECTIONS_TOTAL, labels::REASON => reason.to_string())
                .increment(count as u64);
        }
    }

    /// Records an optimistic concurrency conflict.
    pub fn record_conflict(&self, operation: &str) {
        counter!(
            names::CONFLICT_RETRIES_TOTAL,
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Records a delivered resume signal.
    pub fn record_resume_signal(&self, outcome: &str) {
        counter!(
            names::RESUME_SIGNALS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Sets the queue depth of a resource unit.
    #[allow(clippy::cast_precision_loss)] // Queue depths are small
    pub fn set_queue_depth(&self, unit: &str, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::UNIT => unit.to_string(),
        )
        .set(depth as f64);
    }

    /// Records an operation duration.
    pub fn observe_operation_duration(&self, operation: &str, duration: Duration) {
        histogram!(
            names::OPERATION_DURATION_SECONDS,
            labels::OPERATION => operation.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Guard that records elapsed time when dropped.
///
/// ## Example
///
/// ```rust
/// use sluice_flow::metrics::{ConstraintMetrics, TimingGuard};
///
/// let metrics = ConstraintMetrics::new();
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_operation_duration("release", duration);
///     });
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records `operation` latency.
#[must_use]
pub fn time_operation(operation: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        histogram!(
            names::OPERATION_DURATION_SECONDS,
            labels::OPERATION => operation,
        )
        .record(duration.as_secs_f64());
    })
}
