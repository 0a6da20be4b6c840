//! Metrics module for subscription-service.
//! Provides Prometheus metrics for the renewal jobs, status transitions and order dispatch.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Scheduler job ticks by outcome
pub static JOB_TICKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Scheduler job tick duration
pub static JOB_TICK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Periods inserted by the generator
pub static PERIODS_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription status transitions by transition and outcome
pub static STATUS_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invariant violations by check
pub static INVARIANT_VIOLATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Order workflow commands by command and outcome
pub static ORDER_COMMANDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// History snapshots by outcome
pub static HISTORY_SNAPSHOTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    JOB_TICKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_job_ticks_total", "Scheduler job ticks by outcome"),
            &["job", "outcome"]
        )
        .expect("Failed to register JOB_TICKS_TOTAL")
    });

    JOB_TICK_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "subscription_job_tick_duration_seconds",
                "Scheduler job tick duration",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["job"]
        )
        .expect("Failed to register JOB_TICK_DURATION")
    });

    PERIODS_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_periods_generated_total",
                "Periods inserted by the generator, by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register PERIODS_GENERATED_TOTAL")
    });

    STATUS_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_status_transitions_total",
                "Status transitions by transition and outcome"
            ),
            &["transition", "outcome"]
        )
        .expect("Failed to register STATUS_TRANSITIONS_TOTAL")
    });

    INVARIANT_VIOLATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_invariant_violations_total",
                "Invariant violations detected by post-write checks"
            ),
            &["check"]
        )
        .expect("Failed to register INVARIANT_VIOLATIONS_TOTAL")
    });

    ORDER_COMMANDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_order_commands_total",
                "Order workflow commands by command and outcome"
            ),
            &["command", "outcome"]
        )
        .expect("Failed to register ORDER_COMMANDS_TOTAL")
    });

    HISTORY_SNAPSHOTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_history_snapshots_total",
                "Usage history snapshots by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register HISTORY_SNAPSHOTS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a job tick.
pub fn record_job_tick(job: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = JOB_TICKS_TOTAL.get() {
        counter.with_label_values(&[job, outcome]).inc();
    }
    if let Some(histogram) = JOB_TICK_DURATION.get() {
        histogram.with_label_values(&[job]).observe(duration_secs);
    }
}

/// Record a generator insert attempt.
pub fn record_period_generated(outcome: &str) {
    if let Some(counter) = PERIODS_GENERATED_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a status transition attempt.
pub fn record_status_transition(transition: &str, outcome: &str) {
    if let Some(counter) = STATUS_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[transition, outcome]).inc();
    }
}

/// Record an invariant violation.
pub fn record_invariant_violation(check: &str) {
    if let Some(counter) = INVARIANT_VIOLATIONS_TOTAL.get() {
        counter.with_label_values(&[check]).inc();
    }
}

/// Record an order workflow command.
pub fn record_order_command(command: &str, outcome: &str) {
    if let Some(counter) = ORDER_COMMANDS_TOTAL.get() {
        counter.with_label_values(&[command, outcome]).inc();
    }
}

/// Record a history snapshot attempt.
pub fn record_history_snapshot(outcome: &str) {
    if let Some(counter) = HISTORY_SNAPSHOTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
