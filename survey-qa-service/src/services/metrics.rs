//! Prometheus metrics for survey-qa-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    CounterVec, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

/// Runs by outcome: completed, timed_out, failed.
pub static RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("qa_runs_total", "Total number of runs", &["outcome"])
        .expect("Failed to register qa_runs_total")
});

/// Wall-clock duration of runs that reached an outcome.
pub static RUN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "qa_run_duration_seconds",
        "Run duration in seconds",
        &["outcome"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("Failed to register qa_run_duration_seconds")
});

pub static RUNS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("qa_runs_in_flight", "Number of runs currently executing")
        .expect("Failed to register qa_runs_in_flight")
});

/// Tokens by model and type (prompt, completion).
pub static LLM_TOKENS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "qa_llm_tokens_total",
        "Total LLM tokens metered",
        &["model", "type"]
    )
    .expect("Failed to register qa_llm_tokens_total")
});

pub static LLM_COST_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "qa_llm_cost_usd_total",
        "Total metered LLM cost in USD",
        &["model"]
    )
    .expect("Failed to register qa_llm_cost_usd_total")
});

/// Survey database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "qa_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register qa_db_query_duration_seconds")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&RUNS_TOTAL);
    Lazy::force(&RUN_DURATION);
    Lazy::force(&RUNS_IN_FLIGHT);
    Lazy::force(&LLM_TOKENS_TOTAL);
    Lazy::force(&LLM_COST_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);

    tracing::info!("Prometheus metrics initialized");
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode metrics");
            format!("# Failed to encode metrics: {}\n", e)
        })
}

// Helper functions for recording metrics

/// Record a run that reached an outcome.
pub fn record_run(outcome: &str, duration_secs: f64) {
    RUNS_TOTAL.with_label_values(&[outcome]).inc();
    RUN_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn inc_runs_in_flight() {
    RUNS_IN_FLIGHT.inc();
}

pub fn dec_runs_in_flight() {
    RUNS_IN_FLIGHT.dec();
}

/// Record metered tokens and their cost. `kind` is `prompt` or `completion`.
pub fn record_llm_usage(model: &str, kind: &str, tokens: u64, cost: f64) {
    LLM_TOKENS_TOTAL
        .with_label_values(&[model, kind])
        .inc_by(tokens);
    if cost > 0.0 {
        LLM_COST_TOTAL.with_label_values(&[model]).inc_by(cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_text_contains_recorded_series() {
        init_metrics();
        record_run("completed", 0.2);
        record_llm_usage("test.model-v1", "prompt", 12, 0.003);

        let text = get_metrics();

        assert!(text.contains("qa_runs_total"));
        assert!(text.contains("qa_llm_tokens_total{model=\"test.model-v1\",type=\"prompt\"}"));
        assert!(text.contains("qa_llm_cost_usd_total"));
    }
}
