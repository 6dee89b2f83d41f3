use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all snapshot hub metrics
const PREFIX: &str = "snapshot_hub";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Pipeline phases
    pub static ref PIPELINE_PHASES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_pipeline_phases_total"), "Pipeline phases run, by step and outcome"),
        &["step", "status"]
    ).expect("Failed to create pipeline_phases_total metric");

    pub static ref PIPELINE_PHASE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_pipeline_phase_duration_seconds"),
            "Pipeline phase duration in seconds"
        )
        .buckets(vec![0.1, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 7200.0]),
        &["step"]
    ).expect("Failed to create pipeline_phase_duration_seconds metric");

    pub static ref PIPELINE_PHASES_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_pipeline_phases_running"),
        "Pipeline phases currently running"
    ).expect("Failed to create pipeline_phases_running metric");

    // Job audit
    pub static ref STALE_JOBS_CANCELLED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_stale_jobs_cancelled_total"),
        "Jobs left in progress by a previous process and cancelled by the audit"
    ).expect("Failed to create stale_jobs_cancelled_total metric");

    // Backends
    pub static ref SNAPSHOT_POLLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_snapshot_polls_total"), "Snapshot state polls, by observed state"),
        &["state"]
    ).expect("Failed to create snapshot_polls_total metric");

    pub static ref PROVISIONED_RESOURCES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_provisioned_resources_total"), "Buckets and repositories created"),
        &["kind"]
    ).expect("Failed to create provisioned_resources_total metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Errors mean "already registered", which happens across tests
    let _ = REGISTRY.register(Box::new(PIPELINE_PHASES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PIPELINE_PHASE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(PIPELINE_PHASES_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(STALE_JOBS_CANCELLED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SNAPSHOT_POLLS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROVISIONED_RESOURCES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_phase_started() {
    PIPELINE_PHASES_RUNNING.inc();
}

/// Record the outcome of a pipeline phase
pub fn record_phase_finished(step: &str, status: &str, duration: Duration) {
    PIPELINE_PHASES_RUNNING.dec();
    PIPELINE_PHASES_TOTAL
        .with_label_values(&[step, status])
        .inc();
    PIPELINE_PHASE_DURATION_SECONDS
        .with_label_values(&[step])
        .observe(duration.as_secs_f64());
}

pub fn record_stale_jobs_cancelled(count: usize) {
    STALE_JOBS_CANCELLED_TOTAL.inc_by(count as f64);
}

pub fn record_snapshot_poll(state: &str) {
    SNAPSHOT_POLLS_TOTAL.with_label_values(&[state]).inc();
}

/// `kind` is "bucket" or "repository"
pub fn record_provisioned(kind: &str) {
    PROVISIONED_RESOURCES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok());
            if let Some(kb) = rss_kb {
                PROCESS_MEMORY_BYTES.set(kb * 1024.0);
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family_names() -> Vec<String> {
        REGISTRY
            .gather()
            .iter()
            .map(|m| m.get_name().to_string())
            .collect()
    }

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        init_metrics();

        let names = family_names();
        assert!(names.contains(&"snapshot_hub_stale_jobs_cancelled_total".to_string()));
    }

    #[test]
    fn test_record_phase() {
        init_metrics();

        record_phase_started();
        record_phase_finished("snapshot", "success", Duration::from_secs(3));

        let count = PIPELINE_PHASES_TOTAL
            .with_label_values(&["snapshot", "success"])
            .get();
        assert!(count >= 1.0);
        assert!(family_names().contains(&"snapshot_hub_pipeline_phase_duration_seconds".to_string()));
    }

    #[test]
    fn test_record_backend_events() {
        init_metrics();

        record_snapshot_poll("IN_PROGRESS");
        record_provisioned("bucket");

        assert!(SNAPSHOT_POLLS_TOTAL.with_label_values(&["IN_PROGRESS"]).get() >= 1.0);
        assert!(PROVISIONED_RESOURCES_TOTAL.with_label_values(&["bucket"]).get() >= 1.0);
    }
}
