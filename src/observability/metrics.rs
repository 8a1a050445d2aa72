use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the deduplication engine. The macros are no-ops
/// until a recorder is installed, so calling through here is always safe.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn record_claim(&self) {
        counter!("dedup_claims_total").increment(1);
    }

    pub fn record_replay(&self) {
        counter!("dedup_replays_total").increment(1);
    }

    pub fn record_completed(&self) {
        counter!("dedup_completed_total").increment(1);
    }

    pub fn record_conflict(&self, kind: &str) {
        counter!("dedup_conflicts_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_missing_key(&self) {
        counter!("dedup_missing_key_total").increment(1);
    }

    pub fn record_operation_failure(&self) {
        counter!("dedup_operation_failures_total").increment(1);
    }

    pub fn record_store_op(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("dedup_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("dedup_store_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_sweep(&self, swept: u64) {
        counter!("dedup_sweeps_total").increment(1);
        histogram!("dedup_swept_records").record(swept as f64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_metrics();
        handle
    });

    METRICS.get_or_init(Metrics::new);

    handle.clone()
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("dedup_claims_total", Unit::Count, "Keys claimed for first execution");
    describe_counter!("dedup_replays_total", Unit::Count, "Stored responses replayed for duplicates");
    describe_counter!("dedup_completed_total", Unit::Count, "Operations executed and committed");
    describe_counter!("dedup_conflicts_total", Unit::Count, "Rejected duplicates by conflict kind");
    describe_counter!("dedup_missing_key_total", Unit::Count, "Eligible requests lacking an idempotency key");
    describe_counter!("dedup_operation_failures_total", Unit::Count, "Underlying operations that failed and were abandoned");

    describe_counter!("dedup_store_operations_total", Unit::Count, "Record store operations");
    describe_histogram!("dedup_store_operation_duration_ms", Unit::Milliseconds, "Record store operation latency in milliseconds");

    describe_counter!("dedup_sweeps_total", Unit::Count, "Expired-record sweep runs");
    describe_histogram!("dedup_swept_records", Unit::Count, "Records removed per sweep");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 10.0);
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert!(metrics.initialized);
    }

    #[test]
    fn test_recording_without_recorder_is_safe() {
        let metrics = Metrics::new();
        metrics.record_claim();
        metrics.record_replay();
        metrics.record_conflict("payload");
        metrics.record_store_op("try_create", 0.3, true);
        metrics.record_sweep(2);
    }
}
