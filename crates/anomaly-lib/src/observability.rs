//! Observability infrastructure for the detection engine
//!
//! Provides:
//! - Prometheus metrics (detection and training latency, counters, threshold gauges)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{Anomaly, Severity};

/// Histogram buckets for per-item detection latency (in seconds)
const DETECTION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Histogram buckets for training runs (in seconds)
const TRAINING_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DetectorMetricsInner> = OnceLock::new();

struct DetectorMetricsInner {
    detection_latency_seconds: Histogram,
    training_latency_seconds: Histogram,
    detections_total: IntCounter,
    anomalies_total: IntCounterVec,
    invalid_inputs_total: IntCounter,
    model_failures_total: IntCounterVec,
    anomaly_score_threshold: Gauge,
    confidence_threshold: Gauge,
    baseline_keys: IntGauge,
    queue_depth: IntGauge,
    queue_failures_total: IntCounter,
    batch_throughput: Gauge,
}

impl DetectorMetricsInner {
    fn new() -> Self {
        Self {
            detection_latency_seconds: register_histogram!(
                "anomaly_detector_detection_latency_seconds",
                "Time spent scoring a single data point",
                DETECTION_BUCKETS.to_vec()
            )
            .expect("Failed to register detection_latency_seconds"),

            training_latency_seconds: register_histogram!(
                "anomaly_detector_training_latency_seconds",
                "Time spent retraining the model ensemble",
                TRAINING_BUCKETS.to_vec()
            )
            .expect("Failed to register training_latency_seconds"),

            detections_total: register_int_counter!(
                "anomaly_detector_detections_total",
                "Total number of data points scored"
            )
            .expect("Failed to register detections_total"),

            anomalies_total: register_int_counter_vec!(
                "anomaly_detector_anomalies_total",
                "Total number of anomalies emitted",
                &["severity"]
            )
            .expect("Failed to register anomalies_total"),

            invalid_inputs_total: register_int_counter!(
                "anomaly_detector_invalid_inputs_total",
                "Data points skipped for lacking a finite primary value"
            )
            .expect("Failed to register invalid_inputs_total"),

            model_failures_total: register_int_counter_vec!(
                "anomaly_detector_model_failures_total",
                "Model predictions that failed and scored zero",
                &["model"]
            )
            .expect("Failed to register model_failures_total"),

            anomaly_score_threshold: register_gauge!(
                "anomaly_detector_anomaly_score_threshold",
                "Current anomaly score threshold (0-100)"
            )
            .expect("Failed to register anomaly_score_threshold"),

            confidence_threshold: register_gauge!(
                "anomaly_detector_confidence_threshold",
                "Current confidence threshold (0-1)"
            )
            .expect("Failed to register confidence_threshold"),

            baseline_keys: register_int_gauge!(
                "anomaly_detector_baseline_keys",
                "Number of baseline keys currently tracked"
            )
            .expect("Failed to register baseline_keys"),

            queue_depth: register_int_gauge!(
                "anomaly_detector_queue_depth",
                "Items waiting in the processing queue"
            )
            .expect("Failed to register queue_depth"),

            queue_failures_total: register_int_counter!(
                "anomaly_detector_queue_failures_total",
                "Queued items whose detection returned an error"
            )
            .expect("Failed to register queue_failures_total"),

            batch_throughput: register_gauge!(
                "anomaly_detector_batch_throughput_items_per_second",
                "Throughput of the most recent batch"
            )
            .expect("Failed to register batch_throughput"),
        }
    }
}

/// Handle to the process-wide detector metrics
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct DetectorMetrics {
    _private: (),
}

impl Default for DetectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorMetrics {
    /// Create a handle, registering the collectors on first use
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DetectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DetectorMetricsInner {
        GLOBAL_METRICS.get_or_init(DetectorMetricsInner::new)
    }

    /// Record the time taken to score one data point
    pub fn observe_detection_latency(&self, duration_secs: f64) {
        self.inner().detection_latency_seconds.observe(duration_secs);
    }

    /// Record the duration of a training run
    pub fn observe_training_latency(&self, duration_secs: f64) {
        self.inner().training_latency_seconds.observe(duration_secs);
    }

    /// Increment scored data points counter
    pub fn inc_detections(&self) {
        self.inner().detections_total.inc();
    }

    /// Increment emitted anomalies counter for a severity
    pub fn inc_anomalies(&self, severity: Severity) {
        self.inner()
            .anomalies_total
            .with_label_values(&[severity.as_str()])
            .inc();
    }

    /// Increment skipped non-finite inputs counter
    pub fn inc_invalid_inputs(&self) {
        self.inner().invalid_inputs_total.inc();
    }

    /// Increment prediction failures counter for a model
    pub fn inc_model_failures(&self, model: &str) {
        self.inner()
            .model_failures_total
            .with_label_values(&[model])
            .inc();
    }

    /// Update the global threshold gauges
    pub fn set_thresholds(&self, anomaly_score: f64, confidence: f64) {
        self.inner().anomaly_score_threshold.set(anomaly_score);
        self.inner().confidence_threshold.set(confidence);
    }

    /// Update tracked baseline keys count
    pub fn set_baseline_keys(&self, count: i64) {
        self.inner().baseline_keys.set(count);
    }

    /// Update processing queue depth
    pub fn set_queue_depth(&self, depth: i64) {
        self.inner().queue_depth.set(depth);
    }

    /// Increment failed queue items counter
    pub fn inc_queue_failures(&self) {
        self.inner().queue_failures_total.inc();
    }

    /// Update throughput of the latest batch
    pub fn set_batch_throughput(&self, items_per_sec: f64) {
        self.inner().batch_throughput.set(items_per_sec);
    }
}

/// Structured logger for detector events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        let severity = anomaly.score.severity;
        match severity {
            Severity::Critical | Severity::High => {
                warn!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    anomaly_id = %anomaly.id,
                    anomaly_type = %anomaly.kind,
                    source = %anomaly.data.source,
                    data_type = %anomaly.data.data_type(),
                    score = anomaly.score.score,
                    confidence = anomaly.score.confidence,
                    severity = %severity.as_str(),
                    reason = %anomaly.explanation.primary_reason,
                    "High-severity anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    anomaly_id = %anomaly.id,
                    anomaly_type = %anomaly.kind,
                    source = %anomaly.data.source,
                    data_type = %anomaly.data.data_type(),
                    score = anomaly.score.score,
                    confidence = anomaly.score.confidence,
                    severity = %severity.as_str(),
                    reason = %anomaly.explanation.primary_reason,
                    "Anomaly detected"
                );
            }
        }
    }

    pub fn log_thresholds_adjusted(
        &self,
        false_positive_rate: f64,
        old_score: f64,
        new_score: f64,
        old_confidence: f64,
        new_confidence: f64,
    ) {
        info!(
            event = "thresholds_adjusted",
            instance = %self.instance,
            false_positive_rate = false_positive_rate,
            old_anomaly_score = old_score,
            new_anomaly_score = new_score,
            old_confidence = old_confidence,
            new_confidence = new_confidence,
            "Raised detection thresholds after false-positive feedback"
        );
    }

    pub fn log_model_trained(&self, model: &str, samples: usize, duration_ms: u64, false_positive_rate: f64) {
        info!(
            event = "model_trained",
            instance = %self.instance,
            model = %model,
            samples = samples,
            duration_ms = duration_ms,
            false_positive_rate = false_positive_rate,
            "Model retrained"
        );
    }

    pub fn log_training_failed(&self, model: &str, error: &str) {
        warn!(
            event = "model_training_failed",
            instance = %self.instance,
            model = %model,
            error = %error,
            "Model training failed, keeping previous version"
        );
    }

    /// Log a queued item whose detection failed
    pub fn log_queue_item_failed(&self, source: &str, error: &str) {
        warn!(
            event = "queue_item_failed",
            instance = %self.instance,
            source = %source,
            error = %error,
            "Queued item could not be scored"
        );
    }

    pub fn log_latency_exceeded(&self, elapsed_ms: u64, budget_ms: u64, batch_size: usize) {
        warn!(
            event = "latency_exceeded",
            instance = %self.instance,
            elapsed_ms = elapsed_ms,
            budget_ms = budget_ms,
            batch_size = batch_size,
            "Queue batch exceeded latency budget"
        );
    }

    pub fn log_startup(&self, version: &str, models: &[String]) {
        info!(
            event = "detector_started",
            instance = %self.instance,
            version = %version,
            models = ?models,
            "Anomaly detector started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "detector_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Anomaly detector shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_metrics_shared_registration() {
        // A second handle must reuse the global collectors rather than re-register
        let metrics = DetectorMetrics::new();
        let again = DetectorMetrics::new();

        metrics.observe_detection_latency(0.001);
        metrics.observe_training_latency(0.2);
        metrics.inc_detections();
        metrics.inc_anomalies(Severity::High);
        again.inc_model_failures("clustering");
        again.set_thresholds(70.0, 0.6);
        again.set_queue_depth(3);
        again.inc_queue_failures();
        again.set_baseline_keys(12);
        again.set_batch_throughput(1500.0);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "anomaly_detector_anomalies_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("detector-0");
        assert_eq!(logger.instance, "detector-0");
    }
}
