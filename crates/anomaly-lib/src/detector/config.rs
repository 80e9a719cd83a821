//! Detector configuration

use serde::{Deserialize, Serialize};

use crate::baseline::BaselineConfig;
use crate::ensemble::{
    ClusteringParams, IsolationForestParams, ModelKind, ModelType, StatisticalParams,
};
use crate::error::{DetectorError, Result};

/// One model in the ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model: ModelKind,
    /// Per-model flag threshold in `[0, 1]`
    #[serde(default = "default_model_threshold")]
    pub threshold: f64,
    /// Raise this model's threshold along with the global ones
    #[serde(default)]
    pub auto_tune: bool,
}

fn default_model_threshold() -> f64 {
    0.6
}

impl ModelSpec {
    pub fn new(model: ModelKind) -> Self {
        Self {
            model,
            threshold: default_model_threshold(),
            auto_tune: true,
        }
    }

    pub fn model_type(&self) -> ModelType {
        self.model.model_type()
    }
}

/// Decision thresholds; both must be met for an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// 0-100
    pub anomaly_score: f64,
    /// 0-1
    pub confidence: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            anomaly_score: 70.0,
            confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTuningConfig {
    pub enabled: bool,
    /// Feedback older than this is discarded
    pub feedback_window_minutes: i64,
    /// Feedback required before the false-positive rate is trusted
    pub min_samples: usize,
    /// Fractional threshold increase per adjustment
    pub adjustment_rate: f64,
}

impl Default for AutoTuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feedback_window_minutes: 60,
            min_samples: 10,
            adjustment_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Queue batches slower than this are logged
    pub max_latency_ms: u64,
    pub batch_size: usize,
    pub parallel_processing: bool,
    /// Bound of the processing queue channel
    pub queue_capacity: usize,
    /// Most recent samples kept for a training run
    pub max_training_samples: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 100,
            batch_size: 100,
            parallel_processing: true,
            queue_capacity: 10_000,
            max_training_samples: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Name attached to structured log events
    pub instance_name: String,
    pub models: Vec<ModelSpec>,
    pub thresholds: ThresholdConfig,
    pub auto_tuning: AutoTuningConfig,
    pub performance: PerformanceConfig,
    pub baseline: BaselineConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            instance_name: "anomaly-detector".to_string(),
            models: vec![
                ModelSpec::new(ModelKind::IsolationForest(IsolationForestParams::default())),
                ModelSpec::new(ModelKind::Clustering(ClusteringParams::default())),
                ModelSpec::new(ModelKind::Statistical(StatisticalParams::default())),
            ],
            thresholds: ThresholdConfig::default(),
            auto_tuning: AutoTuningConfig::default(),
            performance: PerformanceConfig::default(),
            baseline: BaselineConfig::default(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DetectorError::InvalidConfig(msg));

        if self.models.is_empty() {
            return invalid("at least one model is required".to_string());
        }
        for spec in &self.models {
            if !(0.0..=1.0).contains(&spec.threshold) {
                return invalid(format!(
                    "{} threshold {} outside [0, 1]",
                    spec.model_type(),
                    spec.threshold
                ));
            }
        }
        if !(0.0..=100.0).contains(&self.thresholds.anomaly_score) {
            return invalid(format!(
                "anomaly_score threshold {} outside [0, 100]",
                self.thresholds.anomaly_score
            ));
        }
        if !(0.0..=1.0).contains(&self.thresholds.confidence) {
            return invalid(format!(
                "confidence threshold {} outside [0, 1]",
                self.thresholds.confidence
            ));
        }
        if self.auto_tuning.min_samples == 0 {
            return invalid("auto_tuning.min_samples must be positive".to_string());
        }
        if self.auto_tuning.feedback_window_minutes <= 0 {
            return invalid("auto_tuning.feedback_window_minutes must be positive".to_string());
        }
        if !self.auto_tuning.adjustment_rate.is_finite() || self.auto_tuning.adjustment_rate < 0.0 {
            return invalid("auto_tuning.adjustment_rate must be a non-negative number".to_string());
        }
        if self.performance.batch_size == 0 {
            return invalid("performance.batch_size must be positive".to_string());
        }
        if self.performance.queue_capacity == 0 {
            return invalid("performance.queue_capacity must be positive".to_string());
        }
        if self.performance.max_training_samples == 0 {
            return invalid("performance.max_training_samples must be positive".to_string());
        }
        if self.baseline.min_data_points == 0 {
            return invalid("baseline.min_data_points must be positive".to_string());
        }
        if self.baseline.max_history_size < self.baseline.min_data_points {
            return invalid("baseline.max_history_size below min_data_points".to_string());
        }
        Ok(())
    }
}
