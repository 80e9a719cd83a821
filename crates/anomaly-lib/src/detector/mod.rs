//! Ensemble anomaly detection
//!
//! This module provides:
//! - The detector state machine and ensemble scoring
//! - Feedback-driven threshold tuning
//! - Batch detection and a bounded processing queue
//! - Typed outbound events on a broadcast channel

mod config;
mod engine;
mod queue;
mod tuning;

#[cfg(test)]
mod tests;

pub use config::{
    AutoTuningConfig, DetectorConfig, ModelSpec, PerformanceConfig, ThresholdConfig,
};
pub use engine::AnomalyDetector;
pub use queue::{ProcessingQueue, QueueHandle};
pub use tuning::{ThresholdAdjustment, MAX_FALSE_POSITIVE_RATE, MAX_MODEL_THRESHOLD};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::BaselineData;
use crate::ensemble::ModelMetrics;
use crate::models::{Anomaly, AnomalyScore};

/// Z-score above which the ensemble score is amplified
pub const AMPLIFY_Z_SCORE: f64 = 3.0;

/// Amplification per unit of z-score
pub const AMPLIFY_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Uninitialized,
    Ready,
    Detecting,
    Training,
    ShuttingDown,
    Stopped,
}

impl DetectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorState::Uninitialized => "uninitialized",
            DetectorState::Ready => "ready",
            DetectorState::Detecting => "detecting",
            DetectorState::Training => "training",
            DetectorState::ShuttingDown => "shutting_down",
            DetectorState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications published by the detector
#[derive(Debug, Clone)]
pub enum DetectorEvent {
    StateChanged {
        from: DetectorState,
        to: DetectorState,
    },
    BaselineUpdated {
        key: String,
        sample_size: usize,
    },
    ModelTrained {
        model: String,
        metrics: ModelMetrics,
    },
    AnomalyDetected(Box<Anomaly>),
    ThresholdsAdjusted(ThresholdAdjustment),
}

/// Full scoring breakdown for one data point
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub score: AnomalyScore,
    /// Mean of the model scores before amplification, 0-1
    pub ensemble_score: f64,
    pub model_scores: BTreeMap<String, f64>,
    pub baseline: Option<Arc<BaselineData>>,
    pub z_score: Option<f64>,
    pub is_anomaly: bool,
}

/// Outcome of a training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub samples: usize,
    pub skipped_invalid: usize,
    pub baselines_recomputed: usize,
    pub models: BTreeMap<String, ModelMetrics>,
    pub duration_ms: u64,
}

/// Running totals since the detector was created
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectorStats {
    pub detections: u64,
    pub anomalies: u64,
    pub invalid_inputs: u64,
    pub model_failures: u64,
    pub mean_latency_us: f64,
    pub last_batch_throughput: f64,
    pub last_trained: Option<DateTime<Utc>>,
}
