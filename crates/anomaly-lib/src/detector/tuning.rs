//! Feedback-driven threshold tuning
//!
//! Feedback is buffered inside a sliding window. Once enough labels are
//! present and the false-positive rate exceeds [`MAX_FALSE_POSITIVE_RATE`],
//! thresholds are raised by the configured rate and the buffer restarts.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::config::{AutoTuningConfig, ThresholdConfig};
use crate::error::{DetectorError, Result};
use crate::models::Feedback;

/// False-positive rate above which thresholds are raised
pub const MAX_FALSE_POSITIVE_RATE: f64 = 0.05;

/// Upper bound for a raised per-model threshold
pub const MAX_MODEL_THRESHOLD: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdAdjustment {
    pub previous: ThresholdConfig,
    pub current: ThresholdConfig,
    pub false_positive_rate: f64,
    pub feedback_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Feedback evidence that warrants raising thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningSignal {
    pub false_positive_rate: f64,
    pub feedback_count: usize,
}

pub struct FeedbackTuner {
    config: AutoTuningConfig,
    buffer: Mutex<VecDeque<Feedback>>,
}

impl FeedbackTuner {
    pub fn new(config: AutoTuningConfig) -> Self {
        Self {
            config,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Buffer `feedback` and report whether thresholds should rise
    pub fn record(&self, feedback: Feedback, now: DateTime<Utc>) -> Result<Option<TuningSignal>> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|e| DetectorError::LockPoisoned(e.to_string()))?;

        buffer.push_back(feedback);
        let cutoff = now - Duration::minutes(self.config.feedback_window_minutes);
        buffer.retain(|f| f.timestamp >= cutoff);

        if !self.config.enabled || buffer.len() < self.config.min_samples {
            return Ok(None);
        }

        let false_positives = buffer.iter().filter(|f| !f.is_actual_anomaly).count();
        let rate = false_positives as f64 / buffer.len() as f64;
        if rate <= MAX_FALSE_POSITIVE_RATE {
            return Ok(None);
        }

        let signal = TuningSignal {
            false_positive_rate: rate,
            feedback_count: buffer.len(),
        };
        buffer.clear();
        Ok(Some(signal))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Global thresholds after one upward step, capped at their ranges
    pub fn raise(&self, thresholds: &ThresholdConfig) -> ThresholdConfig {
        let factor = 1.0 + self.config.adjustment_rate;
        ThresholdConfig {
            anomaly_score: (thresholds.anomaly_score * factor).min(100.0),
            confidence: (thresholds.confidence * factor).min(1.0),
        }
    }

    pub fn raise_model_threshold(&self, threshold: f64) -> f64 {
        (threshold * (1.0 + self.config.adjustment_rate)).min(MAX_MODEL_THRESHOLD)
    }
}
