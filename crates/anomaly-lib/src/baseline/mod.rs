//! Per-key statistical baselines
//!
//! This module provides:
//! - Rolling time series per baseline key with retention and size caps
//! - Baseline snapshots (mean, standard deviation, percentiles)
//! - Seasonal pattern extraction (hour-of-day, day-of-week, ISO week)
//! - Linear trend estimation

mod manager;
mod stats;

pub use manager::{
    baseline_key, AnomalyCheck, BaselineManager, BaselineStats, BaselineUpdate, CleanupStats,
    DEFAULT_SENSITIVITY,
};
pub use stats::{linear_trend, mean, percentile, sample_std_dev, seasonal_patterns};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Z-score reported when a value departs from a zero-variance baseline
pub const DEGENERATE_Z_SCORE: f64 = 10.0;

/// Baseline retention and sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Points required before a snapshot is computed
    pub min_data_points: usize,
    /// Points retained per key, oldest dropped first
    pub max_history_size: usize,
    /// Points older than this are evicted by `cleanup`
    pub retention_days: i64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            min_data_points: 100,
            max_history_size: 10_000,
            retention_days: 7,
        }
    }
}

/// Immutable statistical snapshot of one key's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineData {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: Percentiles,
    pub seasonal_patterns: Vec<SeasonalPattern>,
    pub trend: TrendData,
    pub last_updated: DateTime<Utc>,
    pub sample_size: usize,
    /// Most recent value in the series at snapshot time
    #[serde(default)]
    pub last_value: Option<f64>,
}

impl BaselineData {
    /// Absolute z-score of `value` against this baseline
    pub fn z_score(&self, value: f64) -> f64 {
        let diff = (value - self.mean).abs();
        if self.std_dev < f64::EPSILON {
            if diff < f64::EPSILON {
                0.0
            } else {
                DEGENERATE_Z_SCORE
            }
        } else {
            diff / self.std_dev
        }
    }

    pub fn seasonal_pattern(&self, period: SeasonalPeriod) -> Option<&SeasonalPattern> {
        self.seasonal_patterns.iter().find(|p| p.period == period)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalPeriod {
    /// 24 hour-of-day buckets
    Hourly,
    /// 7 day-of-week buckets
    Daily,
    /// ISO week buckets
    Weekly,
}

impl SeasonalPeriod {
    /// Samples required before the period is considered
    pub fn min_samples(&self) -> usize {
        match self {
            SeasonalPeriod::Hourly | SeasonalPeriod::Daily => 168,
            SeasonalPeriod::Weekly => 672,
        }
    }

    pub fn buckets(&self) -> usize {
        match self {
            SeasonalPeriod::Hourly => 24,
            SeasonalPeriod::Daily => 7,
            SeasonalPeriod::Weekly => 53,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalPattern {
    pub period: SeasonalPeriod,
    /// Average value per bucket
    pub pattern: Vec<f64>,
    /// Normalized variability of bucket averages, 0-1
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendData {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination (R²)
    pub correlation: f64,
    pub direction: TrendDirection,
}
