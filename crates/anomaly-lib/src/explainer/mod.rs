//! Turns a scored data point into ranked factors, a reason and suggestions
//!
//! Factors are computed independently, sorted by impact and truncated to
//! [`MAX_FACTORS`]. The primary reason comes from a template keyed by the
//! data type and the strongest factor.

mod templates;

use std::collections::BTreeMap;

use chrono::{Datelike, Timelike};

use crate::baseline::{BaselineData, SeasonalPeriod};
use crate::models::{
    AnomalyScore, DataPayload, ErrorSeverity, Explanation, ExplanationFactor, LogLevel,
    MonitoringData, Severity, TraceStatus,
};

pub use templates::{primary_reason, suggestions};

pub const MAX_FACTORS: usize = 5;

/// Factors below this impact are not reported
const MIN_FACTOR_IMPACT: f64 = 0.05;

/// Samples at which a baseline counts as fully adequate
const ADEQUATE_SAMPLE_SIZE: f64 = 500.0;

/// Seasonal strength required before a bucket is compared
const MIN_PATTERN_STRENGTH: f64 = 0.3;

/// Relative deviation from the seasonal bucket that counts as unusual
const PATTERN_DEVIATION: f64 = 0.5;

/// Trace latency flagged when no baseline exists
const DEFAULT_LATENCY_LIMIT_MS: f64 = 1000.0;

const CONTEXT_KEYWORDS: &[&str] = &["error", "timeout", "failure", "critical", "alert"];

pub mod factor_names {
    pub const STATISTICAL_DEVIATION: &str = "Statistical Deviation";
    pub const TEMPORAL_PATTERN: &str = "Temporal Pattern";
    pub const MODEL_CONSENSUS: &str = "Model Consensus";
    pub const RAPID_CHANGE: &str = "Rapid Change";
    pub const HIGH_SEVERITY_LOG: &str = "High Severity Log";
    pub const HIGH_LATENCY: &str = "High Latency";
    pub const FAILED_TRACE: &str = "Failed Trace";
    pub const ERROR_SEVERITY: &str = "Error Severity";
    pub const FAILED_USER_ACTION: &str = "Failed User Action";
    pub const CONTEXT_INDICATORS: &str = "Context Indicators";
}

use factor_names::*;

fn factor(
    name: &str,
    impact: f64,
    description: String,
    evidence: Vec<String>,
    confidence: f64,
) -> ExplanationFactor {
    ExplanationFactor {
        name: name.to_string(),
        impact: impact.clamp(0.0, 1.0),
        description,
        evidence,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

fn baseline_adequacy(baseline: &BaselineData) -> f64 {
    (baseline.sample_size as f64 / ADEQUATE_SAMPLE_SIZE).min(1.0)
}

fn severity_boost(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 1.1,
        Severity::High => 1.05,
        Severity::Medium => 1.0,
        Severity::Low => 0.9,
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyExplainer;

impl AnomalyExplainer {
    pub fn new() -> Self {
        Self
    }

    pub fn explain(
        &self,
        data: &MonitoringData,
        score: &AnomalyScore,
        baseline: Option<&BaselineData>,
        model_scores: &BTreeMap<String, f64>,
    ) -> Explanation {
        let factors = self.factors(data, score, baseline, model_scores);
        let primary = primary_reason(data, factors.first(), score);
        let suggestions = suggestions(data, score.severity, &factors);

        let baseline_part = baseline.map_or(0.3, |b| 0.6 * baseline_adequacy(b));
        let factor_part = 0.4 * (factors.len() as f64 / 3.0).min(1.0);

        Explanation {
            primary_reason: primary,
            factors,
            suggestions,
            confidence: (baseline_part + factor_part).clamp(0.0, 1.0),
        }
    }

    /// Every applicable factor, strongest first, at most [`MAX_FACTORS`]
    pub fn factors(
        &self,
        data: &MonitoringData,
        score: &AnomalyScore,
        baseline: Option<&BaselineData>,
        model_scores: &BTreeMap<String, f64>,
    ) -> Vec<ExplanationFactor> {
        let value = data.extract_primary_value();

        let mut factors: Vec<ExplanationFactor> = [
            value.zip(baseline).and_then(|(v, b)| statistical_deviation(v, b, score.severity)),
            temporal_pattern(data, value, baseline),
            model_consensus(model_scores, score.confidence),
            context_indicators(data),
        ]
        .into_iter()
        .flatten()
        .chain(type_specific(data, baseline))
        .filter(|f| f.impact >= MIN_FACTOR_IMPACT)
        .collect();

        factors.sort_by(|a, b| b.impact.total_cmp(&a.impact));
        factors.truncate(MAX_FACTORS);
        factors
    }
}

fn statistical_deviation(value: f64, baseline: &BaselineData, severity: Severity) -> Option<ExplanationFactor> {
    let z = baseline.z_score(value);
    let p = &baseline.percentiles;
    let extreme = value > p.p99 || value < p.p10;

    let raw = if z > 3.0 {
        0.9
    } else if z > 2.0 {
        0.7
    } else if extreme {
        0.6
    } else {
        z / 3.0
    };

    let direction = if value >= baseline.mean { "above" } else { "below" };
    Some(factor(
        STATISTICAL_DEVIATION,
        raw * severity_boost(severity),
        format!(
            "Value {:.2} is {:.1} standard deviations {} the baseline mean of {:.2}",
            value, z, direction, baseline.mean
        ),
        vec![
            format!("z-score: {:.2}", z),
            format!("baseline mean: {:.2}, std dev: {:.2}", baseline.mean, baseline.std_dev),
            format!("p10: {:.2}, p95: {:.2}, p99: {:.2}", p.p10, p.p95, p.p99),
            format!("baseline samples: {}", baseline.sample_size),
        ],
        baseline_adequacy(baseline),
    ))
}

fn temporal_pattern(
    data: &MonitoringData,
    value: Option<f64>,
    baseline: Option<&BaselineData>,
) -> Option<ExplanationFactor> {
    let hour = data.timestamp.hour();
    let weekday = data.timestamp.weekday().num_days_from_monday();
    let mut impact: f64 = 0.0;
    let mut evidence = Vec::new();
    let mut seasonal = false;

    if let (Some(value), Some(baseline)) = (value, baseline) {
        for (period, bucket) in [(SeasonalPeriod::Hourly, hour), (SeasonalPeriod::Daily, weekday)] {
            let Some(pattern) = baseline.seasonal_pattern(period) else {
                continue;
            };
            let Some(&expected) = pattern.pattern.get(bucket as usize) else {
                continue;
            };
            if pattern.strength <= MIN_PATTERN_STRENGTH || expected.abs() < f64::EPSILON {
                continue;
            }

            let deviation = (value - expected).abs() / expected.abs();
            if deviation > PATTERN_DEVIATION {
                seasonal = true;
                impact = impact.max(0.5 * deviation.min(1.0) + 0.5 * pattern.strength);
                evidence.push(format!(
                    "expected {:.2} for this {} bucket, observed {:.2} ({:.0}% off)",
                    expected,
                    if period == SeasonalPeriod::Hourly { "hour" } else { "weekday" },
                    value,
                    deviation * 100.0
                ));
            }
        }
    }

    if !(6..22).contains(&hour) {
        impact = impact.max(0.3);
        evidence.push(format!("observed at {:02}:{:02} UTC", hour, data.timestamp.minute()));
    }

    if evidence.is_empty() {
        return None;
    }

    let description = if seasonal {
        "Value departs from the usual pattern for this time".to_string()
    } else {
        "Activity at an unusual hour".to_string()
    };
    Some(factor(
        TEMPORAL_PATTERN,
        impact,
        description,
        evidence,
        if seasonal { 0.7 } else { 0.5 },
    ))
}

fn model_consensus(model_scores: &BTreeMap<String, f64>, confidence: f64) -> Option<ExplanationFactor> {
    if model_scores.is_empty() {
        return None;
    }
    let scores: Vec<f64> = model_scores.values().copied().collect();
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    if mean <= f64::EPSILON {
        return None;
    }
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    let agreement = (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0);

    Some(factor(
        MODEL_CONSENSUS,
        agreement * confidence,
        format!("{} models agree with {:.0}% consistency", scores.len(), agreement * 100.0),
        model_scores
            .iter()
            .map(|(model, score)| format!("{}: {:.3}", model, score))
            .collect(),
        confidence,
    ))
}

fn type_specific(data: &MonitoringData, baseline: Option<&BaselineData>) -> Vec<ExplanationFactor> {
    let mut factors = Vec::new();
    match &data.payload {
        DataPayload::Metric { name, value, .. } => {
            let previous = baseline.and_then(|b| b.last_value);
            if let Some(prev) = previous.filter(|p| p.abs() > f64::EPSILON) {
                let ratio = (value - prev).abs() / prev.abs();
                if ratio > 0.5 {
                    factors.push(factor(
                        RAPID_CHANGE,
                        (ratio * 0.5).min(0.9),
                        format!("Metric '{}' changed {:.0}% since the previous sample", name, ratio * 100.0),
                        vec![format!("previous: {:.2}", prev), format!("current: {:.2}", value)],
                        0.8,
                    ));
                }
            }
        }
        DataPayload::Log { level, message } => {
            let impact = match level {
                LogLevel::Fatal => Some(0.85),
                LogLevel::Error => Some(0.6),
                _ => None,
            };
            if let Some(impact) = impact {
                factors.push(factor(
                    HIGH_SEVERITY_LOG,
                    impact,
                    format!("{:?} level log entry", level),
                    vec![format!("message: {}", message)],
                    0.9,
                ));
            }
        }
        DataPayload::Trace {
            operation,
            duration_ms,
            status,
            ..
        } => {
            let limit = baseline.map_or(DEFAULT_LATENCY_LIMIT_MS, |b| b.percentiles.p95);
            if *duration_ms > limit && limit > 0.0 {
                let excess = (duration_ms / limit - 1.0).min(1.0);
                factors.push(factor(
                    HIGH_LATENCY,
                    0.5 + 0.4 * excess,
                    format!("Operation '{}' took {:.0}ms", operation, duration_ms),
                    vec![format!("latency limit: {:.0}ms", limit)],
                    if baseline.is_some() { 0.8 } else { 0.5 },
                ));
            }
            if matches!(status, TraceStatus::Error | TraceStatus::Timeout) {
                factors.push(factor(
                    FAILED_TRACE,
                    0.8,
                    format!("Operation '{}' ended with status {:?}", operation, status),
                    vec![format!("status: {:?}", status)],
                    0.9,
                ));
            }
        }
        DataPayload::Error {
            error_type,
            severity,
            message,
            ..
        } => {
            let impact = match severity {
                ErrorSeverity::Critical => 0.9,
                ErrorSeverity::High => 0.7,
                ErrorSeverity::Medium => 0.4,
                ErrorSeverity::Low => 0.2,
            };
            factors.push(factor(
                ERROR_SEVERITY,
                impact,
                format!("{:?} severity {} error", severity, error_type),
                vec![format!("message: {}", message)],
                0.9,
            ));
        }
        DataPayload::Behavior {
            user_id,
            action,
            success,
            ..
        } => {
            if !success {
                factors.push(factor(
                    FAILED_USER_ACTION,
                    0.6,
                    format!("User action '{}' failed", action),
                    user_id.iter().map(|u| format!("user: {}", u)).collect(),
                    0.8,
                ));
            }
        }
    }
    factors
}

fn context_indicators(data: &MonitoringData) -> Option<ExplanationFactor> {
    let matches: Vec<String> = CONTEXT_KEYWORDS
        .iter()
        .filter(|kw| {
            data.tags.iter().any(|(k, v)| {
                k.to_lowercase().contains(*kw) || v.to_lowercase().contains(*kw)
            })
        })
        .map(|kw| kw.to_string())
        .collect();

    if matches.is_empty() {
        return None;
    }
    Some(factor(
        CONTEXT_INDICATORS,
        (0.2 + 0.1 * matches.len() as f64).min(0.5),
        "Event tags mention failure conditions".to_string(),
        matches.iter().map(|m| format!("tag keyword: {}", m)).collect(),
        0.6,
    ))
}
