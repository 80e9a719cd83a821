//! Core data models for the detection engine

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::baseline::BaselineData;

/// A single observation from the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringData {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    pub payload: DataPayload,
}

/// Variant-specific fields, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPayload {
    Metric {
        name: String,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    Trace {
        trace_id: String,
        span_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_span_id: Option<String>,
        operation: String,
        duration_ms: f64,
        status: TraceStatus,
    },
    Error {
        error_type: String,
        message: String,
        severity: ErrorSeverity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Behavior {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        action: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<f64>,
    },
}

impl MonitoringData {
    fn new(source: impl Into<String>, payload: DataPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            tags: BTreeMap::new(),
            metadata: None,
            payload,
        }
    }

    pub fn metric(source: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self::new(
            source,
            DataPayload::Metric {
                name: name.into(),
                value,
                unit: None,
            },
        )
    }

    pub fn log(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(
            source,
            DataPayload::Log {
                level,
                message: message.into(),
            },
        )
    }

    pub fn trace(
        source: impl Into<String>,
        operation: impl Into<String>,
        duration_ms: f64,
        status: TraceStatus,
    ) -> Self {
        Self::new(
            source,
            DataPayload::Trace {
                trace_id: Uuid::new_v4().simple().to_string(),
                span_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
                parent_span_id: None,
                operation: operation.into(),
                duration_ms,
                status,
            },
        )
    }

    pub fn error(
        source: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Self {
        Self::new(
            source,
            DataPayload::Error {
                error_type: error_type.into(),
                message: message.into(),
                severity,
                stack: None,
            },
        )
    }

    pub fn behavior(
        source: impl Into<String>,
        action: impl Into<String>,
        success: bool,
        duration_ms: Option<f64>,
    ) -> Self {
        Self::new(
            source,
            DataPayload::Behavior {
                user_id: None,
                action: action.into(),
                success,
                duration_ms,
            },
        )
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn data_type(&self) -> DataType {
        match self.payload {
            DataPayload::Metric { .. } => DataType::Metric,
            DataPayload::Log { .. } => DataType::Log,
            DataPayload::Trace { .. } => DataType::Trace,
            DataPayload::Error { .. } => DataType::Error,
            DataPayload::Behavior { .. } => DataType::Behavior,
        }
    }

    /// Scalar feature modelled for this variant
    ///
    /// Returns `None` when the value is not finite.
    pub fn extract_primary_value(&self) -> Option<f64> {
        let value = match &self.payload {
            DataPayload::Metric { value, .. } => *value,
            DataPayload::Log { level, .. } => level.weight(),
            DataPayload::Trace { duration_ms, .. } => *duration_ms,
            DataPayload::Error { severity, .. } => severity.weight(),
            DataPayload::Behavior {
                success,
                duration_ms,
                ..
            } => match duration_ms {
                Some(d) => *d,
                None if *success => 0.0,
                None => 1.0,
            },
        };
        value.is_finite().then_some(value)
    }
}

/// Discriminant of [`DataPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Metric,
    Log,
    Trace,
    Error,
    Behavior,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Metric => "metric",
            DataType::Log => "log",
            DataType::Trace => "trace",
            DataType::Error => "error",
            DataType::Behavior => "behavior",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn weight(&self) -> f64 {
        match self {
            LogLevel::Debug => 0.0,
            LogLevel::Info => 1.0,
            LogLevel::Warn => 2.0,
            LogLevel::Error => 3.0,
            LogLevel::Fatal => 4.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn weight(&self) -> f64 {
        match self {
            ErrorSeverity::Low => 1.0,
            ErrorSeverity::Medium => 2.0,
            ErrorSeverity::High => 3.0,
            ErrorSeverity::Critical => 4.0,
        }
    }
}

/// One stored sample of a baseline series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub source: String,
    pub data_type: DataType,
}

/// Severity bucket derived from the final score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Severity::Critical
        } else if score >= 75.0 {
            Severity::High
        } else if score >= 50.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calibrated ensemble output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// 0-100
    pub score: f64,
    /// 0-1, lower when models disagree
    pub confidence: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Classification attached to an emitted anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Drop,
    Latency,
    ErrorSurge,
    LogAnomaly,
    BehaviorChange,
    Outlier,
}

impl AnomalyKind {
    /// Classify a point relative to its baseline, if any
    pub fn classify(data: &MonitoringData, baseline: Option<&BaselineData>) -> Self {
        match &data.payload {
            DataPayload::Metric { value, .. } => match baseline {
                Some(b) if *value > b.mean => AnomalyKind::Spike,
                Some(b) if *value < b.mean => AnomalyKind::Drop,
                _ => AnomalyKind::Outlier,
            },
            DataPayload::Log { .. } => AnomalyKind::LogAnomaly,
            DataPayload::Trace { .. } => AnomalyKind::Latency,
            DataPayload::Error { .. } => AnomalyKind::ErrorSurge,
            DataPayload::Behavior { .. } => AnomalyKind::BehaviorChange,
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyKind::Spike => "spike",
            AnomalyKind::Drop => "drop",
            AnomalyKind::Latency => "latency",
            AnomalyKind::ErrorSurge => "error_surge",
            AnomalyKind::LogAnomaly => "log_anomaly",
            AnomalyKind::BehaviorChange => "behavior_change",
            AnomalyKind::Outlier => "outlier",
        };
        f.write_str(s)
    }
}

/// A named contributor to why a point was flagged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationFactor {
    pub name: String,
    /// 0-1
    pub impact: f64,
    pub description: String,
    pub evidence: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub primary_reason: String,
    /// Sorted by impact, at most five
    pub factors: Vec<ExplanationFactor>,
    pub suggestions: Vec<String>,
    pub confidence: f64,
}

/// Emitted anomaly, immutable once constructed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub score: AnomalyScore,
    pub data: MonitoringData,
    pub explanation: Explanation,
    pub model_scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineData>,
}

/// Human or automated label for a past anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub anomaly_id: Uuid,
    pub is_actual_anomaly: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Feedback {
    pub fn new(anomaly_id: Uuid, is_actual_anomaly: bool) -> Self {
        Self {
            anomaly_id,
            is_actual_anomaly,
            timestamp: Utc::now(),
            user_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_value_per_variant() {
        let metric = MonitoringData::metric("api", "latency", 42.5);
        assert_eq!(metric.extract_primary_value(), Some(42.5));

        let log = MonitoringData::log("api", LogLevel::Error, "boom");
        assert_eq!(log.extract_primary_value(), Some(3.0));

        let trace = MonitoringData::trace("api", "GET /users", 120.0, TraceStatus::Ok);
        assert_eq!(trace.extract_primary_value(), Some(120.0));

        let error = MonitoringData::error("api", "TypeError", "x is undefined", ErrorSeverity::High);
        assert_eq!(error.extract_primary_value(), Some(3.0));

        let failed = MonitoringData::behavior("web", "checkout", false, None);
        assert_eq!(failed.extract_primary_value(), Some(1.0));
    }

    #[test]
    fn test_non_finite_value_is_rejected() {
        let nan = MonitoringData::metric("api", "latency", f64::NAN);
        assert!(nan.extract_primary_value().is_none());

        let inf = MonitoringData::metric("api", "latency", f64::INFINITY);
        assert!(inf.extract_primary_value().is_none());
    }

    #[test]
    fn test_severity_buckets() {
        assert_eq!(Severity::from_score(95.0), Severity::Critical);
        assert_eq!(Severity::from_score(90.0), Severity::Critical);
        assert_eq!(Severity::from_score(80.0), Severity::High);
        assert_eq!(Severity::from_score(50.0), Severity::Medium);
        assert_eq!(Severity::from_score(49.9), Severity::Low);
    }

    #[test]
    fn test_monitoring_data_wire_format() {
        let json = r#"{
            "timestamp": "2024-03-01T12:00:00Z",
            "source": "checkout",
            "tags": {"region": "eu-west-1"},
            "type": "trace",
            "trace_id": "abc",
            "span_id": "def",
            "operation": "POST /pay",
            "duration_ms": 840.0,
            "status": "timeout"
        }"#;

        let data: MonitoringData = serde_json::from_str(json).unwrap();
        assert_eq!(data.data_type(), DataType::Trace);
        assert_eq!(data.tags.get("region").map(String::as_str), Some("eu-west-1"));
        assert_eq!(data.extract_primary_value(), Some(840.0));

        let encoded = serde_json::to_value(&data).unwrap();
        assert_eq!(encoded["type"], "trace");
        assert_eq!(encoded["status"], "timeout");
    }

    #[test]
    fn test_log_level_accepts_warning_alias() {
        let level: LogLevel = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
    }
}
