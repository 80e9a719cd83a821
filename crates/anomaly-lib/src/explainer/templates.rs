//! Reason templates and remediation suggestions

use super::factor_names::*;
use crate::models::{AnomalyScore, DataPayload, DataType, ExplanationFactor, MonitoringData, Severity};

const MAX_SUGGESTIONS: usize = 5;

/// One-sentence reason keyed by data type and the strongest factor
///
/// Every reason ends with the score, severity and confidence, e.g.
/// `... (score 97, critical severity, 85% confidence)`.
pub fn primary_reason(
    data: &MonitoringData,
    top: Option<&ExplanationFactor>,
    score: &AnomalyScore,
) -> String {
    let summary = format!(
        "score {:.0}, {} severity, {:.0}% confidence",
        score.score,
        score.severity,
        score.confidence * 100.0
    );
    match top {
        Some(top) => format!("{}: {} ({})", headline(data, top), top.description, summary),
        None => format!("Anomalous {} from {} ({})", data.data_type(), data.source, summary),
    }
}

fn headline(data: &MonitoringData, top: &ExplanationFactor) -> String {
    let source = &data.source;
    match (&data.payload, top.name.as_str()) {
        (DataPayload::Metric { name, value, .. }, STATISTICAL_DEVIATION) => format!(
            "Metric '{}' from {} is {:.2}, far outside its normal range",
            name, source, value
        ),
        (DataPayload::Metric { name, .. }, RAPID_CHANGE) => {
            format!("Metric '{}' from {} changed abruptly", name, source)
        }
        (DataPayload::Metric { name, .. }, TEMPORAL_PATTERN) => format!(
            "Metric '{}' from {} is unusual for this time of day",
            name, source
        ),
        (DataPayload::Log { level, .. }, HIGH_SEVERITY_LOG) => {
            format!("Unusual {:?} log activity from {}", level, source)
        }
        (DataPayload::Trace { operation, duration_ms, .. }, HIGH_LATENCY) => format!(
            "Operation '{}' on {} took {:.0}ms, well above normal latency",
            operation, source, duration_ms
        ),
        (DataPayload::Trace { operation, status, .. }, FAILED_TRACE) => {
            format!("Operation '{}' on {} failed ({:?})", operation, source, status)
        }
        (DataPayload::Error { error_type, severity, .. }, ERROR_SEVERITY) => {
            format!("{:?} severity {} error raised by {}", severity, error_type, source)
        }
        (DataPayload::Behavior { action, .. }, FAILED_USER_ACTION) => {
            format!("User action '{}' on {} failed unexpectedly", action, source)
        }
        (_, MODEL_CONSENSUS) => format!(
            "Detection models agree that {} from {} is abnormal",
            data.data_type(),
            source
        ),
        (_, CONTEXT_INDICATORS) => format!(
            "{} from {} carries failure indicators",
            data.data_type(),
            source
        ),
        _ => format!("Anomalous {} from {}", data.data_type(), source),
    }
}

fn severity_suggestions(severity: Severity) -> &'static [&'static str] {
    match severity {
        Severity::Critical => &[
            "Investigate immediately, user impact is likely",
            "Page the on-call engineer for the affected service",
        ],
        Severity::High => &["Investigate within the hour"],
        Severity::Medium => &["Review during working hours"],
        Severity::Low => &["Monitor for recurrence"],
    }
}

fn factor_suggestion(name: &str) -> Option<&'static str> {
    match name {
        STATISTICAL_DEVIATION => Some("Compare against recent deployments and configuration changes"),
        TEMPORAL_PATTERN => Some("Check scheduled jobs and traffic patterns for this time window"),
        RAPID_CHANGE => Some("Look for sudden load shifts or failing dependencies"),
        HIGH_SEVERITY_LOG => Some("Read the surrounding log lines for context"),
        HIGH_LATENCY => Some("Profile the slow operation and its downstream calls"),
        FAILED_TRACE => Some("Inspect the failing span and its error logs"),
        ERROR_SEVERITY => Some("Review the stack trace and the recent error rate"),
        FAILED_USER_ACTION => Some("Check the user flow for regressions"),
        CONTEXT_INDICATORS => Some("Follow up on the failure keywords in the event tags"),
        _ => None,
    }
}

fn type_suggestion(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Metric => "Review dashboards for correlated metrics",
        DataType::Log => "Search logs from the same source for similar messages",
        DataType::Trace => "Check downstream service health",
        DataType::Error => "Check error tracking for related occurrences",
        DataType::Behavior => "Review recent changes to the user journey",
    }
}

/// Ordered, de-duplicated suggestions, at most five
pub fn suggestions(
    data: &MonitoringData,
    severity: Severity,
    factors: &[ExplanationFactor],
) -> Vec<String> {
    let candidates = severity_suggestions(severity)
        .iter()
        .copied()
        .chain(factors.iter().filter_map(|f| factor_suggestion(&f.name)))
        .chain(std::iter::once(type_suggestion(data.data_type())));

    let mut out: Vec<String> = Vec::new();
    for candidate in candidates {
        if out.len() == MAX_SUGGESTIONS {
            break;
        }
        if !out.iter().any(|s| s == candidate) {
            out.push(candidate.to_string());
        }
    }
    out
}
