//! Newline-delimited JSON ingestion
//!
//! Each line is one message, `{"kind": "...", "body": ...}`:
//! - `data`: a single monitoring point, queued for detection
//! - `batch`: several points, queued in order
//! - `feedback`: a label for a previously emitted anomaly
//! - `train`: points to refresh baselines and retrain models on

use std::sync::Arc;

use anomaly_lib::{AnomalyDetector, Feedback, MonitoringData, QueueHandle};
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum IngestMessage {
    Data(MonitoringData),
    Batch(Vec<MonitoringData>),
    Feedback(Feedback),
    Train(Vec<MonitoringData>),
}

/// Parse one input line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<IngestMessage>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let message = serde_json::from_str(line).context("Malformed ingest message")?;
    Ok(Some(message))
}

/// Route a parsed message to the queue or the detector
pub async fn dispatch(
    message: IngestMessage,
    detector: &Arc<AnomalyDetector>,
    queue: &QueueHandle,
) -> Result<()> {
    match message {
        IngestMessage::Data(data) => queue.enqueue(data).await?,
        IngestMessage::Batch(items) => {
            for data in items {
                queue.enqueue(data).await?;
            }
        }
        IngestMessage::Feedback(feedback) => {
            if let Some(adjustment) = detector.process_feedback(feedback)? {
                info!(
                    anomaly_score = adjustment.current.anomaly_score,
                    confidence = adjustment.current.confidence,
                    "Thresholds raised from feedback"
                );
            }
        }
        IngestMessage::Train(points) => {
            let detector = Arc::clone(detector);
            let outcome = tokio::task::spawn_blocking(move || detector.train(&points))
                .await
                .context("Training task failed")?;
            match outcome {
                Ok(report) => info!(
                    samples = report.samples,
                    skipped = report.skipped_invalid,
                    duration_ms = report.duration_ms,
                    "Training complete"
                ),
                Err(e) => warn!(error = %e, "Training failed"),
            }
        }
    }
    Ok(())
}
