//! Anomaly agent - streaming anomaly detection over stdin
//!
//! Reads monitoring data as newline-delimited JSON, writes anomalies to
//! stdout and serves health and metrics endpoints.

use anomaly_agent::{api, config::AgentConfig, ingest, output};
use anomaly_lib::{
    health::{components, HealthRegistry},
    AnomalyDetector, ProcessingQueue,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Queue fill ratio above which the queue reports degraded
const QUEUE_PRESSURE: f64 = 0.8;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries anomalies
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("Starting anomaly-agent");

    let config = AgentConfig::load()?;
    let capacity = config.detector.performance.queue_capacity;

    let health_registry = HealthRegistry::new();
    for component in [
        components::BASELINES,
        components::MODELS,
        components::DETECTOR,
        components::QUEUE,
    ] {
        health_registry.register(component).await;
    }

    let detector = Arc::new(AnomalyDetector::new(config.detector.clone())?);
    detector.initialize()?;
    detector.report_health(&health_registry).await;

    let (queue, anomalies) = ProcessingQueue::start(Arc::clone(&detector));

    let writer = tokio::spawn(output::forward_json_lines(anomalies, tokio::io::stdout()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        Arc::clone(&detector),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut health_ticker = tokio::time::interval(Duration::from_secs(config.health_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let reason = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match ingest::parse_line(&line) {
                    Ok(Some(message)) => {
                        if let Err(e) = ingest::dispatch(message, &detector, &queue).await {
                            warn!(error = %e, "Failed to process message");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping input line"),
                },
                Ok(None) => break "end of input",
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break "input error";
                }
            },
            _ = health_ticker.tick() => {
                detector.report_health(&health_registry).await;
                let fill = queue.depth() as f64 / capacity as f64;
                if fill > QUEUE_PRESSURE {
                    health_registry
                        .set_degraded(components::QUEUE, format!("Queue {:.0}% full", fill * 100.0))
                        .await;
                } else {
                    health_registry.set_healthy(components::QUEUE).await;
                }
            }
            _ = &mut shutdown => break "SIGINT received",
        }
    };

    info!(reason, "Draining queue");
    health_registry.set_ready(false).await;
    queue.shutdown().await?;
    match writer.await {
        Ok(written) => info!(written, "Anomaly output closed"),
        Err(e) => warn!(error = %e, "Anomaly writer task failed"),
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
