//! Bounded processing queue in front of the detector
//!
//! Producers enqueue points on a bounded channel. A single worker drains up to
//! `batch_size` items per tick, runs batch detection and forwards anomalies on
//! an outbound channel in submission order. An item that fails detection is
//! logged and counted; the rest of its batch is still forwarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::engine::AnomalyDetector;
use crate::error::{DetectorError, Result};
use crate::models::{Anomaly, MonitoringData};
use crate::observability::{DetectorMetrics, StructuredLogger};

/// Interval between drains of a partially filled batch
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Handle used to feed the queue and to stop it
pub struct QueueHandle {
    tx: mpsc::Sender<MonitoringData>,
    depth: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
    detector: Arc<AnomalyDetector>,
}

impl QueueHandle {
    /// Enqueue a point, waiting for capacity
    pub async fn enqueue(&self, data: MonitoringData) -> Result<()> {
        // Counted before the send so the worker never decrements first
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(data).await.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(DetectorError::QueueClosed);
        }
        DetectorMetrics::new().set_queue_depth(self.depth() as i64);
        Ok(())
    }

    /// Items accepted but not yet processed
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Items whose detection returned an error
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Drain everything already enqueued, then stop the worker and detector
    pub async fn shutdown(self) -> Result<()> {
        let QueueHandle {
            tx,
            worker,
            detector,
            ..
        } = self;
        drop(tx);
        worker
            .await
            .map_err(|e| DetectorError::TaskFailed(e.to_string()))?;
        detector.shutdown().await
    }
}

pub struct ProcessingQueue {
    detector: Arc<AnomalyDetector>,
    rx: mpsc::Receiver<MonitoringData>,
    out: mpsc::Sender<Anomaly>,
    depth: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    metrics: DetectorMetrics,
    logger: StructuredLogger,
}

impl ProcessingQueue {
    /// Spawn the worker; anomalies arrive on the returned receiver
    pub fn start(detector: Arc<AnomalyDetector>) -> (QueueHandle, mpsc::Receiver<Anomaly>) {
        let capacity = detector.config().performance.queue_capacity;
        let (tx, rx) = mpsc::channel(capacity);
        let (out, anomalies) = mpsc::channel(capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let queue = ProcessingQueue {
            rx,
            out,
            depth: Arc::clone(&depth),
            failed: Arc::clone(&failed),
            metrics: DetectorMetrics::new(),
            logger: StructuredLogger::new(detector.config().instance_name.clone()),
            detector: Arc::clone(&detector),
        };
        let worker = tokio::spawn(queue.run());

        let handle = QueueHandle {
            tx,
            depth,
            failed,
            worker,
            detector,
        };
        (handle, anomalies)
    }

    async fn run(mut self) {
        let batch_size = self.detector.config().performance.batch_size;
        info!(batch_size, "Starting processing queue");

        let mut ticker = interval(DRAIN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending = Vec::with_capacity(batch_size);

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(data) => {
                        pending.push(data);
                        if pending.len() >= batch_size {
                            self.flush(&mut pending).await;
                        }
                    }
                    None => {
                        self.flush(&mut pending).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await;
                    }
                }
            }
        }

        info!("Processing queue drained");
    }

    async fn flush(&self, pending: &mut Vec<MonitoringData>) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let size = batch.len();
        let sources: Vec<String> = batch.iter().map(|d| d.source.clone()).collect();
        let start = Instant::now();

        let outcomes = self.detector.detect_each(batch).await;
        for (outcome, source) in outcomes.into_iter().zip(&sources) {
            match outcome {
                Ok(Some(anomaly)) => {
                    if self.out.send(anomaly).await.is_err() {
                        debug!("Anomaly receiver dropped");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    self.metrics.inc_queue_failures();
                    self.logger.log_queue_item_failed(source, &e.to_string());
                }
            }
        }

        let remaining = self.depth.fetch_sub(size, Ordering::SeqCst).saturating_sub(size);
        self.metrics.set_queue_depth(remaining as i64);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let budget_ms = self.detector.config().performance.max_latency_ms;
        if elapsed_ms > budget_ms {
            self.logger.log_latency_exceeded(elapsed_ms, budget_ms, size);
        }
    }
}
