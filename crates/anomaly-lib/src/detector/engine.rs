//! The ensemble anomaly detector
//!
//! Detection reads every model under a shared lock; training fits a clone of
//! each model and swaps it in under the write lock, so `detect` never blocks
//! on a training run.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::{DetectorConfig, ModelSpec, ThresholdConfig};
use super::tuning::{FeedbackTuner, ThresholdAdjustment};
use super::{
    DetectorEvent, DetectorState, DetectorStats, Evaluation, TrainingReport, AMPLIFY_FACTOR,
    AMPLIFY_Z_SCORE,
};
use crate::baseline::{mean, BaselineManager};
use crate::ensemble::{AnomalyModel, DetectionModel, ModelMetrics};
use crate::error::{DetectorError, ModelError, Result};
use crate::explainer::AnomalyExplainer;
use crate::health::{components, HealthRegistry};
use crate::models::{Anomaly, AnomalyKind, AnomalyScore, Feedback, MonitoringData, Severity};
use crate::observability::{DetectorMetrics, StructuredLogger};

const EVENT_CAPACITY: usize = 1024;

const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

struct ModelSlot {
    id: String,
    spec: ModelSpec,
    model: RwLock<DetectionModel>,
}

/// Decrements the in-flight counter when an operation finishes
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears the training flag and announces the return to `Ready`
struct TrainingRun<'a> {
    detector: &'a AnomalyDetector,
}

impl Drop for TrainingRun<'_> {
    fn drop(&mut self) {
        self.detector.training.store(false, Ordering::SeqCst);
        self.detector.emit(DetectorEvent::StateChanged {
            from: DetectorState::Training,
            to: DetectorState::Ready,
        });
    }
}

#[derive(Default)]
struct Counters {
    detections: AtomicU64,
    anomalies: AtomicU64,
    invalid_inputs: AtomicU64,
    model_failures: AtomicU64,
    latency_us_total: AtomicU64,
    /// `f64` bits
    batch_throughput: AtomicU64,
}

/// Ensemble detector over a baseline store and a closed set of models
pub struct AnomalyDetector {
    config: DetectorConfig,
    lifecycle: RwLock<DetectorState>,
    training: AtomicBool,
    in_flight: AtomicUsize,
    training_lock: Mutex<()>,
    thresholds: RwLock<ThresholdConfig>,
    baselines: BaselineManager,
    models: Vec<ModelSlot>,
    explainer: AnomalyExplainer,
    tuner: FeedbackTuner,
    events: broadcast::Sender<DetectorEvent>,
    metrics: DetectorMetrics,
    logger: StructuredLogger,
    counters: Counters,
    last_trained: RwLock<Option<DateTime<Utc>>>,
}

impl AnomalyDetector {
    /// Build a detector from a validated configuration
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;

        let mut seen: HashMap<String, usize> = HashMap::new();
        let models = config
            .models
            .iter()
            .map(|spec| {
                let base = spec.model_type().to_string();
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let id = if *count == 1 {
                    base
                } else {
                    format!("{}_{}", base, count)
                };
                ModelSlot {
                    id,
                    spec: spec.clone(),
                    model: RwLock::new(DetectionModel::from_kind(&spec.model, spec.threshold)),
                }
            })
            .collect();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            thresholds: RwLock::new(config.thresholds),
            baselines: BaselineManager::new(config.baseline.clone()),
            tuner: FeedbackTuner::new(config.auto_tuning.clone()),
            logger: StructuredLogger::new(config.instance_name.clone()),
            lifecycle: RwLock::new(DetectorState::Uninitialized),
            training: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            training_lock: Mutex::new(()),
            models,
            explainer: AnomalyExplainer::new(),
            events,
            metrics: DetectorMetrics::new(),
            counters: Counters::default(),
            last_trained: RwLock::new(None),
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn baselines(&self) -> &BaselineManager {
        &self.baselines
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|s| s.id.clone()).collect()
    }

    /// Current state, with activity layered over the lifecycle
    pub fn state(&self) -> DetectorState {
        let lifecycle = *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner);
        if lifecycle != DetectorState::Ready {
            return lifecycle;
        }
        if self.training.load(Ordering::SeqCst) {
            DetectorState::Training
        } else if self.in_flight.load(Ordering::SeqCst) > 0 {
            DetectorState::Detecting
        } else {
            DetectorState::Ready
        }
    }

    /// Move from `Uninitialized` to `Ready`
    ///
    /// Calling this again on a ready detector is a no-op.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut lifecycle = write(&self.lifecycle)?;
            match *lifecycle {
                DetectorState::Uninitialized => {}
                DetectorState::ShuttingDown | DetectorState::Stopped => {
                    return Err(DetectorError::ShutDown)
                }
                _ => return Ok(()),
            }
            for slot in &self.models {
                write(&slot.model)?.initialize();
            }
            *lifecycle = DetectorState::Ready;
        }

        let thresholds = self.thresholds();
        self.metrics
            .set_thresholds(thresholds.anomaly_score, thresholds.confidence);
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &self.model_ids());
        self.emit(DetectorEvent::StateChanged {
            from: DetectorState::Uninitialized,
            to: DetectorState::Ready,
        });
        Ok(())
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        *self.thresholds.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-model flag thresholds keyed by model id
    pub fn model_thresholds(&self) -> BTreeMap<String, f64> {
        self.models
            .iter()
            .map(|slot| {
                let model = slot.model.read().unwrap_or_else(PoisonError::into_inner);
                (slot.id.clone(), model.threshold())
            })
            .collect()
    }

    pub fn model_metrics(&self) -> BTreeMap<String, ModelMetrics> {
        self.models
            .iter()
            .map(|slot| {
                let model = slot.model.read().unwrap_or_else(PoisonError::into_inner);
                (slot.id.clone(), model.metrics().clone())
            })
            .collect()
    }

    pub fn stats(&self) -> DetectorStats {
        let c = &self.counters;
        let detections = c.detections.load(Ordering::Relaxed);
        let mean_latency_us = if detections == 0 {
            0.0
        } else {
            c.latency_us_total.load(Ordering::Relaxed) as f64 / detections as f64
        };
        DetectorStats {
            detections,
            anomalies: c.anomalies.load(Ordering::Relaxed),
            invalid_inputs: c.invalid_inputs.load(Ordering::Relaxed),
            model_failures: c.model_failures.load(Ordering::Relaxed),
            mean_latency_us,
            last_batch_throughput: f64::from_bits(c.batch_throughput.load(Ordering::Relaxed)),
            last_trained: *self.last_trained.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Ingest points into the baseline store without retraining models
    pub fn update_baselines(&self, data: &[MonitoringData]) -> Result<usize> {
        let _guard = self.begin()?;
        Ok(self.ingest_baselines(data))
    }

    fn ingest_baselines(&self, data: &[MonitoringData]) -> usize {
        let updates = self.baselines.update_baselines(data);
        let mut recomputed = 0;
        for update in updates.into_iter().filter(|u| u.recomputed) {
            recomputed += 1;
            self.emit(DetectorEvent::BaselineUpdated {
                key: update.key,
                sample_size: update.sample_size,
            });
        }
        self.metrics
            .set_baseline_keys(self.baselines.stats().keys_with_baseline as i64);
        recomputed
    }

    /// Refresh baselines and retrain every model on `data`
    ///
    /// Each model is fitted on a copy and swapped in only on success. When any
    /// model fails the error lists every failure; models that did train keep
    /// their new state.
    pub fn train(&self, data: &[MonitoringData]) -> Result<TrainingReport> {
        let _guard = self.begin()?;
        let _serial = self
            .training_lock
            .lock()
            .map_err(|e| DetectorError::LockPoisoned(e.to_string()))?;

        self.training.store(true, Ordering::SeqCst);
        self.emit(DetectorEvent::StateChanged {
            from: DetectorState::Ready,
            to: DetectorState::Training,
        });
        let _run = TrainingRun { detector: self };

        let start = Instant::now();
        let baselines_recomputed = self.ingest_baselines(data);

        let mut samples: Vec<Vec<f64>> = data
            .iter()
            .filter_map(MonitoringData::extract_primary_value)
            .map(|v| vec![v])
            .collect();
        let skipped_invalid = data.len() - samples.len();
        let cap = self.config.performance.max_training_samples;
        if samples.len() > cap {
            samples.drain(..samples.len() - cap);
        }
        if samples.is_empty() {
            self.metrics.observe_training_latency(start.elapsed().as_secs_f64());
            return Err(DetectorError::TrainingFailed(
                "no valid samples in training data".to_string(),
            ));
        }

        let mut trained = BTreeMap::new();
        let mut failures = Vec::new();
        for slot in &self.models {
            let model_start = Instant::now();
            let mut candidate = read(&slot.model)?.clone();
            match candidate.train(&samples) {
                Ok(()) => {
                    let metrics = candidate.metrics().clone();
                    *write(&slot.model)? = candidate;

                    self.logger.log_model_trained(
                        &slot.id,
                        samples.len(),
                        model_start.elapsed().as_millis() as u64,
                        metrics.false_positive_rate,
                    );
                    self.emit(DetectorEvent::ModelTrained {
                        model: slot.id.clone(),
                        metrics: metrics.clone(),
                    });
                    trained.insert(slot.id.clone(), metrics);
                }
                Err(e) => {
                    self.logger.log_training_failed(&slot.id, &e.to_string());
                    failures.push(format!("{}: {}", slot.id, e));
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.observe_training_latency(elapsed.as_secs_f64());

        if !failures.is_empty() {
            return Err(DetectorError::TrainingFailed(failures.join("; ")));
        }

        *write(&self.last_trained)? = Some(Utc::now());

        Ok(TrainingReport {
            samples: samples.len(),
            skipped_invalid,
            baselines_recomputed,
            models: trained,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Score a point without emitting an anomaly
    ///
    /// Returns `None` when the point has no finite primary value.
    pub fn evaluate(&self, data: &MonitoringData) -> Result<Option<Evaluation>> {
        let _guard = self.begin()?;
        let start = Instant::now();

        let Some(value) = data.extract_primary_value() else {
            self.counters.invalid_inputs.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_invalid_inputs();
            debug!(source = %data.source, data_type = %data.data_type(), "Skipping point without a finite value");
            return Ok(None);
        };

        let baseline = self.baselines.get_baseline(data);
        let features = [value];

        let mut model_scores = BTreeMap::new();
        for slot in &self.models {
            let score = match slot.model.read() {
                Ok(model) => model.predict(&features),
                Err(e) => Err(ModelError::Inference(e.to_string())),
            };
            let score = match score {
                Ok(s) if s.is_finite() => s.clamp(0.0, 1.0),
                Ok(_) => {
                    self.record_model_failure(&slot.id, "non-finite score");
                    0.0
                }
                Err(ModelError::NotTrained) => 0.0,
                Err(e) => {
                    self.record_model_failure(&slot.id, &e.to_string());
                    0.0
                }
            };
            model_scores.insert(slot.id.clone(), score);
        }

        let scores: Vec<f64> = model_scores.values().copied().collect();
        let ensemble_score = mean(&scores);
        let variance = if scores.is_empty() {
            0.0
        } else {
            scores
                .iter()
                .map(|s| (s - ensemble_score).powi(2))
                .sum::<f64>()
                / scores.len() as f64
        };
        // Same as 1 - std(percent scores) / 100, since the scores here are 0-1
        let confidence = (1.0 - variance.sqrt()).clamp(0.0, 1.0);

        let z_score = baseline.as_ref().map(|b| b.z_score(value));
        let adjusted = match z_score {
            Some(z) if z > AMPLIFY_Z_SCORE => (ensemble_score * (1.0 + z * AMPLIFY_FACTOR)).min(1.0),
            _ => ensemble_score,
        };
        let final_score = (adjusted * 100.0).clamp(0.0, 100.0);

        let thresholds = self.thresholds();
        let is_anomaly =
            final_score >= thresholds.anomaly_score && confidence >= thresholds.confidence;

        let elapsed = start.elapsed();
        self.counters.detections.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_us_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.metrics.inc_detections();
        self.metrics.observe_detection_latency(elapsed.as_secs_f64());

        Ok(Some(Evaluation {
            score: AnomalyScore {
                score: final_score,
                confidence,
                severity: Severity::from_score(final_score),
                timestamp: Utc::now(),
            },
            ensemble_score,
            model_scores,
            baseline,
            z_score,
            is_anomaly,
        }))
    }

    /// Score a point and build an explained anomaly when both thresholds are met
    pub fn detect(&self, data: &MonitoringData) -> Result<Option<Anomaly>> {
        let Some(evaluation) = self.evaluate(data)? else {
            return Ok(None);
        };
        if !evaluation.is_anomaly {
            return Ok(None);
        }

        let baseline = evaluation.baseline.as_deref();
        let explanation =
            self.explainer
                .explain(data, &evaluation.score, baseline, &evaluation.model_scores);
        let anomaly = Anomaly {
            id: Uuid::new_v4(),
            kind: AnomalyKind::classify(data, baseline),
            score: evaluation.score,
            data: data.clone(),
            explanation,
            model_scores: evaluation.model_scores,
            baseline: baseline.cloned(),
        };

        self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_anomalies(anomaly.score.severity);
        self.logger.log_anomaly(&anomaly);
        self.emit(DetectorEvent::AnomalyDetected(Box::new(anomaly.clone())));

        Ok(Some(anomaly))
    }

    /// Detect over `items` in chunks of `batch_size`, preserving order
    ///
    /// Fails with the first per-item error; see [`detect_each`](Self::detect_each)
    /// for per-item outcomes.
    pub async fn detect_batch(
        self: &Arc<Self>,
        items: Vec<MonitoringData>,
    ) -> Result<Vec<Option<Anomaly>>> {
        self.ensure_running()?;
        self.detect_each(items).await.into_iter().collect()
    }

    /// Like [`detect_batch`](Self::detect_batch) but keeps every item's outcome
    pub async fn detect_each(
        self: &Arc<Self>,
        items: Vec<MonitoringData>,
    ) -> Vec<Result<Option<Anomaly>>> {
        let start = Instant::now();
        let total = items.len();
        let batch_size = self.config.performance.batch_size;

        let mut results = Vec::with_capacity(total);
        let mut remaining = items;
        while !remaining.is_empty() {
            let rest = remaining.split_off(batch_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);

            if self.config.performance.parallel_processing {
                let handles: Vec<_> = chunk
                    .into_iter()
                    .map(|item| {
                        let detector = Arc::clone(self);
                        tokio::task::spawn_blocking(move || detector.detect(&item))
                    })
                    .collect();
                for handle in handles {
                    results.push(match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(DetectorError::TaskFailed(e.to_string())),
                    });
                }
            } else {
                results.extend(chunk.iter().map(|item| self.detect(item)));
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        if total > 0 && elapsed > 0.0 {
            let throughput = total as f64 / elapsed;
            self.counters
                .batch_throughput
                .store(throughput.to_bits(), Ordering::Relaxed);
            self.metrics.set_batch_throughput(throughput);
            debug!(items = total, items_per_sec = throughput, "Batch detection complete");
        }

        results
    }

    /// Buffer a label and raise thresholds when false positives dominate
    pub fn process_feedback(&self, feedback: Feedback) -> Result<Option<ThresholdAdjustment>> {
        self.ensure_running()?;

        let Some(signal) = self.tuner.record(feedback, Utc::now())? else {
            return Ok(None);
        };

        let (previous, current) = {
            let mut thresholds = write(&self.thresholds)?;
            let previous = *thresholds;
            *thresholds = self.tuner.raise(&previous);
            (previous, *thresholds)
        };

        for slot in self.models.iter().filter(|s| s.spec.auto_tune) {
            let mut model = write(&slot.model)?;
            let raised = self.tuner.raise_model_threshold(model.threshold());
            model.set_threshold(raised);
        }

        self.metrics
            .set_thresholds(current.anomaly_score, current.confidence);
        self.logger.log_thresholds_adjusted(
            signal.false_positive_rate,
            previous.anomaly_score,
            current.anomaly_score,
            previous.confidence,
            current.confidence,
        );

        let adjustment = ThresholdAdjustment {
            previous,
            current,
            false_positive_rate: signal.false_positive_rate,
            feedback_count: signal.feedback_count,
            timestamp: Utc::now(),
        };
        self.emit(DetectorEvent::ThresholdsAdjusted(adjustment.clone()));
        Ok(Some(adjustment))
    }

    /// Serialized state of every trained model, keyed by model id
    pub fn save_models(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut saved = BTreeMap::new();
        for slot in &self.models {
            let model = read(&slot.model)?;
            if model.is_trained() {
                saved.insert(slot.id.clone(), model.save()?);
            }
        }
        Ok(saved)
    }

    /// Restore models from [`save_models`](Self::save_models) output
    ///
    /// Ids without a saved entry are left untouched. A model whose payload
    /// fails to load keeps its current state and the error is returned.
    pub fn load_models(&self, saved: &BTreeMap<String, Vec<u8>>) -> Result<usize> {
        let mut loaded = 0;
        for slot in &self.models {
            let Some(bytes) = saved.get(&slot.id) else {
                continue;
            };
            let mut candidate = read(&slot.model)?.clone();
            candidate.load(bytes)?;
            *write(&slot.model)? = candidate;
            loaded += 1;
        }
        info!(loaded, "Loaded saved models");
        Ok(loaded)
    }

    /// Publish component health for the detector, its baselines and models
    pub async fn report_health(&self, registry: &HealthRegistry) {
        let state = self.state();
        match state {
            DetectorState::Uninitialized => {
                registry
                    .set_degraded(components::DETECTOR, "Detector not initialized")
                    .await
            }
            DetectorState::ShuttingDown | DetectorState::Stopped => {
                registry
                    .set_unhealthy(components::DETECTOR, format!("Detector {}", state))
                    .await
            }
            _ => registry.set_healthy(components::DETECTOR).await,
        }

        let baseline_stats = self.baselines.stats();
        if baseline_stats.keys_with_baseline > 0 {
            registry.set_healthy(components::BASELINES).await;
        } else {
            registry
                .set_degraded(components::BASELINES, "No series has enough points yet")
                .await;
        }

        let trained = self
            .models
            .iter()
            .filter(|s| {
                s.model
                    .read()
                    .map(|m| m.is_trained())
                    .unwrap_or(false)
            })
            .count();
        if trained == self.models.len() {
            registry.set_healthy(components::MODELS).await;
        } else {
            registry
                .set_degraded(
                    components::MODELS,
                    format!("{} of {} models trained", trained, self.models.len()),
                )
                .await;
        }

        registry
            .set_ready(matches!(
                state,
                DetectorState::Ready | DetectorState::Detecting | DetectorState::Training
            ))
            .await;
    }

    /// Stop accepting work, wait for in-flight calls and release state
    pub async fn shutdown(&self) -> Result<()> {
        let from = {
            let mut lifecycle = write(&self.lifecycle)?;
            let from = *lifecycle;
            if matches!(from, DetectorState::ShuttingDown | DetectorState::Stopped) {
                return Ok(());
            }
            *lifecycle = DetectorState::ShuttingDown;
            from
        };
        self.emit(DetectorEvent::StateChanged {
            from,
            to: DetectorState::ShuttingDown,
        });
        self.logger.log_shutdown("requested");

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.baselines.clear();
        for slot in &self.models {
            let mut model = write(&slot.model)?;
            let threshold = model.threshold();
            *model = DetectionModel::from_kind(&slot.spec.model, threshold);
        }
        self.metrics.set_baseline_keys(0);

        *write(&self.lifecycle)? = DetectorState::Stopped;
        self.emit(DetectorEvent::StateChanged {
            from: DetectorState::ShuttingDown,
            to: DetectorState::Stopped,
        });
        info!(instance = %self.config.instance_name, "Anomaly detector stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner) {
            DetectorState::Uninitialized => Err(DetectorError::NotInitialized),
            DetectorState::ShuttingDown | DetectorState::Stopped => Err(DetectorError::ShutDown),
            _ => Ok(()),
        }
    }

    /// Register an in-flight call, failing if the detector is not running
    fn begin(&self) -> Result<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        self.ensure_running()?;
        Ok(guard)
    }

    fn record_model_failure(&self, model: &str, error: &str) {
        self.counters.model_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_model_failures(model);
        debug!(model = %model, error = %error, "Model prediction failed, scoring 0");
    }

    fn emit(&self, event: DetectorEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| DetectorError::LockPoisoned(e.to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| DetectorError::LockPoisoned(e.to_string()))
}
