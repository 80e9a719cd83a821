use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use super::*;
use crate::ensemble::{ClusteringParams, IsolationForestParams, ModelKind, StatisticalParams};
use crate::error::DetectorError;
use crate::models::{AnomalyKind, Feedback, MonitoringData};

fn seeded_config() -> DetectorConfig {
    DetectorConfig {
        models: vec![
            ModelSpec::new(ModelKind::IsolationForest(IsolationForestParams {
                seed: Some(7),
                ..Default::default()
            })),
            ModelSpec::new(ModelKind::Clustering(ClusteringParams {
                seed: Some(7),
                ..Default::default()
            })),
            ModelSpec::new(ModelKind::Statistical(StatisticalParams::default())),
        ],
        ..Default::default()
    }
}

/// Metric points drawn from N(mean, std_dev) via Box-Muller
fn normal_points(n: usize, mean: f64, std_dev: f64, seed: u64) -> Vec<MonitoringData> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = Utc::now() - Duration::minutes(n as i64);
    (0..n)
        .map(|i| {
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            MonitoringData::metric("api", "latency_ms", mean + std_dev * z)
                .with_timestamp(start + Duration::minutes(i as i64))
        })
        .collect()
}

fn latency(value: f64) -> MonitoringData {
    MonitoringData::metric("api", "latency_ms", value)
}

fn trained_detector() -> AnomalyDetector {
    let detector = AnomalyDetector::new(seeded_config()).unwrap();
    detector.initialize().unwrap();
    detector.train(&normal_points(100, 100.0, 10.0, 42)).unwrap();
    detector
}

#[test]
fn test_end_to_end_detection() {
    let detector = trained_detector();

    assert!(detector.detect(&latency(105.0)).unwrap().is_none());

    let anomaly = detector.detect(&latency(1000.0)).unwrap().unwrap();
    assert!(anomaly.score.score > 50.0);
    assert!(anomaly.score.confidence >= 0.6);
    assert!(!anomaly.explanation.factors.is_empty());
    assert_eq!(anomaly.kind, AnomalyKind::Spike);
    assert_eq!(anomaly.model_scores.len(), 3);
    assert!(anomaly.baseline.is_some());

    let stats = detector.stats();
    assert_eq!(stats.detections, 2);
    assert_eq!(stats.anomalies, 1);
    assert!(stats.last_trained.is_some());
}

#[test]
fn test_scores_stay_in_range() {
    let detector = trained_detector();
    for value in [-1e9, -50.0, 0.0, 95.0, 100.0, 130.0, 500.0, 1e12] {
        let evaluation = detector.evaluate(&latency(value)).unwrap().unwrap();
        assert!((0.0..=100.0).contains(&evaluation.score.score), "score for {}", value);
        assert!((0.0..=1.0).contains(&evaluation.score.confidence));
        assert!(evaluation.model_scores.values().all(|s| (0.0..=1.0).contains(s)));
    }
}

#[test]
fn test_extreme_z_score_amplifies() {
    let detector = trained_detector();
    let evaluation = detector.evaluate(&latency(1000.0)).unwrap().unwrap();

    assert!(evaluation.z_score.unwrap() > AMPLIFY_Z_SCORE);
    assert_eq!(evaluation.score.score, 100.0);
    assert!(evaluation.ensemble_score < 1.0);
    assert!(evaluation.is_anomaly);
}

#[test]
fn test_calls_before_initialize_fail() {
    let detector = AnomalyDetector::new(seeded_config()).unwrap();
    assert_eq!(detector.state(), DetectorState::Uninitialized);

    assert!(matches!(
        detector.detect(&latency(1.0)),
        Err(DetectorError::NotInitialized)
    ));
    assert!(matches!(
        detector.train(&normal_points(10, 1.0, 1.0, 1)),
        Err(DetectorError::NotInitialized)
    ));
}

#[test]
fn test_invalid_input_is_filtered() {
    let detector = trained_detector();
    assert!(detector.detect(&latency(f64::NAN)).unwrap().is_none());
    assert!(detector.detect(&latency(f64::INFINITY)).unwrap().is_none());
    assert_eq!(detector.stats().invalid_inputs, 2);
    assert_eq!(detector.stats().detections, 0);
}

#[test]
fn test_untrained_models_score_zero() {
    let detector = AnomalyDetector::new(seeded_config()).unwrap();
    detector.initialize().unwrap();

    let evaluation = detector.evaluate(&latency(1000.0)).unwrap().unwrap();
    assert_eq!(evaluation.score.score, 0.0);
    assert!(!evaluation.is_anomaly);
    assert!(evaluation.baseline.is_none());
    assert_eq!(detector.stats().model_failures, 0);
}

#[test]
fn test_training_without_valid_samples_keeps_state() {
    let detector = trained_detector();
    let before = detector.evaluate(&latency(130.0)).unwrap().unwrap();

    let bad = vec![latency(f64::NAN), latency(f64::NAN)];
    assert!(matches!(
        detector.train(&bad),
        Err(DetectorError::TrainingFailed(_))
    ));

    let after = detector.evaluate(&latency(130.0)).unwrap().unwrap();
    assert_eq!(before.model_scores, after.model_scores);
    assert_eq!(detector.state(), DetectorState::Ready);
}

#[test]
fn test_training_report() {
    let detector = AnomalyDetector::new(seeded_config()).unwrap();
    detector.initialize().unwrap();

    let mut points = normal_points(120, 100.0, 10.0, 3);
    points.push(latency(f64::NAN));
    let report = detector.train(&points).unwrap();

    assert_eq!(report.samples, 120);
    assert_eq!(report.skipped_invalid, 1);
    assert_eq!(report.baselines_recomputed, 1);
    assert_eq!(
        report.models.keys().cloned().collect::<Vec<_>>(),
        vec!["clustering", "isolation_forest", "statistical"]
    );
    assert!(report
        .models
        .values()
        .all(|m| m.training_data_size == 120 && m.last_trained.is_some()));
}

#[test]
fn test_training_samples_are_capped() {
    let mut config = seeded_config();
    config.performance.max_training_samples = 50;
    let detector = AnomalyDetector::new(config).unwrap();
    detector.initialize().unwrap();

    let report = detector.train(&normal_points(200, 100.0, 10.0, 9)).unwrap();
    assert_eq!(report.samples, 50);
    // Baselines still see the full history
    assert_eq!(detector.baselines().stats().total_points, 200);
}

#[test]
fn test_duplicate_model_types_get_distinct_ids() {
    let mut config = seeded_config();
    config
        .models
        .push(ModelSpec::new(ModelKind::Statistical(StatisticalParams {
            z_score_limit: 2.0,
            ..Default::default()
        })));
    let detector = AnomalyDetector::new(config).unwrap();
    assert_eq!(
        detector.model_ids(),
        vec!["isolation_forest", "clustering", "statistical", "statistical_2"]
    );
}

#[test]
fn test_false_positive_feedback_raises_thresholds() {
    let detector = trained_detector();
    let mut events = detector.subscribe();
    let before = detector.thresholds();

    let mut adjustment = None;
    for i in 0..10 {
        let result = detector
            .process_feedback(Feedback::new(Uuid::new_v4(), false))
            .unwrap();
        if i < 9 {
            assert!(result.is_none());
        } else {
            adjustment = result;
        }
    }

    let adjustment = adjustment.unwrap();
    let after = detector.thresholds();
    assert!(after.anomaly_score > before.anomaly_score);
    assert!(after.confidence > before.confidence);
    assert_eq!(adjustment.previous, before);
    assert_eq!(adjustment.current, after);
    assert_eq!(adjustment.feedback_count, 10);

    assert!(detector
        .model_thresholds()
        .values()
        .all(|t| (t - 0.66).abs() < 1e-9));

    match events.try_recv().unwrap() {
        DetectorEvent::ThresholdsAdjusted(event) => assert_eq!(event, adjustment),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_confirmed_feedback_keeps_thresholds() {
    let detector = trained_detector();
    for _ in 0..20 {
        let result = detector
            .process_feedback(Feedback::new(Uuid::new_v4(), true))
            .unwrap();
        assert!(result.is_none());
    }
    assert_eq!(detector.thresholds(), ThresholdConfig::default());
}

#[test]
fn test_training_publishes_events() {
    let detector = AnomalyDetector::new(seeded_config()).unwrap();
    let mut events = detector.subscribe();
    detector.initialize().unwrap();
    detector.train(&normal_points(100, 100.0, 10.0, 42)).unwrap();

    let mut trained = Vec::new();
    let mut baseline_keys = 0;
    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            DetectorEvent::ModelTrained { model, .. } => trained.push(model),
            DetectorEvent::BaselineUpdated { sample_size, .. } => {
                assert_eq!(sample_size, 100);
                baseline_keys += 1;
            }
            DetectorEvent::StateChanged { to, .. } => transitions.push(to),
            _ => {}
        }
    }

    assert_eq!(trained, vec!["isolation_forest", "clustering", "statistical"]);
    assert_eq!(baseline_keys, 1);
    assert_eq!(
        transitions,
        vec![
            DetectorState::Ready,
            DetectorState::Training,
            DetectorState::Ready
        ]
    );
}

#[test]
fn test_save_and_load_models() {
    let source = trained_detector();
    let saved = source.save_models().unwrap();
    assert_eq!(saved.len(), 3);

    let restored = AnomalyDetector::new(seeded_config()).unwrap();
    restored.initialize().unwrap();
    assert_eq!(restored.load_models(&saved).unwrap(), 3);

    for value in [90.0, 120.0, 400.0] {
        let a = source.evaluate(&latency(value)).unwrap().unwrap();
        let b = restored.evaluate(&latency(value)).unwrap().unwrap();
        assert_eq!(a.model_scores, b.model_scores);
    }
}

#[test]
fn test_load_rejects_mismatched_payload() {
    let source = trained_detector();
    let saved = source.save_models().unwrap();

    let mut swapped = BTreeMap::new();
    swapped.insert("clustering".to_string(), saved["statistical"].clone());

    let restored = AnomalyDetector::new(seeded_config()).unwrap();
    restored.initialize().unwrap();
    assert!(restored.load_models(&swapped).is_err());
}

#[tokio::test]
async fn test_batch_preserves_order() {
    let detector = Arc::new(trained_detector());
    let items = vec![latency(105.0), latency(1000.0), latency(98.0), latency(2000.0)];

    let results = assert_ok!(detector.detect_batch(items).await);

    assert_eq!(results.len(), 4);
    assert!(results[0].is_none());
    assert!(results[2].is_none());
    assert_eq!(results[1].as_ref().unwrap().data.extract_primary_value(), Some(1000.0));
    assert_eq!(results[3].as_ref().unwrap().data.extract_primary_value(), Some(2000.0));
    assert!(detector.stats().last_batch_throughput > 0.0);
}

#[tokio::test]
async fn test_sequential_batches_in_small_chunks() {
    let mut config = seeded_config();
    config.performance.parallel_processing = false;
    config.performance.batch_size = 3;
    let detector = AnomalyDetector::new(config).unwrap();
    detector.initialize().unwrap();
    detector.train(&normal_points(100, 100.0, 10.0, 42)).unwrap();
    let detector = Arc::new(detector);

    let items: Vec<_> = (0..10)
        .map(|i| latency(if i % 4 == 0 { 5000.0 } else { 100.0 }))
        .collect();
    let results = detector.detect_batch(items).await.unwrap();

    let flagged: Vec<usize> = results
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.as_ref().map(|_| i))
        .collect();
    assert_eq!(flagged, vec![0, 4, 8]);
}

#[tokio::test]
async fn test_queue_drains_before_shutdown() {
    let detector = Arc::new(trained_detector());
    let (queue, mut anomalies) = ProcessingQueue::start(Arc::clone(&detector));

    assert_ok!(queue.enqueue(latency(101.0)).await);
    assert_ok!(queue.enqueue(latency(1000.0)).await);
    assert_ok!(queue.enqueue(latency(99.0)).await);
    assert_ok!(queue.enqueue(latency(3000.0)).await);

    assert_ok!(queue.shutdown().await);

    let mut received = Vec::new();
    while let Some(anomaly) = anomalies.recv().await {
        received.push(anomaly.data.extract_primary_value().unwrap());
    }
    assert_eq!(received, vec![1000.0, 3000.0]);
    assert_eq!(detector.state(), DetectorState::Stopped);
}

#[tokio::test]
async fn test_queue_counts_failed_items_and_keeps_draining() {
    let detector = Arc::new(AnomalyDetector::new(seeded_config()).unwrap());
    let (queue, mut anomalies) = ProcessingQueue::start(Arc::clone(&detector));

    // Scored before initialize, so detection fails for this item
    assert_ok!(queue.enqueue(latency(1000.0)).await);
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while queue.depth() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue drained");
    assert_eq!(queue.failed(), 1);

    detector.initialize().unwrap();
    detector.train(&normal_points(100, 100.0, 10.0, 42)).unwrap();
    assert_ok!(queue.enqueue(latency(99.0)).await);
    assert_ok!(queue.enqueue(latency(2000.0)).await);
    assert_ok!(queue.shutdown().await);

    let mut received = Vec::new();
    while let Some(anomaly) = anomalies.recv().await {
        received.push(anomaly.data.extract_primary_value().unwrap());
    }
    assert_eq!(received, vec![2000.0]);
}

#[tokio::test]
async fn test_detect_each_keeps_per_item_outcomes() {
    let detector = Arc::new(AnomalyDetector::new(seeded_config()).unwrap());
    let outcomes = detector
        .detect_each(vec![latency(1.0), latency(2.0), latency(3.0)])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Err(DetectorError::NotInitialized))));
    assert!(matches!(
        detector.detect_batch(vec![latency(1.0)]).await,
        Err(DetectorError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let detector = trained_detector();
    assert_ok!(detector.shutdown().await);

    assert_eq!(detector.state(), DetectorState::Stopped);
    assert!(matches!(
        detector.detect(&latency(1000.0)),
        Err(DetectorError::ShutDown)
    ));
    assert_err!(detector.process_feedback(Feedback::new(Uuid::new_v4(), false)));
    assert_eq!(detector.baselines().stats().keys, 0);
    assert!(detector.save_models().unwrap().is_empty());

    // Idempotent
    assert_ok!(detector.shutdown().await);
}

#[tokio::test]
async fn test_report_health() {
    let registry = crate::health::HealthRegistry::new();
    let detector = AnomalyDetector::new(seeded_config()).unwrap();

    detector.report_health(&registry).await;
    assert!(!registry.readiness().await.ready);

    detector.initialize().unwrap();
    detector.train(&normal_points(100, 100.0, 10.0, 42)).unwrap();
    detector.report_health(&registry).await;

    let health = registry.health().await;
    assert_eq!(health.status, crate::health::ComponentStatus::Healthy);
    assert!(registry.readiness().await.ready);
}
