//! Baseline store keyed by (data type, source, relevant tags)
//!
//! Each key owns an independent, timestamp-sorted series. Writers to the same
//! key are serialized by the map's entry lock; reads of other keys proceed
//! concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::stats::{mean, percentiles, sample_std_dev, seasonal_patterns, linear_trend};
use super::{BaselineConfig, BaselineData};
use crate::error::PersistenceError;
use crate::models::{DataPayload, MonitoringData, TimeSeriesPoint};
use crate::persistence;

/// Default z-score sensitivity for [`BaselineManager::is_anomalous`]
pub const DEFAULT_SENSITIVITY: f64 = 2.0;

/// Tags that vary per request and would fragment a series
const VOLATILE_TAGS: &[&str] = &[
    "request_id",
    "trace_id",
    "span_id",
    "session_id",
    "user_id",
    "timestamp",
];

const EXPORT_PAYLOAD_TYPE: &str = "baselines";

/// Derive the baseline key for a point
///
/// Two points share a baseline iff their keys are equal. Metric names are
/// folded in as a `__name__` label so different metrics from one source do
/// not share a series.
pub fn baseline_key(data: &MonitoringData) -> String {
    let mut labels: Vec<(&str, &str)> = data
        .tags
        .iter()
        .filter(|(k, _)| !VOLATILE_TAGS.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if let DataPayload::Metric { name, .. } = &data.payload {
        labels.push(("__name__", name.as_str()));
    }
    labels.sort_unstable();

    let labels = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}|{}|{}", data.data_type(), data.source, labels)
}

/// Result of a z-score / percentile check against a baseline
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyCheck {
    pub is_anomaly: bool,
    /// 0-1
    pub score: f64,
    pub reason: String,
}

/// Outcome of ingesting points for one key
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineUpdate {
    pub key: String,
    pub sample_size: usize,
    pub recomputed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupStats {
    pub removed_points: usize,
    pub removed_keys: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineStats {
    pub keys: usize,
    pub keys_with_baseline: usize,
    pub total_points: usize,
}

#[derive(Debug, Default)]
struct SeriesEntry {
    points: Vec<TimeSeriesPoint>,
    baseline: Option<Arc<BaselineData>>,
    /// Bumped on every append
    generation: u64,
}

#[derive(Serialize, Deserialize)]
struct BaselineExport {
    baselines: BTreeMap<String, BaselineData>,
}

/// Maintains per-key series and derived baselines
#[derive(Debug)]
pub struct BaselineManager {
    config: BaselineConfig,
    series: DashMap<String, SeriesEntry>,
}

impl Default for BaselineManager {
    fn default() -> Self {
        Self::new(BaselineConfig::default())
    }
}

impl BaselineManager {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config,
            series: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Append points to their series and recompute snapshots where possible
    ///
    /// Points whose primary value is not finite are skipped.
    pub fn update_baselines(&self, points: &[MonitoringData]) -> Vec<BaselineUpdate> {
        let mut grouped: HashMap<String, Vec<TimeSeriesPoint>> = HashMap::new();
        let mut skipped = 0usize;

        for data in points {
            let Some(value) = data.extract_primary_value() else {
                skipped += 1;
                continue;
            };
            grouped
                .entry(baseline_key(data))
                .or_default()
                .push(TimeSeriesPoint {
                    timestamp: data.timestamp,
                    value,
                    source: data.source.clone(),
                    data_type: data.data_type(),
                });
        }

        if skipped > 0 {
            debug!(skipped, "Skipped non-finite points during baseline update");
        }

        let mut updates = Vec::with_capacity(grouped.len());
        for (key, new_points) in grouped {
            let (window, generation, sample_size) = {
                let mut entry = self.series.entry(key.clone()).or_default();
                entry.points.extend(new_points);
                entry.points.sort_by_key(|p| p.timestamp);
                self.enforce_cap(&mut entry.points);
                entry.generation += 1;

                let window = (entry.points.len() >= self.config.min_data_points)
                    .then(|| entry.points.clone());
                (window, entry.generation, entry.points.len())
            };

            // Shard guard is released while the snapshot is computed
            let recomputed = match window {
                Some(window) => {
                    let baseline = Arc::new(compute_baseline(&window));
                    if let Some(mut entry) = self.series.get_mut(&key) {
                        // A newer writer recomputes from its own window
                        if entry.generation == generation {
                            entry.baseline = Some(baseline);
                        }
                    }
                    true
                }
                None => false,
            };

            updates.push(BaselineUpdate {
                key,
                sample_size,
                recomputed,
            });
        }

        updates
    }

    /// Current snapshot for the point's key, if one exists
    pub fn get_baseline(&self, data: &MonitoringData) -> Option<Arc<BaselineData>> {
        self.get_baseline_by_key(&baseline_key(data))
    }

    pub fn get_baseline_by_key(&self, key: &str) -> Option<Arc<BaselineData>> {
        self.series.get(key).and_then(|entry| entry.baseline.clone())
    }

    /// Combine the z-score rule with the p10/p90 percentile rule
    pub fn is_anomalous(value: f64, baseline: &BaselineData, sensitivity: f64) -> AnomalyCheck {
        let z_score = baseline.z_score(value);
        let z_rule = z_score > sensitivity;
        let below = value < baseline.percentiles.p10;
        let above = value > baseline.percentiles.p90;

        let mut reasons = Vec::new();
        if z_rule {
            reasons.push(format!(
                "z-score {:.2} exceeds sensitivity {:.2}",
                z_score, sensitivity
            ));
        }
        if below {
            reasons.push(format!(
                "value {:.2} below 10th percentile {:.2}",
                value, baseline.percentiles.p10
            ));
        }
        if above {
            reasons.push(format!(
                "value {:.2} above 90th percentile {:.2}",
                value, baseline.percentiles.p90
            ));
        }

        let is_anomaly = z_rule || below || above;
        AnomalyCheck {
            is_anomaly,
            score: (z_score / 3.0).min(1.0),
            reason: if is_anomaly {
                reasons.join("; ")
            } else {
                "within normal range".to_string()
            },
        }
    }

    /// Evict points outside the retention window and enforce the size cap
    pub fn cleanup(&self) -> CleanupStats {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupStats {
        let cutoff = now - Duration::days(self.config.retention_days);
        let mut stats = CleanupStats::default();

        for mut entry in self.series.iter_mut() {
            let before = entry.points.len();
            entry.points.retain(|p| p.timestamp >= cutoff);
            self.enforce_cap(&mut entry.points);
            let removed = before - entry.points.len();
            stats.removed_points += removed;

            if removed > 0 {
                entry.baseline = if entry.points.len() >= self.config.min_data_points {
                    Some(Arc::new(compute_baseline(&entry.points)))
                } else {
                    None
                };
            }
        }

        let keys_before = self.series.len();
        // Imported snapshots have no window yet and must survive
        self.series
            .retain(|_, entry| !entry.points.is_empty() || entry.baseline.is_some());
        stats.removed_keys = keys_before - self.series.len();

        if stats.removed_points > 0 {
            info!(
                removed_points = stats.removed_points,
                removed_keys = stats.removed_keys,
                "Baseline cleanup complete"
            );
        }
        stats
    }

    pub fn keys(&self) -> Vec<String> {
        self.series.iter().map(|e| e.key().clone()).collect()
    }

    pub fn series_len(&self, key: &str) -> usize {
        self.series.get(key).map(|e| e.points.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> BaselineStats {
        self.series.iter().fold(BaselineStats::default(), |mut acc, e| {
            acc.keys += 1;
            acc.total_points += e.points.len();
            if e.baseline.is_some() {
                acc.keys_with_baseline += 1;
            }
            acc
        })
    }

    /// Drop every series and snapshot
    pub fn clear(&self) {
        self.series.clear();
    }

    /// Serialize all current snapshots
    pub fn export(&self) -> Result<Vec<u8>, PersistenceError> {
        let baselines = self
            .series
            .iter()
            .filter_map(|e| e.baseline.as_ref().map(|b| (e.key().clone(), (**b).clone())))
            .collect();
        persistence::encode(EXPORT_PAYLOAD_TYPE, &BaselineExport { baselines })
    }

    /// Restore snapshots written by [`export`](Self::export)
    ///
    /// Imported snapshots stand until enough new points arrive for the key to
    /// be recomputed. Returns the number of keys restored.
    pub fn import(&self, bytes: &[u8]) -> Result<usize, PersistenceError> {
        let export: BaselineExport = persistence::decode(EXPORT_PAYLOAD_TYPE, bytes)?;
        let count = export.baselines.len();
        for (key, baseline) in export.baselines {
            self.series.entry(key).or_default().baseline = Some(Arc::new(baseline));
        }
        Ok(count)
    }

    fn enforce_cap(&self, points: &mut Vec<TimeSeriesPoint>) {
        if points.len() > self.config.max_history_size {
            let excess = points.len() - self.config.max_history_size;
            points.drain(0..excess);
        }
    }
}

fn compute_baseline(points: &[TimeSeriesPoint]) -> BaselineData {
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let avg = mean(&values);
    BaselineData {
        mean: avg,
        std_dev: sample_std_dev(&values, avg),
        min: sorted.first().copied().unwrap_or(0.0),
        max: sorted.last().copied().unwrap_or(0.0),
        percentiles: percentiles(&sorted),
        seasonal_patterns: seasonal_patterns(points),
        trend: linear_trend(&values),
        last_updated: Utc::now(),
        sample_size: points.len(),
        last_value: values.last().copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::TrendDirection;
    use crate::models::{LogLevel, MonitoringData};

    fn metric_points(count: usize, value: impl Fn(usize) -> f64) -> Vec<MonitoringData> {
        let start = Utc::now() - Duration::minutes(count as i64);
        (0..count)
            .map(|i| {
                MonitoringData::metric("api", "cpu", value(i))
                    .with_timestamp(start + Duration::minutes(i as i64))
            })
            .collect()
    }

    fn near_hundred(i: usize) -> f64 {
        100.0 + ((i % 7) as f64 - 3.0) * 0.5
    }

    #[test]
    fn test_key_ignores_tag_order_and_volatile_tags() {
        let a = MonitoringData::metric("api", "cpu", 1.0)
            .with_tag("region", "eu")
            .with_tag("host", "a")
            .with_tag("request_id", "123");
        let b = MonitoringData::metric("api", "cpu", 2.0)
            .with_tag("host", "a")
            .with_tag("region", "eu")
            .with_tag("request_id", "456");
        assert_eq!(baseline_key(&a), baseline_key(&b));

        let other_host = MonitoringData::metric("api", "cpu", 1.0).with_tag("host", "b");
        assert_ne!(baseline_key(&a), baseline_key(&other_host));

        let other_type = MonitoringData::log("api", LogLevel::Info, "ok");
        assert_ne!(baseline_key(&a), baseline_key(&other_type));
    }

    #[test]
    fn test_no_baseline_below_minimum() {
        let manager = BaselineManager::default();
        let points = metric_points(99, near_hundred);

        let updates = manager.update_baselines(&points);
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].recomputed);
        assert!(manager.get_baseline(&points[0]).is_none());
    }

    #[test]
    fn test_baseline_from_200_points() {
        let manager = BaselineManager::default();
        let points = metric_points(200, near_hundred);
        manager.update_baselines(&points);

        let baseline = manager.get_baseline(&points[0]).expect("baseline");
        assert_eq!(baseline.sample_size, 200);
        assert!((baseline.mean - 100.0).abs() < 0.1, "mean was {}", baseline.mean);
        assert!(baseline.std_dev > 0.0);
        assert!(baseline.min <= baseline.percentiles.p10);
        assert!(baseline.percentiles.p99 <= baseline.max);
        assert_eq!(baseline.last_value, Some(near_hundred(199)));
    }

    #[test]
    fn test_non_finite_points_filtered() {
        let manager = BaselineManager::default();
        let mut points = metric_points(120, near_hundred);
        points.push(MonitoringData::metric("api", "cpu", f64::NAN));
        points.push(MonitoringData::metric("api", "cpu", f64::INFINITY));

        manager.update_baselines(&points);
        let baseline = manager.get_baseline(&points[0]).expect("baseline");
        assert_eq!(baseline.sample_size, 120);
        assert!(baseline.mean.is_finite());
    }

    #[test]
    fn test_history_cap_drops_oldest() {
        let manager = BaselineManager::new(BaselineConfig {
            min_data_points: 10,
            max_history_size: 50,
            retention_days: 7,
        });
        let points = metric_points(80, |i| i as f64);
        manager.update_baselines(&points);

        let key = baseline_key(&points[0]);
        assert_eq!(manager.series_len(&key), 50);
        let baseline = manager.get_baseline_by_key(&key).unwrap();
        assert_eq!(baseline.min, 30.0);
    }

    #[test]
    fn test_series_sorted_by_timestamp() {
        let manager = BaselineManager::new(BaselineConfig {
            min_data_points: 5,
            ..Default::default()
        });
        let mut points = metric_points(10, |i| i as f64);
        points.reverse();
        manager.update_baselines(&points);

        let baseline = manager.get_baseline(&points[0]).unwrap();
        // The newest point (value 9) is last after sorting
        assert_eq!(baseline.last_value, Some(9.0));
        assert_eq!(baseline.trend.direction, TrendDirection::Increasing);
    }

    #[test]
    fn test_is_anomalous_rules() {
        let manager = BaselineManager::default();
        let points = metric_points(200, near_hundred);
        manager.update_baselines(&points);
        let baseline = manager.get_baseline(&points[0]).unwrap();

        let normal = BaselineManager::is_anomalous(100.0, &baseline, DEFAULT_SENSITIVITY);
        assert!(!normal.is_anomaly);

        let spike = BaselineManager::is_anomalous(150.0, &baseline, DEFAULT_SENSITIVITY);
        assert!(spike.is_anomaly);
        assert_eq!(spike.score, 1.0);
        assert!(spike.reason.contains("z-score"));
    }

    #[test]
    fn test_cleanup_evicts_expired_points() {
        let manager = BaselineManager::new(BaselineConfig {
            min_data_points: 10,
            max_history_size: 1000,
            retention_days: 7,
        });
        let now = Utc::now();
        let old: Vec<MonitoringData> = (0..20)
            .map(|i| {
                MonitoringData::metric("api", "cpu", i as f64)
                    .with_timestamp(now - Duration::days(10) + Duration::minutes(i))
            })
            .collect();
        let fresh: Vec<MonitoringData> = (0..5)
            .map(|i| {
                MonitoringData::metric("api", "cpu", i as f64)
                    .with_timestamp(now - Duration::minutes(i))
            })
            .collect();
        let stale_only = MonitoringData::metric("batch", "jobs", 1.0)
            .with_timestamp(now - Duration::days(30));

        manager.update_baselines(&old);
        manager.update_baselines(&fresh);
        manager.update_baselines(&[stale_only]);
        assert!(manager.get_baseline(&old[0]).is_some());

        let stats = manager.cleanup_at(now);
        assert_eq!(stats.removed_points, 21);
        assert_eq!(stats.removed_keys, 1);
        assert_eq!(manager.series_len(&baseline_key(&fresh[0])), 5);
        // Too few points remain to keep a snapshot
        assert!(manager.get_baseline(&fresh[0]).is_none());
    }

    #[test]
    fn test_export_import_round_trip() {
        let manager = BaselineManager::default();
        let points = metric_points(150, near_hundred);
        manager.update_baselines(&points);
        let original = manager.get_baseline(&points[0]).unwrap();

        let bytes = manager.export().unwrap();
        let restored = BaselineManager::default();
        assert_eq!(restored.import(&bytes).unwrap(), 1);

        let loaded = restored.get_baseline(&points[0]).unwrap();
        assert_eq!(*loaded, *original);
    }

    #[test]
    fn test_cleanup_keeps_imported_baselines() {
        let manager = BaselineManager::default();
        let points = metric_points(150, near_hundred);
        manager.update_baselines(&points);
        let bytes = manager.export().unwrap();

        let restored = BaselineManager::default();
        restored.import(&bytes).unwrap();
        assert!(restored.get_baseline(&points[0]).is_some());

        let stats = restored.cleanup();
        assert_eq!(stats, CleanupStats::default());
        assert!(restored.get_baseline(&points[0]).is_some());
        assert_eq!(restored.stats().keys_with_baseline, 1);
    }

    #[test]
    fn test_concurrent_updates_leave_latest_snapshot() {
        let manager = Arc::new(BaselineManager::default());
        let points = metric_points(400, near_hundred);

        std::thread::scope(|scope| {
            for chunk in points.chunks(50) {
                let manager = Arc::clone(&manager);
                scope.spawn(move || {
                    for point in chunk {
                        manager.update_baselines(std::slice::from_ref(point));
                    }
                });
            }
        });

        let key = baseline_key(&points[0]);
        let baseline = manager.get_baseline_by_key(&key).expect("baseline");
        assert_eq!(manager.series_len(&key), 400);
        assert_eq!(baseline.sample_size, 400);
    }

    #[test]
    fn test_stats() {
        let manager = BaselineManager::default();
        manager.update_baselines(&metric_points(120, near_hundred));
        manager.update_baselines(&[MonitoringData::log("api", LogLevel::Warn, "slow")]);

        let stats = manager.stats();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.keys_with_baseline, 1);
        assert_eq!(stats.total_points, 121);
    }
}
