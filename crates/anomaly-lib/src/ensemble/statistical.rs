//! Z-score and IQR fallback model

use serde::{Deserialize, Serialize};

use super::{check_dimensions, estimate_metrics, validate_samples, AnomalyModel, ModelMetrics, ModelType};
use crate::baseline::{mean, percentile, sample_std_dev};
use crate::error::ModelError;
use crate::persistence;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalParams {
    /// Z-score mapped to a full deviation score
    pub z_score_limit: f64,
    pub iqr_factor: f64,
}

impl Default for StatisticalParams {
    fn default() -> Self {
        Self {
            z_score_limit: 3.0,
            iqr_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FeatureStats {
    mean: f64,
    std_dev: f64,
    q1: f64,
    q3: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatisticalState {
    features: Vec<FeatureStats>,
    metrics: ModelMetrics,
}

#[derive(Debug, Clone)]
pub struct StatisticalModel {
    params: StatisticalParams,
    threshold: f64,
    state: Option<StatisticalState>,
    metrics: ModelMetrics,
}

impl StatisticalModel {
    pub fn new(params: StatisticalParams, threshold: f64) -> Self {
        Self {
            params,
            threshold,
            state: None,
            metrics: ModelMetrics::default(),
        }
    }

    fn feature_score(&self, stats: &FeatureStats, value: f64) -> f64 {
        let diff = (value - stats.mean).abs();
        let z_component = if stats.std_dev < f64::EPSILON {
            if diff < f64::EPSILON { 0.0 } else { 1.0 }
        } else {
            (diff / stats.std_dev / self.params.z_score_limit).min(1.0)
        };

        let iqr = stats.q3 - stats.q1;
        let outlier = value < stats.q1 - self.params.iqr_factor * iqr
            || value > stats.q3 + self.params.iqr_factor * iqr;

        (z_component + if outlier { 1.0 } else { 0.0 }) / 2.0
    }
}

impl AnomalyModel for StatisticalModel {
    fn model_type(&self) -> ModelType {
        ModelType::Statistical
    }

    fn initialize(&mut self) {
        self.state = None;
        self.metrics = ModelMetrics::default();
    }

    fn train(&mut self, samples: &[Vec<f64>]) -> Result<(), ModelError> {
        let dims = validate_samples(samples)?;

        let features = (0..dims)
            .map(|j| {
                let mut column: Vec<f64> = samples.iter().map(|s| s[j]).collect();
                let m = mean(&column);
                let std_dev = sample_std_dev(&column, m);
                column.sort_by(|a, b| a.total_cmp(b));
                FeatureStats {
                    mean: m,
                    std_dev,
                    q1: percentile(&column, 25.0),
                    q3: percentile(&column, 75.0),
                }
            })
            .collect();

        self.state = Some(StatisticalState {
            features,
            metrics: ModelMetrics::default(),
        });
        self.metrics = estimate_metrics(&*self, samples);
        Ok(())
    }

    /// Worst per-feature score
    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotTrained)?;
        check_dimensions(state.features.len(), features)?;

        Ok(state
            .features
            .iter()
            .zip(features)
            .map(|(stats, &v)| self.feature_score(stats, v))
            .fold(0.0, f64::max))
    }

    fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    fn metrics(&self) -> &ModelMetrics {
        &self.metrics
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    fn save(&self) -> Result<Vec<u8>, ModelError> {
        let mut state = self.state.clone().ok_or(ModelError::NotTrained)?;
        state.metrics = self.metrics.clone();
        Ok(persistence::encode(ModelType::Statistical.as_str(), &state)?)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let state: StatisticalState = persistence::decode(ModelType::Statistical.as_str(), bytes)?;
        self.metrics = state.metrics.clone();
        self.state = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained(samples: &[Vec<f64>]) -> StatisticalModel {
        let mut model = StatisticalModel::new(StatisticalParams::default(), 0.6);
        model.train(samples).unwrap();
        model
    }

    #[test]
    fn test_score_components() {
        // mean 10, Q1 9, Q3 11
        let samples: Vec<Vec<f64>> = [8.0, 9.0, 9.0, 10.0, 10.0, 10.0, 11.0, 11.0, 12.0]
            .iter()
            .map(|v| vec![*v])
            .collect();
        let model = trained(&samples);

        assert_eq!(model.predict(&[10.0]).unwrap(), 0.0);

        // Far beyond both the z limit and the IQR fence
        assert_eq!(model.predict(&[100.0]).unwrap(), 1.0);

        // Inside the fences, so only the z component contributes
        let mild = model.predict(&[12.0]).unwrap();
        assert!(mild > 0.0 && mild < 0.5);
    }

    #[test]
    fn test_max_over_features() {
        let samples: Vec<Vec<f64>> = (0..50).map(|i| vec![(i % 5) as f64, 100.0 + (i % 3) as f64]).collect();
        let model = trained(&samples);

        let one_bad = model.predict(&[2.0, 500.0]).unwrap();
        assert_eq!(one_bad, 1.0);
        assert!(model.predict(&[2.0, 101.0]).unwrap() < 0.5);
    }

    #[test]
    fn test_zero_variance_feature() {
        let model = trained(&vec![vec![3.0]; 10]);
        assert_eq!(model.predict(&[3.0]).unwrap(), 0.0);
        assert_eq!(model.predict(&[3.5]).unwrap(), 1.0);
    }

    #[test]
    fn test_save_and_load() {
        let model = trained(&(0..30).map(|i| vec![i as f64]).collect::<Vec<_>>());
        let bytes = model.save().unwrap();

        let mut restored = StatisticalModel::new(StatisticalParams::default(), 0.6);
        restored.load(&bytes).unwrap();
        assert_eq!(model.predict(&[45.0]).unwrap(), restored.predict(&[45.0]).unwrap());
    }
}
