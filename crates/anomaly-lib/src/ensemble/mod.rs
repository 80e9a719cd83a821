//! Unsupervised anomaly models
//!
//! Every model implements [`AnomalyModel`] over `f64` feature vectors and
//! reports a score in `[0, 1]`. [`DetectionModel`] is the closed set of
//! variants the detector registers.

mod clustering;
mod isolation_forest;
mod sequence;
mod statistical;

pub use clustering::{ClusteringModel, ClusteringParams};
pub use isolation_forest::{IsolationForestModel, IsolationForestParams};
pub use sequence::{SequenceModel, SequenceParams};
pub use statistical::{StatisticalModel, StatisticalParams};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::{mean, sample_std_dev};
use crate::error::ModelError;

/// Training samples scored when estimating the false-positive rate
const MAX_METRIC_SAMPLES: usize = 500;

/// Distance, in standard deviations, of the synthetic outliers used for recall
const PROBE_SIGMA: f64 = 6.0;

/// Contract shared by every model in the ensemble
pub trait AnomalyModel: Send + Sync {
    fn model_type(&self) -> ModelType;

    /// Reset to the untrained state
    fn initialize(&mut self);

    /// Fit the model on samples assumed to be mostly normal
    fn train(&mut self, samples: &[Vec<f64>]) -> Result<(), ModelError>;

    /// Anomaly score in `[0, 1]`, higher is more anomalous
    fn predict(&self, features: &[f64]) -> Result<f64, ModelError>;

    fn is_trained(&self) -> bool;

    fn metrics(&self) -> &ModelMetrics;

    /// Score at or above which a sample counts as flagged
    fn threshold(&self) -> f64;

    fn set_threshold(&mut self, threshold: f64);

    /// Serialize trained parameters
    fn save(&self) -> Result<Vec<u8>, ModelError>;

    /// Restore parameters written by `save` on the same model type
    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    IsolationForest,
    Clustering,
    Statistical,
    Sequence,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::IsolationForest => "isolation_forest",
            ModelType::Clustering => "clustering",
            ModelType::Statistical => "statistical",
            ModelType::Sequence => "sequence",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model selection and parameters, as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum ModelKind {
    IsolationForest(IsolationForestParams),
    Clustering(ClusteringParams),
    Statistical(StatisticalParams),
    Sequence(SequenceParams),
}

impl ModelKind {
    pub fn model_type(&self) -> ModelType {
        match self {
            ModelKind::IsolationForest(_) => ModelType::IsolationForest,
            ModelKind::Clustering(_) => ModelType::Clustering,
            ModelKind::Statistical(_) => ModelType::Statistical,
            ModelKind::Sequence(_) => ModelType::Sequence,
        }
    }
}

/// Self-reported quality estimates, refreshed after each training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub false_positive_rate: f64,
    pub last_trained: Option<DateTime<Utc>>,
    pub training_data_size: usize,
}

/// Closed set of model variants
#[derive(Debug, Clone)]
pub enum DetectionModel {
    IsolationForest(IsolationForestModel),
    Clustering(ClusteringModel),
    Statistical(StatisticalModel),
    Sequence(SequenceModel),
}

impl DetectionModel {
    pub fn from_kind(kind: &ModelKind, threshold: f64) -> Self {
        match kind {
            ModelKind::IsolationForest(p) => {
                DetectionModel::IsolationForest(IsolationForestModel::new(p.clone(), threshold))
            }
            ModelKind::Clustering(p) => {
                DetectionModel::Clustering(ClusteringModel::new(p.clone(), threshold))
            }
            ModelKind::Statistical(p) => {
                DetectionModel::Statistical(StatisticalModel::new(p.clone(), threshold))
            }
            ModelKind::Sequence(p) => {
                DetectionModel::Sequence(SequenceModel::new(p.clone(), threshold))
            }
        }
    }

    fn inner(&self) -> &dyn AnomalyModel {
        match self {
            DetectionModel::IsolationForest(m) => m,
            DetectionModel::Clustering(m) => m,
            DetectionModel::Statistical(m) => m,
            DetectionModel::Sequence(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn AnomalyModel {
        match self {
            DetectionModel::IsolationForest(m) => m,
            DetectionModel::Clustering(m) => m,
            DetectionModel::Statistical(m) => m,
            DetectionModel::Sequence(m) => m,
        }
    }
}

impl AnomalyModel for DetectionModel {
    fn model_type(&self) -> ModelType {
        self.inner().model_type()
    }

    fn initialize(&mut self) {
        self.inner_mut().initialize()
    }

    fn train(&mut self, samples: &[Vec<f64>]) -> Result<(), ModelError> {
        self.inner_mut().train(samples)
    }

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        self.inner().predict(features)
    }

    fn is_trained(&self) -> bool {
        self.inner().is_trained()
    }

    fn metrics(&self) -> &ModelMetrics {
        self.inner().metrics()
    }

    fn threshold(&self) -> f64 {
        self.inner().threshold()
    }

    fn set_threshold(&mut self, threshold: f64) {
        self.inner_mut().set_threshold(threshold)
    }

    fn save(&self) -> Result<Vec<u8>, ModelError> {
        self.inner().save()
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        self.inner_mut().load(bytes)
    }
}

/// Check that every sample has the same non-zero dimension
pub(crate) fn validate_samples(samples: &[Vec<f64>]) -> Result<usize, ModelError> {
    let dims = samples.first().map(Vec::len).ok_or(ModelError::EmptyTrainingSet)?;
    if dims == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if let Some(bad) = samples.iter().find(|s| s.len() != dims) {
        return Err(ModelError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    if let Some(row) = samples.iter().position(|s| s.iter().any(|v| !v.is_finite())) {
        return Err(ModelError::NonFiniteSample { row });
    }
    Ok(dims)
}

pub(crate) fn check_dimensions(expected: usize, features: &[f64]) -> Result<(), ModelError> {
    if features.len() != expected {
        return Err(ModelError::DimensionMismatch {
            expected,
            actual: features.len(),
        });
    }
    Ok(())
}

/// Estimate quality metrics for a freshly trained model
///
/// Training data is treated as normal, so flagged training samples count as
/// false positives. Recall is measured on synthetic outliers placed
/// `PROBE_SIGMA` standard deviations from each feature's mean. Precision and
/// accuracy assume a balanced evaluation set of the two.
pub(crate) fn estimate_metrics(model: &dyn AnomalyModel, samples: &[Vec<f64>]) -> ModelMetrics {
    let threshold = model.threshold();
    let stride = (samples.len() / MAX_METRIC_SAMPLES).max(1);
    let evaluated: Vec<&Vec<f64>> = samples.iter().step_by(stride).collect();

    let flagged = evaluated
        .iter()
        .filter(|s| model.predict(s).map(|score| score >= threshold).unwrap_or(false))
        .count();
    let false_positive_rate = if evaluated.is_empty() {
        0.0
    } else {
        flagged as f64 / evaluated.len() as f64
    };

    let probes = outlier_probes(samples);
    let detected = probes
        .iter()
        .filter(|p| model.predict(p).map(|score| score >= threshold).unwrap_or(false))
        .count();
    let recall = if probes.is_empty() {
        0.0
    } else {
        detected as f64 / probes.len() as f64
    };

    let precision = if recall + false_positive_rate > 0.0 {
        recall / (recall + false_positive_rate)
    } else {
        0.0
    };
    let f1_score = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ModelMetrics {
        accuracy: ((1.0 - false_positive_rate) + recall) / 2.0,
        precision,
        recall,
        f1_score,
        false_positive_rate,
        last_trained: Some(Utc::now()),
        training_data_size: samples.len(),
    }
}

fn outlier_probes(samples: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let Some(dims) = samples.first().map(Vec::len) else {
        return Vec::new();
    };

    let columns: Vec<Vec<f64>> = (0..dims)
        .map(|j| samples.iter().filter_map(|s| s.get(j).copied()).collect())
        .collect();
    let centers: Vec<f64> = columns.iter().map(|c| mean(c)).collect();

    let mut probes = Vec::with_capacity(dims * 2);
    for (j, column) in columns.iter().enumerate() {
        let spread = sample_std_dev(column, centers[j])
            .max(centers[j].abs() * 0.1)
            .max(1e-3);
        for sign in [-1.0, 1.0] {
            let mut probe = centers.clone();
            probe[j] += sign * PROBE_SIGMA * spread;
            probes.push(probe);
        }
    }
    probes
}
