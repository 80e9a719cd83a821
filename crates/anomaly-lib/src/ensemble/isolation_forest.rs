//! Isolation forest
//!
//! Anomalies are isolated by fewer random axis-aligned splits, so their
//! average path length across the forest is shorter than that of normal
//! points.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{check_dimensions, estimate_metrics, validate_samples, AnomalyModel, ModelMetrics, ModelType};
use crate::error::ModelError;
use crate::persistence;

/// Euler-Mascheroni constant
const EULER_GAMMA: f64 = 0.577_215_664_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestParams {
    pub tree_count: usize,
    /// Points drawn per tree, capped at the training set size
    pub sample_size: usize,
    pub max_depth: usize,
    /// Fixed seed for reproducible forests
    pub seed: Option<u64>,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            tree_count: 100,
            sample_size: 256,
            max_depth: 10,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    Internal {
        feature_idx: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

impl IsolationNode {
    fn build<R: Rng>(
        data: &[Vec<f64>],
        indices: Vec<usize>,
        dims: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Self {
        if depth >= max_depth || indices.len() <= 1 {
            return IsolationNode::Leaf { size: indices.len() };
        }

        let feature_idx = rng.gen_range(0..dims);
        let (min, max) = indices
            .iter()
            .map(|&i| data[i][feature_idx])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

        if max - min < f64::EPSILON {
            return IsolationNode::Leaf { size: indices.len() };
        }

        // Interpolate when the span itself overflows, e.g. -1e308..1e308
        let split_value = if (max - min).is_finite() {
            rng.gen_range(min..max)
        } else {
            let t: f64 = rng.gen();
            (min * (1.0 - t) + max * t).clamp(min, max)
        };
        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| data[i][feature_idx] < split_value);

        IsolationNode::Internal {
            feature_idx,
            split_value,
            left: Box::new(Self::build(data, left, dims, depth + 1, max_depth, rng)),
            right: Box::new(Self::build(data, right, dims, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, features: &[f64]) -> f64 {
        let mut node = self;
        let mut depth = 0.0;
        loop {
            match node {
                IsolationNode::Leaf { size } => return depth + average_path_length(*size),
                IsolationNode::Internal {
                    feature_idx,
                    split_value,
                    left,
                    right,
                } => {
                    node = if features[*feature_idx] < *split_value { &**left } else { &**right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    let harmonic = (n - 1.0).ln() + EULER_GAMMA;
    2.0 * harmonic - 2.0 * (n - 1.0) / n
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForestState {
    trees: Vec<IsolationNode>,
    sample_size: usize,
    dimensions: usize,
    metrics: ModelMetrics,
}

#[derive(Debug, Clone)]
pub struct IsolationForestModel {
    params: IsolationForestParams,
    threshold: f64,
    state: Option<ForestState>,
    metrics: ModelMetrics,
}

impl IsolationForestModel {
    pub fn new(params: IsolationForestParams, threshold: f64) -> Self {
        Self {
            params,
            threshold,
            state: None,
            metrics: ModelMetrics::default(),
        }
    }

    pub fn tree_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.trees.len())
    }
}

impl AnomalyModel for IsolationForestModel {
    fn model_type(&self) -> ModelType {
        ModelType::IsolationForest
    }

    fn initialize(&mut self) {
        self.state = None;
        self.metrics = ModelMetrics::default();
    }

    fn train(&mut self, samples: &[Vec<f64>]) -> Result<(), ModelError> {
        let dims = validate_samples(samples)?;
        let mut rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let sample_size = self.params.sample_size.clamp(1, samples.len());
        let trees = (0..self.params.tree_count.max(1))
            .map(|_| {
                let indices = rand::seq::index::sample(&mut rng, samples.len(), sample_size).into_vec();
                IsolationNode::build(samples, indices, dims, 0, self.params.max_depth, &mut rng)
            })
            .collect();

        self.state = Some(ForestState {
            trees,
            sample_size,
            dimensions: dims,
            metrics: ModelMetrics::default(),
        });
        self.metrics = estimate_metrics(&*self, samples);
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotTrained)?;
        check_dimensions(state.dimensions, features)?;

        let normalizer = average_path_length(state.sample_size);
        if normalizer <= 0.0 {
            return Ok(0.5);
        }

        let total: f64 = state.trees.iter().map(|t| t.path_length(features)).sum();
        let avg = total / state.trees.len() as f64;
        Ok(2f64.powf(-avg / normalizer).clamp(0.0, 1.0))
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
        Ok(persistence::encode(ModelType::IsolationForest.as_str(), &state)?)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let state: ForestState = persistence::decode(ModelType::IsolationForest.as_str(), bytes)?;
        self.metrics = state.metrics.clone();
        self.state = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> IsolationForestModel {
        IsolationForestModel::new(
            IsolationForestParams {
                seed: Some(42),
                ..Default::default()
            },
            0.6,
        )
    }

    fn around_fifty(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| vec![45.0 + (i % 11) as f64]).collect()
    }

    #[test]
    fn test_rejects_non_finite_training_rows() {
        let mut model = seeded();
        let mut samples = around_fifty(50);
        samples.push(vec![f64::INFINITY]);

        let err = model.train(&samples).unwrap_err();
        assert!(matches!(err, ModelError::NonFiniteSample { row: 50 }));
        assert!(!model.is_trained());
    }

    #[test]
    fn test_trains_on_extreme_finite_span() {
        let mut model = seeded();
        let mut samples = around_fifty(50);
        samples.push(vec![-1e308]);
        samples.push(vec![1e308]);

        model.train(&samples).unwrap();
        let score = model.predict(&[1e308]).unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert!(score > model.predict(&[50.0]).unwrap());
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert!((average_path_length(2) - (2.0 * EULER_GAMMA - 1.0)).abs() < 1e-9);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn test_outlier_scores_higher() {
        let mut model = seeded();
        model.train(&around_fifty(100)).unwrap();
        assert_eq!(model.tree_count(), 100);

        let inlier = model.predict(&[52.0]).unwrap();
        let outlier = model.predict(&[200.0]).unwrap();
        assert!(inlier < outlier, "inlier {} outlier {}", inlier, outlier);
        assert!((0.0..=1.0).contains(&inlier));
        assert!((0.0..=1.0).contains(&outlier));
    }

    #[test]
    fn test_seeded_forests_are_reproducible() {
        let mut a = seeded();
        let mut b = seeded();
        a.train(&around_fifty(100)).unwrap();
        b.train(&around_fifty(100)).unwrap();
        assert_eq!(a.predict(&[70.0]).unwrap(), b.predict(&[70.0]).unwrap());
    }

    #[test]
    fn test_untrained_and_dimension_errors() {
        let mut model = seeded();
        assert!(matches!(model.predict(&[1.0]), Err(ModelError::NotTrained)));
        assert!(matches!(model.train(&[]), Err(ModelError::EmptyTrainingSet)));

        model.train(&around_fifty(50)).unwrap();
        assert!(matches!(
            model.predict(&[1.0, 2.0]),
            Err(ModelError::DimensionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_constant_data_builds_leaves() {
        let mut model = seeded();
        model.train(&vec![vec![5.0]; 40]).unwrap();
        let score = model.predict(&[5.0]).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_save_and_load() {
        let mut model = seeded();
        model.train(&around_fifty(100)).unwrap();
        let bytes = model.save().unwrap();

        let mut restored = IsolationForestModel::new(IsolationForestParams::default(), 0.6);
        restored.load(&bytes).unwrap();
        assert_eq!(restored.tree_count(), 100);
        assert_eq!(model.predict(&[80.0]).unwrap(), restored.predict(&[80.0]).unwrap());
        assert_eq!(restored.metrics(), model.metrics());
    }
}
