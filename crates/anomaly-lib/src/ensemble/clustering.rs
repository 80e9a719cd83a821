//! k-means++ clustering model
//!
//! Points far from their nearest centroid, relative to that cluster's
//! spread, score high.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{check_dimensions, estimate_metrics, validate_samples, AnomalyModel, ModelMetrics, ModelType};
use crate::error::ModelError;
use crate::persistence;

/// Floor for a cluster's spread so singleton clusters still score
const MIN_SPREAD: f64 = 1e-6;

/// Slope of the logistic mapping from normalized distance to score
const SCORE_STEEPNESS: f64 = 6.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringParams {
    /// Upper bound on clusters; fewer are used for small training sets
    pub k: usize,
    pub max_iterations: usize,
    /// Largest centroid movement still counted as converged
    pub tolerance: f64,
    /// Normalized distance at which the score reaches its midpoint, doubled
    pub anomaly_threshold: f64,
    pub seed: Option<u64>,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            k: 5,
            max_iterations: 100,
            tolerance: 1e-6,
            anomaly_threshold: 2.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterState {
    centroids: Vec<Vec<f64>>,
    /// Mean squared distance of members to their centroid
    variances: Vec<f64>,
    sizes: Vec<usize>,
    iterations: usize,
    converged: bool,
    dimensions: usize,
    metrics: ModelMetrics,
}

#[derive(Debug, Clone)]
pub struct ClusteringModel {
    params: ClusteringParams,
    threshold: f64,
    state: Option<ClusterState>,
    metrics: ModelMetrics,
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(centroids: &[Vec<f64>], point: &[f64]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, point)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// k-means++ seeding; stops early when every remaining point sits on a centroid
fn seed_centroids<R: Rng>(samples: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut centroids = vec![samples[rng.gen_range(0..samples.len())].clone()];

    while centroids.len() < k {
        let weights: Vec<f64> = samples.iter().map(|s| nearest(&centroids, s).1).collect();
        let total: f64 = weights.iter().sum();
        if total <= f64::EPSILON {
            break;
        }

        let mut target = rng.gen::<f64>() * total;
        let mut chosen = samples.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centroids.push(samples[chosen].clone());
    }
    centroids
}

impl ClusteringModel {
    pub fn new(params: ClusteringParams, threshold: f64) -> Self {
        Self {
            params,
            threshold,
            state: None,
            metrics: ModelMetrics::default(),
        }
    }

    pub fn centroids(&self) -> &[Vec<f64>] {
        match &self.state {
            Some(state) => &state.centroids,
            None => &[],
        }
    }

    pub fn converged(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.converged)
    }

    fn fit(&self, samples: &[Vec<f64>], dims: usize) -> ClusterState {
        let mut rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let n = samples.len();
        let by_size = ((n as f64 / 2.0).sqrt().floor() as usize).max(2);
        let k = self.params.k.min(by_size).clamp(1, n);
        let mut centroids = seed_centroids(samples, k, &mut rng);
        let mut assignments = vec![0usize; samples.len()];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.params.max_iterations {
            iterations += 1;
            for (slot, sample) in assignments.iter_mut().zip(samples) {
                *slot = nearest(&centroids, sample).0;
            }

            let mut sums = vec![vec![0.0; dims]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (sample, &c) in samples.iter().zip(&assignments) {
                counts[c] += 1;
                for (acc, v) in sums[c].iter_mut().zip(sample) {
                    *acc += v;
                }
            }

            let mut movement: f64 = 0.0;
            for (c, centroid) in centroids.iter_mut().enumerate() {
                // Empty clusters keep their previous centroid
                if counts[c] == 0 {
                    continue;
                }
                let updated: Vec<f64> = sums[c].iter().map(|s| s / counts[c] as f64).collect();
                movement = movement.max(squared_distance(centroid, &updated).sqrt());
                *centroid = updated;
            }

            if movement <= self.params.tolerance {
                converged = true;
                break;
            }
        }

        for (slot, sample) in assignments.iter_mut().zip(samples) {
            *slot = nearest(&centroids, sample).0;
        }
        let mut variances = vec![0.0; centroids.len()];
        let mut sizes = vec![0usize; centroids.len()];
        for (sample, &c) in samples.iter().zip(&assignments) {
            variances[c] += squared_distance(&centroids[c], sample);
            sizes[c] += 1;
        }
        for (variance, &size) in variances.iter_mut().zip(&sizes) {
            if size > 0 {
                *variance /= size as f64;
            }
        }

        ClusterState {
            centroids,
            variances,
            sizes,
            iterations,
            converged,
            dimensions: dims,
            metrics: ModelMetrics::default(),
        }
    }
}

impl AnomalyModel for ClusteringModel {
    fn model_type(&self) -> ModelType {
        ModelType::Clustering
    }

    fn initialize(&mut self) {
        self.state = None;
        self.metrics = ModelMetrics::default();
    }

    fn train(&mut self, samples: &[Vec<f64>]) -> Result<(), ModelError> {
        let dims = validate_samples(samples)?;
        let state = self.fit(samples, dims);
        tracing::debug!(
            clusters = state.centroids.len(),
            iterations = state.iterations,
            converged = state.converged,
            "k-means fit complete"
        );
        self.state = Some(state);
        self.metrics = estimate_metrics(&*self, samples);
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotTrained)?;
        check_dimensions(state.dimensions, features)?;

        let (cluster, dist_sq) = nearest(&state.centroids, features);
        let spread = state.variances[cluster].sqrt().max(MIN_SPREAD);
        let normalized = dist_sq.sqrt() / spread / self.params.anomaly_threshold;
        Ok(1.0 / (1.0 + (-SCORE_STEEPNESS * (normalized - 0.5)).exp()))
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
        Ok(persistence::encode(ModelType::Clustering.as_str(), &state)?)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let state: ClusterState = persistence::decode(ModelType::Clustering.as_str(), bytes)?;
        self.metrics = state.metrics.clone();
        self.state = Some(state);
        Ok(())
    }
}
