//! Sequence model over a sliding window of recent values
//!
//! Scores how far a value lands from its one-step forecast. Forecasts come
//! from an ONNX graph when one is loaded, otherwise from an exponentially
//! weighted moving average.
//!
//! An ONNX graph must take a `[1, sequence_length]` f32 tensor of
//! standardized values and emit the standardized next value first.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;

use super::{estimate_metrics, validate_samples, AnomalyModel, ModelMetrics, ModelType};
use crate::baseline::{mean, sample_std_dev};
use crate::error::ModelError;
use crate::persistence;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Floor for the residual scale, relative to the series standard deviation
const MIN_RESIDUAL_FRACTION: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceParams {
    pub sequence_length: usize,
    /// EWMA smoothing factor in `(0, 1]`
    pub smoothing: f64,
    /// Residual z-score mapped to a full score
    pub z_score_limit: f64,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            sequence_length: 10,
            smoothing: 0.3,
            z_score_limit: 3.0,
        }
    }
}

struct OnnxForecaster {
    graph: Vec<u8>,
    plan: TractModel,
}

impl OnnxForecaster {
    fn load(graph: &[u8], window: usize) -> Result<Self, ModelError> {
        let plan = Self::build_plan(graph, window)
            .map_err(|e| ModelError::Inference(format!("{:#}", e)))?;
        Ok(Self {
            graph: graph.to_vec(),
            plan,
        })
    }

    fn build_plan(graph: &[u8], window: usize) -> anyhow::Result<TractModel> {
        let plan = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(graph))
            .context("failed to parse ONNX graph")?
            .with_input_fact(0, f32::fact([1, window]).into())
            .context("failed to set input shape")?
            .into_optimized()
            .context("failed to optimize graph")?
            .into_runnable()
            .context("failed to create runnable plan")?;
        Ok(plan)
    }

    fn forecast(&self, window: &[f64], center: f64, scale: f64) -> Result<f64, ModelError> {
        let data: Vec<f32> = window.iter().map(|v| ((v - center) / scale) as f32).collect();
        let input: Tensor = tract_ndarray::Array2::from_shape_vec((1, window.len()), data)
            .map_err(|e| ModelError::Inference(e.to_string()))?
            .into();

        let result = self
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let output = result
            .get(0)
            .ok_or_else(|| ModelError::Inference("graph produced no output".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let next = view
            .iter()
            .next()
            .copied()
            .ok_or_else(|| ModelError::Inference("empty output tensor".to_string()))?;

        Ok(next as f64 * scale + center)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceState {
    /// EWMA level after the last training value
    level: f64,
    mean: f64,
    std_dev: f64,
    /// Scale of one-step forecast errors on the training series
    residual_std: f64,
    /// Tail of the training series, used as context for single values
    recent: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct SavedSequence {
    state: SequenceState,
    graph: Option<Vec<u8>>,
    metrics: ModelMetrics,
}

#[derive(Clone)]
pub struct SequenceModel {
    params: SequenceParams,
    threshold: f64,
    state: Option<SequenceState>,
    forecaster: Option<Arc<OnnxForecaster>>,
    metrics: ModelMetrics,
}

impl fmt::Debug for SequenceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceModel")
            .field("params", &self.params)
            .field("threshold", &self.threshold)
            .field("state", &self.state)
            .field("onnx", &self.forecaster.is_some())
            .finish()
    }
}

fn ewma(values: &[f64], alpha: f64) -> f64 {
    let mut iter = values.iter();
    let Some(&first) = iter.next() else {
        return 0.0;
    };
    iter.fold(first, |level, &v| alpha * v + (1.0 - alpha) * level)
}

impl SequenceModel {
    pub fn new(params: SequenceParams, threshold: f64) -> Self {
        Self {
            params,
            threshold,
            state: None,
            forecaster: None,
            metrics: ModelMetrics::default(),
        }
    }

    /// Install an ONNX forecaster; takes effect for the next training run
    pub fn load_onnx(&mut self, graph: &[u8]) -> Result<(), ModelError> {
        let forecaster = OnnxForecaster::load(graph, self.params.sequence_length)?;
        self.forecaster = Some(Arc::new(forecaster));
        tracing::info!(bytes = graph.len(), "ONNX sequence forecaster loaded");
        Ok(())
    }

    pub fn uses_onnx(&self) -> bool {
        self.forecaster.is_some()
    }

    fn alpha(&self) -> f64 {
        self.params.smoothing.clamp(f64::EPSILON, 1.0)
    }

    fn forecast(&self, state: &SequenceState, context: &[f64]) -> Result<f64, ModelError> {
        let window = if context.is_empty() { &state.recent[..] } else { context };
        let len = self.params.sequence_length;

        if let Some(forecaster) = &self.forecaster {
            if len > 0 && window.len() >= len {
                let scale = state.std_dev.max(f64::EPSILON);
                return forecaster.forecast(&window[window.len() - len..], state.mean, scale);
            }
        }

        Ok(if context.is_empty() {
            state.level
        } else {
            ewma(context, self.alpha())
        })
    }

    fn one_step_residuals(&self, state: &SequenceState, series: &[f64]) -> Result<Vec<f64>, ModelError> {
        let len = self.params.sequence_length;
        if self.forecaster.is_some() && len > 0 && series.len() > len {
            return (len..series.len())
                .map(|i| Ok(series[i] - self.forecast(state, &series[i - len..i])?))
                .collect();
        }

        let alpha = self.alpha();
        let mut level = series.first().copied().unwrap_or(0.0);
        Ok(series
            .iter()
            .skip(1)
            .map(|&v| {
                let residual = v - level;
                level = alpha * v + (1.0 - alpha) * level;
                residual
            })
            .collect())
    }
}

impl AnomalyModel for SequenceModel {
    fn model_type(&self) -> ModelType {
        ModelType::Sequence
    }

    /// Forget training state; a loaded ONNX graph stays installed
    fn initialize(&mut self) {
        self.state = None;
        self.metrics = ModelMetrics::default();
    }

    /// Trains on the first feature of each sample, in order
    fn train(&mut self, samples: &[Vec<f64>]) -> Result<(), ModelError> {
        validate_samples(samples)?;
        let series: Vec<f64> = samples.iter().map(|s| s[0]).collect();

        let m = mean(&series);
        let std_dev = sample_std_dev(&series, m);
        let tail_start = series.len().saturating_sub(self.params.sequence_length);
        let mut state = SequenceState {
            level: ewma(&series, self.alpha()),
            mean: m,
            std_dev,
            residual_std: 0.0,
            recent: series[tail_start..].to_vec(),
        };

        let residuals = self.one_step_residuals(&state, &series)?;
        let rmse = if residuals.is_empty() {
            0.0
        } else {
            (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt()
        };
        state.residual_std = rmse.max(std_dev * MIN_RESIDUAL_FRACTION).max(1e-6);

        self.state = Some(state);
        self.metrics = estimate_metrics(&*self, samples);
        Ok(())
    }

    /// The last feature is the value under test; earlier features are its context
    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotTrained)?;
        let (&target, context) = features.split_last().ok_or(ModelError::DimensionMismatch {
            expected: 1,
            actual: 0,
        })?;

        let expected = self.forecast(state, context)?;
        let z = (target - expected).abs() / state.residual_std;
        Ok((z / self.params.z_score_limit).min(1.0))
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
        let state = self.state.clone().ok_or(ModelError::NotTrained)?;
        let saved = SavedSequence {
            state,
            graph: self.forecaster.as_ref().map(|f| f.graph.clone()),
            metrics: self.metrics.clone(),
        };
        Ok(persistence::encode(ModelType::Sequence.as_str(), &saved)?)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let saved: SavedSequence = persistence::decode(ModelType::Sequence.as_str(), bytes)?;
        self.forecaster = match saved.graph {
            Some(graph) => Some(Arc::new(OnnxForecaster::load(&graph, self.params.sequence_length)?)),
            None => None,
        };
        self.metrics = saved.metrics;
        self.state = Some(saved.state);
        Ok(())
    }
}
