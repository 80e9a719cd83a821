//! Anomaly detection engine for monitoring data
//!
//! This crate provides the core functionality for:
//! - Per-series statistical baselines
//! - An ensemble of unsupervised models (isolation forest, clustering,
//!   statistical, optional sequence forecaster)
//! - Ensemble scoring, feedback-driven threshold tuning and batch detection
//! - Human-readable explanations for detected anomalies
//! - Health checks and observability

pub mod baseline;
pub mod detector;
pub mod ensemble;
pub mod error;
pub mod explainer;
pub mod health;
pub mod models;
pub mod observability;
pub mod persistence;

pub use baseline::{BaselineConfig, BaselineData, BaselineManager};
pub use detector::{
    AnomalyDetector, DetectorConfig, DetectorEvent, DetectorState, ProcessingQueue, QueueHandle,
};
pub use error::{DetectorError, ModelError, PersistenceError};
pub use explainer::AnomalyExplainer;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{DetectorMetrics, StructuredLogger};
