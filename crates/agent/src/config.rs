//! Agent configuration

use anomaly_lib::DetectorConfig;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "ANOMALY_CONFIG";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// API server port for health/metrics
    pub api_port: u16,

    /// Seconds between health refreshes
    pub health_interval_secs: u64,

    pub detector: DetectorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            health_interval_secs: 10,
            detector: DetectorConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from the optional file in `ANOMALY_CONFIG`, then `ANOMALY__*` variables
    ///
    /// Nested keys use `__`, e.g. `ANOMALY__DETECTOR__THRESHOLDS__ANOMALY_SCORE=80`.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ANOMALY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read agent configuration")?;

        let agent: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        agent.detector.validate()?;
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.detector.models.len(), 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let source = config::Config::builder()
            .add_source(config::File::from_str(
                r#"{"api_port": 9100, "detector": {"thresholds": {"anomaly_score": 85}}}"#,
                config::FileFormat::Json,
            ))
            .build()
            .unwrap();
        let config: AgentConfig = source.try_deserialize().unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.health_interval_secs, 10);
        assert_eq!(config.detector.thresholds.anomaly_score, 85.0);
        assert_eq!(config.detector.thresholds.confidence, 0.6);
    }
}
