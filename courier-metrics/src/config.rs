//! Metrics configuration

use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection
    #[serde(default)]
    pub enabled: bool,

    /// OTLP/HTTP endpoint of the OpenTelemetry Collector.
    ///
    /// Default: `http://localhost:4318/v1/metrics`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: MetricsConfig = ron::from_str("()").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://localhost:4318/v1/metrics");
    }
}
