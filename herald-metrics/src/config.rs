use serde::Deserialize;

/// Where, and whether, to push metrics
///
/// Disabled unless configured; `endpoint` is an OTLP/HTTP metrics URL such as
/// a local collector's `http://localhost:4318/v1/metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::from("http://localhost:4318/v1/metrics"),
        }
    }
}
