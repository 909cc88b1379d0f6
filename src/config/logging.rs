use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// OTLP/HTTP collector endpoint. Falls back to `OTEL_EXPORTER_OTLP_ENDPOINT`.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    pub fn otlp_endpoint(&self) -> Option<String> {
        self.otlp_endpoint
            .clone()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LoggingConfig::default_level(),
            json: false,
            otlp_endpoint: None,
        }
    }
}
