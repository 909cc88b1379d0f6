use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    /// Comma-separated module path globs that are always served direct.
    #[serde(default)]
    pub exclude: String,
}
