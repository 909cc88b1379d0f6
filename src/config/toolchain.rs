use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default = "default_go")]
    pub go: PathBuf,
    /// Extra environment for every `go` invocation, applied last.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            go: default_go(),
            env: BTreeMap::new(),
        }
    }
}

fn default_go() -> PathBuf {
    PathBuf::from("go")
}
