use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// When false every module is served by the local toolchain.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_upstream_url", with = "serde_url")]
    pub url: Url,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            url: default_upstream_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_upstream_url() -> Url {
    Url::parse("https://goproxy.io/").expect("static upstream url is valid")
}

fn default_timeout_secs() -> u64 {
    60
}

mod serde_url {
    use serde::{Deserialize, Deserializer};
    use url::Url;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Url::parse(&s).map_err(serde::de::Error::custom)
    }
}
