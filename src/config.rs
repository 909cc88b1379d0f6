use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use url::Url;

pub mod logging;
pub mod routing;
pub mod server;
pub mod storage;
pub mod toolchain;
pub mod upstream;


pub use logging::LoggingConfig;
pub use routing::RoutingConfig;
pub use server::ServerConfig;
pub use storage::StorageConfig;
pub use toolchain::ToolchainConfig;
pub use upstream::UpstreamConfig;

pub const DEFAULT_CONFIG_FILE: &str = "gorelay.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Command-line values that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `host:port` to listen on.
    pub listen: Option<String>,
    /// GOPATH holding the module download cache.
    pub cache: Option<PathBuf>,
    /// Upstream proxy URL; an empty string disables forwarding.
    pub proxy: Option<String>,
    pub exclude: Option<String>,
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let candidate = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if candidate.exists() {
            let raw = fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read config {}", candidate.display()))?;
            let mut config: Config = toml::from_str(&raw)
                .with_context(|| format!("invalid config {}", candidate.display()))?;
            config
                .storage
                .normalize_paths(candidate.parent().unwrap_or(Path::new(".")));
            Ok(config)
        } else {
            tracing::warn!(
                path = %candidate.display(),
                "configuration file not found, using defaults"
            );
            let mut config = Config::default();
            let cwd = std::env::current_dir().context("reading current directory")?;
            config.storage.normalize_paths(&cwd);
            Ok(config)
        }
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(listen) = overrides.listen {
            let (host, port) = listen
                .rsplit_once(':')
                .with_context(|| format!("listen address {listen:?} must be host:port"))?;
            self.server.port = port
                .parse()
                .with_context(|| format!("invalid port in listen address {listen:?}"))?;
            if !host.is_empty() {
                self.server.host = host.trim_matches(['[', ']']).to_string();
            }
        }
        if let Some(cache) = overrides.cache {
            let cwd = std::env::current_dir().context("reading current directory")?;
            self.storage.gopath = Some(cache);
            self.storage.normalize_paths(&cwd);
        }
        if let Some(proxy) = overrides.proxy {
            let trimmed = proxy.trim();
            if trimmed.is_empty() {
                self.upstream.enabled = false;
            } else {
                self.upstream.url = Url::parse(trimmed)
                    .with_context(|| format!("invalid upstream url {trimmed:?}"))?;
                self.upstream.enabled = true;
            }
        }
        if let Some(exclude) = overrides.exclude {
            self.routing.exclude = exclude;
        }
        Ok(())
    }

    /// The upstream to forward to, or `None` when forwarding is switched off.
    pub fn active_upstream(&self) -> Option<&UpstreamConfig> {
        self.upstream.enabled.then_some(&self.upstream)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(upstream) = self
            .active_upstream()
            .filter(|upstream| upstream.url.scheme() != "https" && upstream.url.scheme() != "http")
        {
            bail!("unsupported upstream scheme {}", upstream.url);
        }
        if self.storage.list_ttl_secs == 0 {
            bail!("storage.list_ttl_secs must be greater than zero");
        }
        if self.server.workers == 0 {
            bail!("server.workers must be greater than zero");
        }
        Ok(())
    }
}
