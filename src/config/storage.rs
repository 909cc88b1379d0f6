use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// GOPATH whose module download cache doubles as the proxy cache.
    /// Detected with `go env GOPATH` when unset.
    #[serde(default)]
    pub gopath: Option<PathBuf>,
    /// How long version lists and `@latest` answers stay fresh.
    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,
}

impl StorageConfig {
    pub fn normalize_paths(&mut self, base_dir: &Path) {
        if let Some(gopath) = self.gopath.as_mut()
            && gopath.is_relative()
        {
            *gopath = base_dir.join(&*gopath);
        }
    }

    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    /// The module download cache inside a GOPATH.
    pub fn download_root(gopath: &Path) -> PathBuf {
        gopath.join("pkg").join("mod").join("cache").join("download")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gopath: None,
            list_ttl_secs: default_list_ttl_secs(),
        }
    }
}

fn default_list_ttl_secs() -> u64 {
    300
}
