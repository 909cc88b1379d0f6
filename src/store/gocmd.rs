//! A [`ModuleStore`] backed by the `go` command.
//!
//! Versions are listed with `go list -m -versions` and artifacts are
//! fetched with `go mod download`, which leaves them in the GOPATH module
//! cache. That cache is the same directory tree the proxy serves from, so
//! direct answers and forwarded answers share one layout on disk.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result, bail};
use gorelay_adapter::{FilesystemStorage, escape_path};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ModuleStore, StoreError};
use crate::config::ToolchainConfig;
use crate::exclude::ExclusionSet;
use crate::proxy::Freshness;

const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "unknown revision",
    "no matching versions",
    "invalid version",
    "does not exist",
    "disabled by goprivate",
];

/// Everything a `go` child process needs, stated explicitly instead of
/// inherited from (or written into) the proxy's own environment.
#[derive(Debug, Clone)]
pub struct GoToolchain {
    pub go: PathBuf,
    pub gopath: PathBuf,
    /// Value for `GOPRIVATE`; usually the proxy's exclusion list.
    pub private: Option<String>,
    pub extra_env: BTreeMap<String, String>,
    /// The proxy was started with `GIT_SSH` or `GIT_SSH_COMMAND` set; the
    /// child inherits it and no ssh command is forced.
    pub inherited_git_ssh: bool,
}

impl GoToolchain {
    pub fn from_config(
        config: &ToolchainConfig,
        gopath: PathBuf,
        exclude: &ExclusionSet,
    ) -> Self {
        Self {
            go: config.go.clone(),
            gopath,
            private: (!exclude.is_empty()).then(|| exclude.as_str().to_string()),
            extra_env: config.env.clone(),
            inherited_git_ssh: git_ssh_configured(|key| std::env::var_os(key).is_some()),
        }
    }

    /// Environment applied to every invocation. Operator-supplied values win.
    pub fn command_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "GOPATH".to_string(),
            self.gopath.to_string_lossy().into_owned(),
        );
        env.insert("GO111MODULE".to_string(), "on".to_string());
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        let ssh_configured = self.inherited_git_ssh
            || git_ssh_configured(|key| self.extra_env.contains_key(key));
        if !ssh_configured {
            env.insert(
                "GIT_SSH_COMMAND".to_string(),
                "ssh -o ControlMaster=no".to_string(),
            );
        }
        if let Some(private) = &self.private {
            env.insert("GOPRIVATE".to_string(), private.clone());
        }
        env.extend(self.extra_env.clone());
        env
    }
}

fn git_ssh_configured(is_set: impl Fn(&str) -> bool) -> bool {
    is_set("GIT_SSH") || is_set("GIT_SSH_COMMAND")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoModuleList {
    path: String,
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoDownload {
    #[serde(default)]
    info: String,
    #[serde(default)]
    go_mod: String,
    #[serde(default)]
    zip: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoFailure {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoEnv {
    #[serde(rename = "GOPATH", default)]
    gopath: String,
}

#[derive(Clone)]
pub struct GoCommandStore {
    toolchain: GoToolchain,
    env: BTreeMap<String, String>,
    storage: FilesystemStorage,
    list_ttl: Duration,
}

impl GoCommandStore {
    /// `storage` must be rooted at the module download cache of
    /// `toolchain.gopath`; version lists are written there.
    pub fn new(toolchain: GoToolchain, storage: FilesystemStorage, list_ttl: Duration) -> Self {
        let env = toolchain.command_env();
        Self {
            toolchain,
            env,
            storage,
            list_ttl,
        }
    }

    pub fn toolchain(&self) -> &GoToolchain {
        &self.toolchain
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, StoreError> {
        let command = format!("go {}", args.join(" "));
        debug!(%command, "running go command");

        let output = Command::new(&self.toolchain.go)
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StoreError::Io {
                context: format!("spawning {}", self.toolchain.go.display()),
                source,
            })?;

        if !output.status.success() {
            // `go mod download -json` reports its failure inside the JSON.
            let message = serde_json::from_slice::<GoFailure>(&output.stdout)
                .ok()
                .and_then(|failure| failure.error)
                .unwrap_or_else(|| {
                    format!(
                        "{}{}",
                        String::from_utf8_lossy(&output.stderr),
                        String::from_utf8_lossy(&output.stdout)
                    )
                });
            return Err(classify_failure(command, message));
        }

        serde_json::from_slice(&output.stdout).map_err(|err| StoreError::Command {
            command,
            message: format!("reading json: {err}"),
        })
    }

    async fn download(&self, module: &str, version: &str) -> Result<GoDownload, StoreError> {
        let target = format!("{module}@{version}");
        let download: GoDownload = self
            .run_json(&["mod", "download", "-json", &target])
            .await?;
        if let Some(error) = download.error.filter(|error| !error.is_empty()) {
            return Err(classify_failure(
                format!("go mod download -json {target}"),
                error,
            ));
        }
        Ok(download)
    }

    async fn read_artifact(file: &str, what: &str, target: &str) -> Result<Vec<u8>, StoreError> {
        if file.is_empty() {
            return Err(StoreError::Command {
                command: format!("go mod download -json {target}"),
                message: format!("no {what} file reported"),
            });
        }
        tokio::fs::read(file).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("{target}: {what} file {file} is missing"))
            } else {
                StoreError::Io {
                    context: format!("reading {file}"),
                    source,
                }
            }
        })
    }

    async fn fresh_list(&self, key: &str) -> Option<Vec<u8>> {
        let modified = match self.storage.stat(key).await {
            Ok(Some(modified)) => modified,
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, key, "version list stat failed");
                return None;
            }
        };
        if !Freshness::Mutable.is_fresh(modified, SystemTime::now(), self.list_ttl) {
            return None;
        }
        self.storage.read(key).await.ok().flatten()
    }
}

impl ModuleStore for GoCommandStore {
    async fn list_versions(&self, module: &str) -> Result<Vec<u8>, StoreError> {
        let escaped =
            escape_path(module).map_err(|err| StoreError::NotFound(err.to_string()))?;
        let key = format!("{escaped}/@v/list");

        if let Some(data) = self.fresh_list(&key).await {
            return Ok(data);
        }

        let target = format!("{module}@latest");
        let list: GoModuleList = self
            .run_json(&["list", "-m", "-json", "-versions", &target])
            .await?;
        if list.path != module {
            return Err(StoreError::Command {
                command: format!("go list -m -json -versions {target}"),
                message: format!("asked for {module} but got {}", list.path),
            });
        }

        let data = render_version_list(&list.versions);
        if let Err(err) = self.storage.put(&key, &data).await {
            warn!(error = %err, module, "failed to cache version list");
        }
        Ok(data)
    }

    async fn latest(&self, module: &str) -> Result<Vec<u8>, StoreError> {
        let download = self.download(module, "latest").await?;
        Self::read_artifact(&download.info, "info", &format!("{module}@latest")).await
    }

    async fn info(&self, module: &str, version: &str) -> Result<Vec<u8>, StoreError> {
        let download = self.download(module, version).await?;
        Self::read_artifact(&download.info, "info", &format!("{module}@{version}")).await
    }

    async fn manifest(&self, module: &str, version: &str) -> Result<Vec<u8>, StoreError> {
        let download = self.download(module, version).await?;
        Self::read_artifact(&download.go_mod, "go.mod", &format!("{module}@{version}")).await
    }

    async fn archive(&self, module: &str, version: &str) -> Result<Vec<u8>, StoreError> {
        let download = self.download(module, version).await?;
        Self::read_artifact(&download.zip, "zip", &format!("{module}@{version}")).await
    }
}

/// One version per line with a trailing newline; no versions is empty.
fn render_version_list(versions: &[String]) -> Vec<u8> {
    if versions.is_empty() {
        return Vec::new();
    }
    let mut data = versions.join("\n");
    data.push('\n');
    data.into_bytes()
}

fn classify_failure(command: String, message: String) -> StoreError {
    let message = message.trim().to_string();
    let lowered = message.to_lowercase();
    if NOT_FOUND_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        StoreError::NotFound(message)
    } else {
        StoreError::Command { command, message }
    }
}

/// Asks the toolchain for its GOPATH and returns the first entry.
pub async fn detect_gopath(go: &Path) -> Result<PathBuf> {
    let output = Command::new(go)
        .args(["env", "-json", "GOPATH"])
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("running {} env -json GOPATH", go.display()))?;
    if !output.status.success() {
        bail!(
            "{} env -json GOPATH failed:\n{}",
            go.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let env: GoEnv =
        serde_json::from_slice(&output.stdout).context("reading go env json output")?;
    std::env::split_paths(&env.gopath)
        .find(|path| !path.as_os_str().is_empty())
        .context("missing $GOPATH")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain(go: PathBuf, gopath: PathBuf) -> GoToolchain {
        GoToolchain {
            go,
            gopath,
            private: None,
            extra_env: BTreeMap::new(),
            inherited_git_ssh: false,
        }
    }

    #[test]
    fn command_env_sets_defaults() {
        let tc = toolchain(PathBuf::from("go"), PathBuf::from("/srv/gopath"));
        let env = tc.command_env();
        assert_eq!(env["GOPATH"], "/srv/gopath");
        assert_eq!(env["GO111MODULE"], "on");
        assert_eq!(env["GIT_TERMINAL_PROMPT"], "0");
        assert_eq!(env["GIT_SSH_COMMAND"], "ssh -o ControlMaster=no");
        assert!(!env.contains_key("GOPRIVATE"));
    }

    #[test]
    fn command_env_uses_exclusions_as_goprivate() {
        let config = ToolchainConfig::default();
        let exclude = ExclusionSet::parse("corp.local/*,github.com/acme/*");
        let tc = GoToolchain::from_config(&config, PathBuf::from("/g"), &exclude);
        assert_eq!(
            tc.command_env()["GOPRIVATE"],
            "corp.local/*,github.com/acme/*"
        );

        let empty = ExclusionSet::default();
        let tc = GoToolchain::from_config(&config, PathBuf::from("/g"), &empty);
        assert!(tc.private.is_none());
    }

    #[test]
    fn command_env_operator_values_win() {
        let mut tc = toolchain(PathBuf::from("go"), PathBuf::from("/g"));
        tc.extra_env
            .insert("GIT_TERMINAL_PROMPT".to_string(), "1".to_string());
        tc.extra_env
            .insert("GIT_SSH_COMMAND".to_string(), "ssh -i key".to_string());
        let env = tc.command_env();
        assert_eq!(env["GIT_TERMINAL_PROMPT"], "1");
        assert_eq!(env["GIT_SSH_COMMAND"], "ssh -i key");
    }

    #[test]
    fn command_env_respects_git_ssh() {
        let mut tc = toolchain(PathBuf::from("go"), PathBuf::from("/g"));
        tc.extra_env
            .insert("GIT_SSH".to_string(), "/usr/bin/plink".to_string());
        let env = tc.command_env();
        assert!(!env.contains_key("GIT_SSH_COMMAND"));
        assert_eq!(env["GIT_SSH"], "/usr/bin/plink");
    }

    #[test]
    fn command_env_keeps_inherited_ssh_settings() {
        let mut tc = toolchain(PathBuf::from("go"), PathBuf::from("/g"));
        tc.inherited_git_ssh = true;
        let env = tc.command_env();
        assert!(!env.contains_key("GIT_SSH_COMMAND"));
        assert!(!env.contains_key("GIT_SSH"));
    }

    #[test]
    fn git_ssh_detection_checks_both_variables() {
        assert!(git_ssh_configured(|key| key == "GIT_SSH"));
        assert!(git_ssh_configured(|key| key == "GIT_SSH_COMMAND"));
        assert!(!git_ssh_configured(|key| key == "GIT_ASKPASS"));
    }

    #[test]
    fn version_list_rendering() {
        assert_eq!(
            render_version_list(&["v1.0.0".to_string(), "v1.1.0".to_string()]),
            b"v1.0.0\nv1.1.0\n"
        );
        assert!(render_version_list(&[]).is_empty());
    }

    #[test]
    fn failures_are_classified() {
        let err = classify_failure(
            "go mod download".to_string(),
            "example.com/x@v9.9.9: invalid version: unknown revision v9.9.9\n".to_string(),
        );
        assert!(matches!(err, StoreError::NotFound(ref m) if m.ends_with("v9.9.9")));

        let err = classify_failure(
            "go mod download".to_string(),
            "dial tcp: i/o timeout".to_string(),
        );
        assert!(matches!(err, StoreError::Command { .. }));
    }

    #[cfg(unix)]
    mod with_fake_go {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        struct Fixture {
            _dir: tempfile::TempDir,
            store: GoCommandStore,
            log: PathBuf,
            artifacts: PathBuf,
        }

        /// Writes a stand-in `go` that answers from files in the fixture.
        fn fixture() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("invocations.log");
            let artifacts = dir.path().join("artifacts");
            std::fs::create_dir_all(&artifacts).unwrap();
            std::fs::write(artifacts.join("v1.0.0.info"), br#"{"Version":"v1.0.0"}"#).unwrap();
            std::fs::write(artifacts.join("v1.0.0.mod"), b"module example.com/mod\n").unwrap();
            std::fs::write(artifacts.join("v1.0.0.zip"), b"PK\x03\x04zip").unwrap();

            let script = format!(
                r#"#!/bin/sh
echo "$@" >> "{log}"
case "$1 $2" in
  "list -m")
    case "$5" in
      example.com/mod@latest) echo '{{"Path":"example.com/mod","Versions":["v1.0.0","v1.1.0"]}}' ;;
      example.com/empty@latest) echo '{{"Path":"example.com/empty"}}' ;;
      *) echo "go: module $5: not found" >&2; exit 1 ;;
    esac ;;
  "mod download")
    case "$4" in
      example.com/mod@v1.0.0|example.com/mod@latest)
        echo '{{"Path":"example.com/mod","Version":"v1.0.0","Info":"{a}/v1.0.0.info","GoMod":"{a}/v1.0.0.mod","Zip":"{a}/v1.0.0.zip"}}' ;;
      example.com/mod@v1.2.0)
        echo '{{"Path":"example.com/mod","Version":"v1.2.0","Info":"{a}/gone.info"}}' ;;
      *)
        echo '{{"Path":"x","Error":"'"$4"': invalid version: unknown revision"}}'
        exit 1 ;;
    esac ;;
  *) echo "unexpected: $@" >&2; exit 2 ;;
esac
"#,
                log = log.display(),
                a = artifacts.display(),
            );
            let go = dir.path().join("go");
            std::fs::write(&go, script).unwrap();
            std::fs::set_permissions(&go, std::fs::Permissions::from_mode(0o755)).unwrap();

            let gopath = dir.path().join("gopath");
            let storage = FilesystemStorage::new(crate::config::StorageConfig::download_root(&gopath));
            let store = GoCommandStore::new(
                toolchain(go, gopath),
                storage,
                Duration::from_secs(300),
            );
            Fixture {
                _dir: dir,
                store,
                log,
                artifacts,
            }
        }

        fn invocations(fx: &Fixture) -> usize {
            std::fs::read_to_string(&fx.log)
                .map(|log| log.lines().count())
                .unwrap_or(0)
        }

        #[tokio::test]
        async fn list_versions_runs_go_list_and_caches() {
            let fx = fixture();

            let first = fx.store.list_versions("example.com/mod").await.unwrap();
            assert_eq!(first, b"v1.0.0\nv1.1.0\n");
            assert_eq!(invocations(&fx), 1);

            let second = fx.store.list_versions("example.com/mod").await.unwrap();
            assert_eq!(second, first);
            assert_eq!(invocations(&fx), 1, "fresh list must come from disk");

            let cached = fx
                .store
                .storage
                .read("example.com/mod/@v/list")
                .await
                .unwrap();
            assert_eq!(cached.as_deref(), Some(&b"v1.0.0\nv1.1.0\n"[..]));
        }

        #[tokio::test]
        async fn list_versions_refreshes_stale_list() {
            let fx = fixture();
            fx.store.list_versions("example.com/mod").await.unwrap();

            let path = fx.store.storage.resolve("example.com/mod/@v/list");
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(600))
                .unwrap();

            fx.store.list_versions("example.com/mod").await.unwrap();
            assert_eq!(invocations(&fx), 2);
        }

        #[tokio::test]
        async fn list_versions_without_versions_is_empty() {
            let fx = fixture();
            let data = fx.store.list_versions("example.com/empty").await.unwrap();
            assert!(data.is_empty());
        }

        #[tokio::test]
        async fn list_versions_unknown_module_is_not_found() {
            let fx = fixture();
            let err = fx.store.list_versions("example.com/nope").await.unwrap_err();
            assert!(matches!(err, StoreError::NotFound(_)), "{err}");
        }

        #[tokio::test]
        async fn artifacts_are_read_from_download_output() {
            let fx = fixture();
            assert_eq!(
                fx.store.info("example.com/mod", "v1.0.0").await.unwrap(),
                br#"{"Version":"v1.0.0"}"#
            );
            assert_eq!(
                fx.store.manifest("example.com/mod", "v1.0.0").await.unwrap(),
                b"module example.com/mod\n"
            );
            assert_eq!(
                fx.store.archive("example.com/mod", "v1.0.0").await.unwrap(),
                b"PK\x03\x04zip"
            );
            assert_eq!(
                fx.store.latest("example.com/mod").await.unwrap(),
                std::fs::read(fx.artifacts.join("v1.0.0.info")).unwrap()
            );
        }

        #[tokio::test]
        async fn download_error_is_not_found() {
            let fx = fixture();
            let err = fx
                .store
                .info("example.com/mod", "v9.9.9")
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::NotFound(_)), "{err}");
        }

        #[tokio::test]
        async fn missing_artifact_file_is_not_found() {
            let fx = fixture();
            let err = fx
                .store
                .info("example.com/mod", "v1.2.0")
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::NotFound(_)), "{err}");

            let err = fx
                .store
                .archive("example.com/mod", "v1.2.0")
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::Command { .. }), "{err}");
        }

        #[tokio::test]
        async fn missing_binary_is_io_error() {
            let fx = fixture();
            let mut tc = fx.store.toolchain().clone();
            tc.go = PathBuf::from("/nonexistent/bin/go");
            let store = GoCommandStore::new(tc, fx.store.storage.clone(), Duration::from_secs(1));
            let err = store.info("example.com/mod", "v1.0.0").await.unwrap_err();
            assert!(matches!(err, StoreError::Io { .. }), "{err}");
        }
    }
}
