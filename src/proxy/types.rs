use std::time::{Duration, Instant, SystemTime};

use gorelay_adapter::{unescape_path, unescape_version};
use percent_encoding::percent_decode_str;
use rama::http::{Body, Method, Request};
use thiserror::Error;

pub const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
pub const APPLICATION_JSON: &str = "application/json";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const APPLICATION_ZIP: &str = "application/zip";

/// Cache status for request tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Direct,
    Hit,
    Miss,
    Stale,
    Rejected,
    Error,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Direct => write!(f, "direct"),
            CacheStatus::Hit => write!(f, "hit"),
            CacheStatus::Miss => write!(f, "miss"),
            CacheStatus::Stale => write!(f, "stale"),
            CacheStatus::Rejected => write!(f, "rejected"),
            CacheStatus::Error => write!(f, "error"),
        }
    }
}

/// Request context for tracking request lifecycle
pub struct RequestContext {
    pub start: Instant,
    pub method: Method,
    pub path: String,
    pub cache: CacheStatus,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            method: Method::GET,
            path: String::new(),
            cache: CacheStatus::Rejected,
        }
    }
}

impl RequestContext {
    pub fn from_request(req: &Request<Body>) -> Self {
        Self {
            start: Instant::now(),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            cache: CacheStatus::Rejected,
        }
    }

    pub fn summary(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Version lists and `@latest`; subject to the list TTL.
    Mutable,
    /// Per-version artifacts; never change once published.
    Immutable,
}

impl Freshness {
    /// An entry modified in the future counts as fresh.
    pub fn is_fresh(self, modified: SystemTime, now: SystemTime, ttl: Duration) -> bool {
        match self {
            Freshness::Immutable => true,
            Freshness::Mutable => match now.duration_since(modified) {
                Ok(age) => age < ttl,
                Err(_) => true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    List,
    Latest,
    Info(String),
    Mod(String),
    Zip(String),
}

impl Operation {
    pub fn freshness(&self) -> Freshness {
        match self {
            Operation::List | Operation::Latest => Freshness::Mutable,
            Operation::Info(_) | Operation::Mod(_) | Operation::Zip(_) => Freshness::Immutable,
        }
    }

    /// Content type for bytes served out of the cache.
    pub fn cached_content_type(&self) -> &'static str {
        match self {
            Operation::List | Operation::Latest | Operation::Mod(_) => TEXT_PLAIN,
            Operation::Info(_) => APPLICATION_JSON,
            Operation::Zip(_) => OCTET_STREAM,
        }
    }

    /// Content type for bytes produced by the module store.
    pub fn direct_content_type(&self) -> &'static str {
        match self {
            Operation::List | Operation::Mod(_) => TEXT_PLAIN,
            Operation::Latest | Operation::Info(_) => APPLICATION_JSON,
            Operation::Zip(_) => APPLICATION_ZIP,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Operation::Info(v) | Operation::Mod(v) | Operation::Zip(v) => Some(v),
            Operation::List | Operation::Latest => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Latest => "latest",
            Operation::Info(_) => "info",
            Operation::Mod(_) => "mod",
            Operation::Zip(_) => "zip",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("unrecognized module proxy path: {0}")]
    Unknown(String),
    #[error("invalid module proxy path {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// A classified module proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    /// Unescaped module path, e.g. `github.com/Azure/go-autorest`.
    pub module: String,
    pub operation: Operation,
    /// Escaped request path without the leading slash; doubles as the cache key.
    pub key: String,
}

impl ModuleRequest {
    pub fn from_path(raw: &str) -> Result<Self, PathError> {
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|err| invalid(raw, err.to_string()))?;
        let key = decoded.strip_prefix('/').unwrap_or(&decoded);

        let (scope, operation) = if let Some(scope) = key.strip_suffix("/@latest") {
            (scope, Operation::Latest)
        } else if let Some((scope, rest)) = key.split_once("/@v/") {
            (scope, classify_version_file(key, rest)?)
        } else {
            return Err(PathError::Unknown(key.to_string()));
        };

        validate_scope(key, scope)?;
        let module = unescape_path(scope).map_err(|err| invalid(key, err.to_string()))?;
        let operation = match operation {
            Operation::Info(v) => Operation::Info(real_version(key, &v)?),
            Operation::Mod(v) => Operation::Mod(real_version(key, &v)?),
            Operation::Zip(v) => Operation::Zip(real_version(key, &v)?),
            other => other,
        };

        Ok(Self {
            module,
            operation,
            key: key.to_string(),
        })
    }
}

fn classify_version_file(key: &str, rest: &str) -> Result<Operation, PathError> {
    if rest == "list" {
        return Ok(Operation::List);
    }
    let (version, ext) = rest
        .rsplit_once('.')
        .ok_or_else(|| PathError::Unknown(key.to_string()))?;
    if version.is_empty() || version.contains('/') {
        return Err(PathError::Unknown(key.to_string()));
    }
    let version = version.to_string();
    match ext {
        "info" => Ok(Operation::Info(version)),
        "mod" => Ok(Operation::Mod(version)),
        "zip" => Ok(Operation::Zip(version)),
        _ => Err(PathError::Unknown(key.to_string())),
    }
}

fn validate_scope(key: &str, scope: &str) -> Result<(), PathError> {
    if scope.is_empty() {
        return Err(invalid(key, "empty module path"));
    }
    if scope.contains(['\\', '\0']) {
        return Err(invalid(key, "module path contains a forbidden character"));
    }
    if scope
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid(key, "module path has an empty or relative element"));
    }
    Ok(())
}

fn real_version(key: &str, escaped: &str) -> Result<String, PathError> {
    if escaped == "." || escaped == ".." || escaped.contains(['\\', '\0']) {
        return Err(invalid(key, "malformed version"));
    }
    unescape_version(escaped).map_err(|err| invalid(key, err.to_string()))
}

fn invalid(path: &str, reason: impl Into<String>) -> PathError {
    PathError::Invalid {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// How a classified request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    CachedFresh { modified: SystemTime },
    Forward { stale: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_list() {
        let req = ModuleRequest::from_path("/example.com/mod/@v/list").unwrap();
        assert_eq!(req.module, "example.com/mod");
        assert_eq!(req.operation, Operation::List);
        assert_eq!(req.key, "example.com/mod/@v/list");
    }

    #[test]
    fn classifies_latest() {
        let req = ModuleRequest::from_path("/example.com/mod/@latest").unwrap();
        assert_eq!(req.operation, Operation::Latest);
        assert_eq!(req.operation.freshness(), Freshness::Mutable);
    }

    #[test]
    fn classifies_versioned_files() {
        let info = ModuleRequest::from_path("/example.com/mod/@v/v1.0.0.info").unwrap();
        assert_eq!(info.operation, Operation::Info("v1.0.0".to_string()));
        let module = ModuleRequest::from_path("/example.com/mod/@v/v1.0.0.mod").unwrap();
        assert_eq!(module.operation, Operation::Mod("v1.0.0".to_string()));
        let zip = ModuleRequest::from_path("/example.com/mod/@v/v1.0.0.zip").unwrap();
        assert_eq!(zip.operation, Operation::Zip("v1.0.0".to_string()));
        assert_eq!(zip.operation.freshness(), Freshness::Immutable);
        assert_eq!(zip.key, "example.com/mod/@v/v1.0.0.zip");
    }

    #[test]
    fn keeps_dots_inside_versions() {
        let req =
            ModuleRequest::from_path("/example.com/mod/@v/v0.0.0-20190101.abcdef.info").unwrap();
        assert_eq!(req.operation.version(), Some("v0.0.0-20190101.abcdef"));
    }

    #[test]
    fn unescapes_module_and_version() {
        let req = ModuleRequest::from_path("/github.com/!azure/go-autorest/@v/v1.0.0-!r!c1.mod")
            .unwrap();
        assert_eq!(req.module, "github.com/Azure/go-autorest");
        assert_eq!(req.operation, Operation::Mod("v1.0.0-RC1".to_string()));
        assert_eq!(req.key, "github.com/!azure/go-autorest/@v/v1.0.0-!r!c1.mod");
    }

    #[test]
    fn percent_decodes_before_classifying() {
        let req = ModuleRequest::from_path("/example.com/mod/%40v/list").unwrap();
        assert_eq!(req.operation, Operation::List);
        assert_eq!(req.key, "example.com/mod/@v/list");
    }

    #[test]
    fn unknown_suffix_is_rejected() {
        assert!(matches!(
            ModuleRequest::from_path("/example.com/mod/@v/v1.0.0.exe"),
            Err(PathError::Unknown(_))
        ));
        assert!(matches!(
            ModuleRequest::from_path("/example.com/mod/@v/"),
            Err(PathError::Unknown(_))
        ));
        assert!(matches!(
            ModuleRequest::from_path("/example.com/mod/@v/.zip"),
            Err(PathError::Unknown(_))
        ));
        assert!(matches!(
            ModuleRequest::from_path("/example.com/mod"),
            Err(PathError::Unknown(_))
        ));
        assert!(matches!(
            ModuleRequest::from_path("/"),
            Err(PathError::Unknown(_))
        ));
        assert!(matches!(
            ModuleRequest::from_path("/@latest"),
            Err(PathError::Unknown(_))
        ));
    }

    #[test]
    fn nested_version_is_rejected() {
        assert!(ModuleRequest::from_path("/example.com/mod/@v/sub/v1.0.0.zip").is_err());
    }

    #[test]
    fn traversal_is_invalid() {
        for path in [
            "/../etc/@v/list",
            "/example.com/../../@v/list",
            "/example.com//mod/@latest",
            "/./mod/@latest",
            "/example.com/mod/@v/...info",
        ] {
            assert!(
                matches!(
                    ModuleRequest::from_path(path),
                    Err(PathError::Invalid { .. })
                ),
                "{path} should be invalid"
            );
        }
    }

    #[test]
    fn bad_escapes_are_invalid() {
        assert!(matches!(
            ModuleRequest::from_path("/github.com/Azure/x/@v/list"),
            Err(PathError::Invalid { .. })
        ));
        assert!(matches!(
            ModuleRequest::from_path("/github.com/!/x/@v/list"),
            Err(PathError::Invalid { .. })
        ));
        assert!(matches!(
            ModuleRequest::from_path("/example.com/mod/@v/V1.info"),
            Err(PathError::Invalid { .. })
        ));
    }

    #[test]
    fn content_types() {
        assert_eq!(Operation::List.cached_content_type(), TEXT_PLAIN);
        assert_eq!(Operation::Latest.cached_content_type(), TEXT_PLAIN);
        assert_eq!(Operation::Latest.direct_content_type(), APPLICATION_JSON);
        assert_eq!(
            Operation::Info("v1".into()).cached_content_type(),
            APPLICATION_JSON
        );
        assert_eq!(Operation::Mod("v1".into()).direct_content_type(), TEXT_PLAIN);
        assert_eq!(Operation::Zip("v1".into()).cached_content_type(), OCTET_STREAM);
        assert_eq!(Operation::Zip("v1".into()).direct_content_type(), APPLICATION_ZIP);
    }

    #[test]
    fn mutable_freshness_follows_ttl() {
        let ttl = Duration::from_secs(300);
        let now = SystemTime::now();
        let fresh = now - Duration::from_secs(299);
        let stale = now - Duration::from_secs(301);
        assert!(Freshness::Mutable.is_fresh(fresh, now, ttl));
        assert!(!Freshness::Mutable.is_fresh(stale, now, ttl));
        assert!(!Freshness::Mutable.is_fresh(now - ttl, now, ttl));
    }

    #[test]
    fn future_mtime_is_fresh() {
        let now = SystemTime::now();
        assert!(Freshness::Mutable.is_fresh(
            now + Duration::from_secs(60),
            now,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn immutable_is_always_fresh() {
        let now = SystemTime::now();
        assert!(Freshness::Immutable.is_fresh(
            SystemTime::UNIX_EPOCH,
            now,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn cache_status_display() {
        assert_eq!(CacheStatus::Direct.to_string(), "direct");
        assert_eq!(CacheStatus::Hit.to_string(), "hit");
        assert_eq!(CacheStatus::Miss.to_string(), "miss");
        assert_eq!(CacheStatus::Stale.to_string(), "stale");
        assert_eq!(CacheStatus::Rejected.to_string(), "rejected");
        assert_eq!(CacheStatus::Error.to_string(), "error");
    }
}
