use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gorelay_adapter::FilesystemStorage;
use rama::http::{Body, HeaderMap, HeaderValue, Response, StatusCode, header};

use super::{
    response,
    types::{Freshness, ModuleRequest, Route},
};

/// Route for a forwardable request given what `stat` saw on disk.
pub fn cache_route(
    modified: Option<SystemTime>,
    freshness: Freshness,
    now: SystemTime,
    ttl: Duration,
) -> Route {
    match modified {
        None => Route::Forward { stale: false },
        Some(modified) if freshness.is_fresh(modified, now, ttl) => {
            Route::CachedFresh { modified }
        }
        Some(_) => Route::Forward { stale: true },
    }
}

/// Serves a cache entry. Returns `None` when the entry disappeared after
/// the route was decided, so the caller can fall back to forwarding.
pub async fn serve_cached(
    storage: &FilesystemStorage,
    request: &ModuleRequest,
    modified: SystemTime,
    request_headers: &HeaderMap,
    head_only: bool,
) -> Result<Option<Response<Body>>> {
    let Some(mut handle) = storage.open_read(&request.key).await? else {
        return Ok(None);
    };
    let modified = handle.modified.unwrap_or(modified);
    let last_modified = http_date(modified);

    if not_modified_since(request_headers, modified) {
        let resp = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::LAST_MODIFIED, HeaderValue::from_str(&last_modified)?)
            .body(Body::empty())
            .context("building not-modified response")?;
        return Ok(Some(resp));
    }

    let size = handle.size;
    let data = if head_only {
        Bytes::new()
    } else {
        Bytes::from(handle.read_all().await?)
    };
    drop(handle);

    let mut resp = response::respond_bytes(
        request.operation.cached_content_type(),
        data,
        head_only,
    )?;
    if head_only {
        resp.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    resp.headers_mut()
        .insert(header::LAST_MODIFIED, HeaderValue::from_str(&last_modified)?);
    Ok(Some(resp))
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// True when the client's copy is at least as new as `modified`, compared
/// at the one-second resolution of HTTP dates.
fn not_modified_since(headers: &HeaderMap, modified: SystemTime) -> bool {
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
    else {
        return false;
    };
    DateTime::<Utc>::from(modified).timestamp() <= since.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rama::http::body::util::BodyExt;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(300);

    async fn storage_with(key: &str, data: &[u8]) -> (TempDir, FilesystemStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(dir.path().to_path_buf());
        storage.put(key, data).await.unwrap();
        (dir, storage)
    }

    #[test]
    fn missing_entry_forwards() {
        let now = SystemTime::now();
        assert_eq!(
            cache_route(None, Freshness::Immutable, now, TTL),
            Route::Forward { stale: false }
        );
    }

    #[test]
    fn immutable_entry_is_served_at_any_age() {
        let now = SystemTime::now();
        let modified = now - Duration::from_secs(365 * 24 * 3600);
        assert_eq!(
            cache_route(Some(modified), Freshness::Immutable, now, TTL),
            Route::CachedFresh { modified }
        );
    }

    #[test]
    fn mutable_entry_expires_after_ttl() {
        let now = SystemTime::now();
        let young = now - Duration::from_secs(299);
        let old = now - Duration::from_secs(6 * 60);
        assert_eq!(
            cache_route(Some(young), Freshness::Mutable, now, TTL),
            Route::CachedFresh { modified: young }
        );
        assert_eq!(
            cache_route(Some(old), Freshness::Mutable, now, TTL),
            Route::Forward { stale: true }
        );
    }

    #[test]
    fn http_dates_use_gmt() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn if_modified_since_comparison() {
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        let mut headers = HeaderMap::new();
        assert!(!not_modified_since(&headers, modified));

        headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        assert!(not_modified_since(&headers, modified));
        assert!(!not_modified_since(&headers, modified + Duration::from_secs(1)));

        headers.insert(header::IF_MODIFIED_SINCE, HeaderValue::from_static("garbage"));
        assert!(!not_modified_since(&headers, modified));
    }

    #[tokio::test]
    async fn serves_entry_with_last_modified() {
        let (_dir, storage) = storage_with("example.com/mod/@v/v1.0.0.zip", b"PK zip").await;
        let request = ModuleRequest::from_path("/example.com/mod/@v/v1.0.0.zip").unwrap();
        let modified = storage.stat(&request.key).await.unwrap().unwrap();

        let resp = serve_cached(&storage, &request, modified, &HeaderMap::new(), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "6");
        assert!(resp.headers().contains_key(header::LAST_MODIFIED));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"PK zip");
    }

    #[tokio::test]
    async fn head_reports_entry_size() {
        let (_dir, storage) = storage_with("example.com/mod/@v/list", b"v1.0.0\n").await;
        let request = ModuleRequest::from_path("/example.com/mod/@v/list").unwrap();
        let modified = storage.stat(&request.key).await.unwrap().unwrap();

        let resp = serve_cached(&storage, &request, modified, &HeaderMap::new(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "7");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn conditional_request_gets_304() {
        let (_dir, storage) = storage_with("example.com/mod/@v/v1.0.0.mod", b"module x\n").await;
        let request = ModuleRequest::from_path("/example.com/mod/@v/v1.0.0.mod").unwrap();
        let modified = storage.stat(&request.key).await.unwrap().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&http_date(modified + Duration::from_secs(5))).unwrap(),
        );
        let resp = serve_cached(&storage, &request, modified, &headers, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn vanished_entry_returns_none() {
        let dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(dir.path().to_path_buf());
        let request = ModuleRequest::from_path("/example.com/mod/@latest").unwrap();
        let resp = serve_cached(&storage, &request, SystemTime::now(), &HeaderMap::new(), false)
            .await
            .unwrap();
        assert!(resp.is_none());
    }
}
