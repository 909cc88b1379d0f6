use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rama::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::{Client, redirect};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::UpstreamConfig;

const UA: &str = concat!("gorelay/", env!("CARGO_PKG_VERSION"));

/// Connection-scoped headers that never cross a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

/// A fully buffered upstream answer, still carrying its original encoding.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Client for the single upstream module proxy. One attempt per request;
/// redirects are handed back to the caller and bodies are never decoded here.
#[derive(Clone)]
pub struct UpstreamClient {
    base: Url,
    client: Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(UA)
            .no_gzip()
            .no_deflate()
            .no_brotli()
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building upstream HTTP client")?;

        info!(
            upstream = %config.url,
            timeout_secs = config.timeout_secs,
            "upstream client initialized"
        );

        Ok(Self {
            base: config.url.clone(),
            client,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Appends the request path (and query) to the base URL, keeping any
    /// path prefix the base carries.
    pub fn target(&self, path: &str, query: Option<&str>) -> Result<Url> {
        let base_path = self.base.path().trim_end_matches('/');
        let req_path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let mut target = self.base.clone();
        target.set_path(&format!("{base_path}{req_path}"));
        target.set_query(query.filter(|q| !q.is_empty()));
        target.set_fragment(None);
        Ok(target)
    }

    /// Issues one GET carrying the client's end-to-end headers.
    pub async fn get(
        &self,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<UpstreamResponse> {
        let url = self
            .target(path, query)
            .with_context(|| format!("constructing upstream url for {path}"))?;

        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            if name == rama::http::header::HOST
                || name == rama::http::header::CONTENT_LENGTH
                || is_hop_by_hop(name.as_str())
            {
                continue;
            }
            request = request.header(name.as_str(), value.as_bytes());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .with_context(|| format!("upstream status {}", response.status()))?;
        let mut out = HeaderMap::new();
        for (name, value) in response.headers() {
            match (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    out.append(name, value);
                }
                _ => warn!(header = %name, "dropping unrepresentable upstream header"),
            }
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading body from {url}"))?;
        debug!(%url, status = status.as_u16(), bytes = body.len(), "upstream responded");

        Ok(UpstreamResponse {
            status,
            headers: out,
            body,
        })
    }
}
