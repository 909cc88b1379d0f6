use anyhow::{Context, Result};
use bytes::Bytes;
use rama::http::{Body, HeaderValue, Response, StatusCode, header};

use super::materialize::Materialized;
use super::types::TEXT_PLAIN;

/// Responds with plain text
pub fn respond_text(status: StatusCode, body: &str) -> Result<Response<Body>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN))
        .header(header::CONTENT_LENGTH, HeaderValue::from(body.len()))
        .body(Body::from(body.to_owned()))
        .context("building text response")
}

pub fn respond_method_not_allowed() -> Result<Response<Body>> {
    let mut resp = respond_text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")?;
    resp.headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
    Ok(resp)
}

/// A 200 carrying protocol bytes. `HEAD` keeps the headers and drops the body.
pub fn respond_bytes(
    content_type: &'static str,
    body: Bytes,
    head_only: bool,
) -> Result<Response<Body>> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static(content_type))
        .header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    let body = if head_only { Body::empty() } else { Body::from(body) };
    builder.body(body).context("building response")
}

/// Rebuilds a forwarded answer for the client.
pub fn respond_materialized(materialized: Materialized, head_only: bool) -> Result<Response<Body>> {
    let Materialized {
        status,
        headers,
        body,
        ..
    } = materialized;

    let mut builder = Response::builder().status(status);
    {
        let out = builder
            .headers_mut()
            .context("building forwarded response headers")?;
        out.extend(headers);
    }
    let body = if head_only { Body::empty() } else { Body::from(body) };
    builder.body(body).context("building forwarded response")
}
