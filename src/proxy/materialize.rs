//! Turns a forwarded upstream answer into the client response and, for
//! successful answers, the cache entry.
//!
//! Bodies are stored decoded so that a gzip-encoded and a plain upstream
//! answer for the same key produce byte-identical files.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use gorelay_adapter::FilesystemStorage;
use rama::http::{HeaderMap, HeaderValue, StatusCode, header};
use tracing::{debug, warn};

use crate::upstream::{UpstreamResponse, is_hop_by_hop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Written,
    /// Not eligible: non-200 status or an encoding we do not decode.
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct Materialized {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub outcome: CacheWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Unsupported,
}

#[derive(Clone)]
pub struct ResponseMaterializer {
    storage: Arc<FilesystemStorage>,
}

impl ResponseMaterializer {
    pub fn new(storage: Arc<FilesystemStorage>) -> Self {
        Self { storage }
    }

    pub async fn materialize(&self, key: &str, response: UpstreamResponse) -> Materialized {
        let UpstreamResponse {
            status,
            headers,
            body,
        } = response;

        if status != StatusCode::OK {
            debug!(key, status = status.as_u16(), "not caching non-200 upstream response");
            return passthrough(status, headers, body, CacheWrite::Skipped);
        }

        let encoding = content_encoding(&headers);
        let decoded = match encoding {
            Encoding::Identity => body.clone(),
            Encoding::Gzip | Encoding::Deflate => match decode(encoding, &body) {
                Ok(decoded) => Bytes::from(decoded),
                Err(err) => {
                    warn!(key, error = %err, "failed to decode upstream body, passing it through");
                    return passthrough(status, headers, body, CacheWrite::Failed);
                }
            },
            Encoding::Unsupported => {
                debug!(key, "upstream used an unsupported content encoding, not caching");
                return passthrough(status, headers, body, CacheWrite::Skipped);
            }
        };

        let outcome = match self.storage.put(key, &decoded).await {
            Ok(()) => CacheWrite::Written,
            Err(err) => {
                warn!(key, error = %err, "failed to populate cache entry");
                CacheWrite::Failed
            }
        };

        let mut headers = end_to_end(headers);
        headers.remove(header::CONTENT_ENCODING);
        set_content_length(&mut headers, decoded.len());

        Materialized {
            status,
            headers,
            body: decoded,
            outcome,
        }
    }
}

fn passthrough(
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    outcome: CacheWrite,
) -> Materialized {
    let mut headers = end_to_end(headers);
    set_content_length(&mut headers, body.len());
    Materialized {
        status,
        headers,
        body,
        outcome,
    }
}

fn end_to_end(mut headers: HeaderMap) -> HeaderMap {
    let hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
    headers
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

fn content_encoding(headers: &HeaderMap) -> Encoding {
    let codings: Vec<String> = headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|coding| coding.trim().to_ascii_lowercase())
        .filter(|coding| !coding.is_empty() && coding != "identity")
        .collect();

    match codings.as_slice() {
        [] => Encoding::Identity,
        [one] if one == "gzip" || one == "x-gzip" => Encoding::Gzip,
        [one] if one == "deflate" => Encoding::Deflate,
        _ => Encoding::Unsupported,
    }
}

fn decode(encoding: Encoding, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() * 2);
    match encoding {
        Encoding::Gzip => {
            // Concatenated members form one stream.
            MultiGzDecoder::new(body).read_to_end(&mut out)?;
        }
        Encoding::Deflate => {
            // `deflate` is zlib-wrapped per RFC 9110; some servers send it raw.
            if ZlibDecoder::new(body).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(body).read_to_end(&mut out)?;
            }
        }
        Encoding::Identity | Encoding::Unsupported => out.extend_from_slice(body),
    }
    Ok(out)
}
