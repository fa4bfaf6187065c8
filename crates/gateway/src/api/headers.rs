//! Response assembly shared by every protocol adapter: cache-status
//! labelling, repository attribution, ETag exposure, and the error-to-HTTP
//! mapping.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;

use amargo_domain::stream::ByteStream;
use amargo_domain::Error;

use crate::cache::{Hit, Miss};

pub const X_CACHE: &str = "x-cache";
pub const X_REPOSITORY: &str = "x-repository";

/// Immutable artifact blobs: the identity implies the bytes.
pub const CC_IMMUTABLE: &str = "public, max-age=31536000, immutable";
/// Mutable indexes and metadata documents.
pub const CC_MUTABLE: &str = "public, max-age=300";

/// A cache hit: full strong validators from the artifact row.
pub fn hit_response(hit: Hit, cache_control: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &hit.info.content_type)
        .header(header::CONTENT_LENGTH, hit.info.size)
        .header(header::ETAG, format!("\"{}\"", hit.info.digest))
        .header(header::CACHE_CONTROL, cache_control)
        .header(X_CACHE, "HIT")
        .header(X_REPOSITORY, &hit.repo_name)
        .body(Body::from_stream(hit.stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A miss teed from upstream. Content length is only set when the upstream
/// provided one.
pub fn miss_response(miss: Miss, default_content_type: &str, cache_control: &str) -> Response {
    let content_type = miss
        .content_type
        .as_deref()
        .unwrap_or(default_content_type)
        .to_owned();
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .header(X_CACHE, "MISS")
        .header(X_REPOSITORY, &miss.repo_name);
    if let Some(length) = miss.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    builder
        .body(Body::from_stream(miss.stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A buffered passthrough document (rewritten metadata pages, indexes).
pub fn passthrough_bytes(
    body: Bytes,
    content_type: &str,
    cache_control: &str,
    repo_name: Option<&str>,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .header(X_CACHE, "MISS");
    if let Some(repo) = repo_name {
        builder = builder.header(X_REPOSITORY, repo);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A streamed passthrough (large indexes that need no rewriting).
pub fn passthrough_stream(
    stream: ByteStream,
    content_type: &str,
    cache_control: &str,
    repo_name: Option<&str>,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .header(X_CACHE, "MISS");
    if let Some(repo) = repo_name {
        builder = builder.header(X_REPOSITORY, repo);
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Map the error taxonomy onto wire status codes.
pub fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::UpstreamUnavailable(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::warn!(error = %err, status = %status, "request failed");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
