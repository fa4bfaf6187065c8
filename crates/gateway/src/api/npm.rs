//! npm adapter.
//!
//! `GET /npm/<pkg>` and `GET /npm/@scope/<pkg>` proxy the package metadata
//! document with its tarball URLs rewritten to point back at this proxy;
//! `GET /npm/<pkg>/-/<filename>.tgz` is the pull-through tarball path.
//! Scoped names arrive either as `@scope/pkg` or `@scope%2Fpkg` — the
//! router decodes both to the same shape.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;

use amargo_domain::model::RepoFormat;
use amargo_domain::{Error, Result};

use crate::api::{client_meta, headers, local_base, passthrough_buffered, route_target};
use crate::cache::{ServeOptions, ServeOutcome};
use crate::state::AppState;

const TARBALL_CONTENT_TYPE: &str = "application/octet-stream";

enum NpmRequest {
    Metadata { pkg: String },
    Tarball { pkg: String, version: String, filename: String },
}

fn parse_path(path: &str) -> Result<NpmRequest> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Err(Error::InvalidRequest("empty npm path".into()));
    }

    match path.split_once("/-/") {
        None => Ok(NpmRequest::Metadata { pkg: path.to_owned() }),
        Some((pkg, filename)) => {
            if filename.contains('/') {
                return Err(Error::InvalidRequest(format!("bad npm tarball path '{path}'")));
            }
            let version = extract_version(pkg, filename)?;
            Ok(NpmRequest::Tarball {
                pkg: pkg.to_owned(),
                version,
                filename: filename.to_owned(),
            })
        }
    }
}

/// Strip the `<clean-pkg>-` prefix and `.tgz` suffix off the filename.
/// For scoped packages the filename carries only the unscoped part.
fn extract_version(pkg: &str, filename: &str) -> Result<String> {
    let clean = pkg.rsplit('/').next().unwrap_or(pkg);
    filename
        .strip_prefix(clean)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".tgz"))
        .filter(|version| !version.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            Error::InvalidRequest(format!("npm filename '{filename}' does not match package '{pkg}'"))
        })
}

/// Rewrite every `dist.tarball` URL in the metadata document so npm comes
/// back through this proxy for the actual tarballs.
fn rewrite_tarball_urls(doc: &mut serde_json::Value, base: &str, pkg: &str) {
    let Some(versions) = doc.get_mut("versions").and_then(|v| v.as_object_mut()) else {
        return;
    };
    for version in versions.values_mut() {
        let Some(tarball) = version.get_mut("dist").and_then(|d| d.get_mut("tarball")) else {
            continue;
        };
        let Some(url) = tarball.as_str() else {
            continue;
        };
        let Some(filename) = url.rsplit('/').next() else {
            continue;
        };
        *tarball = serde_json::Value::String(format!("{base}/npm/{pkg}/-/{filename}"));
    }
}

pub async fn serve_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request_headers: HeaderMap,
) -> Response {
    match handle(&state, &path, &request_headers).await {
        Ok(resp) => resp,
        Err(e) => headers::error_response(e),
    }
}

async fn handle(state: &AppState, path: &str, request_headers: &HeaderMap) -> Result<Response> {
    let target = route_target(state, RepoFormat::Npm)?;

    match parse_path(path)? {
        NpmRequest::Metadata { pkg } => {
            let fetched = passthrough_buffered(state, &target, |_repo| format!("/{pkg}"), &[]).await?;
            let Some((body, _content_type, repo_name)) = fetched else {
                return Err(Error::NotFound);
            };

            let mut doc: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|e| Error::UpstreamUnavailable(format!("npm metadata for '{pkg}': {e}")))?;
            rewrite_tarball_urls(&mut doc, &local_base(request_headers), &pkg);
            let body = serde_json::to_vec(&doc)?;

            Ok(headers::passthrough_bytes(
                body.into(),
                "application/json",
                headers::CC_MUTABLE,
                Some(&repo_name),
            ))
        }
        NpmRequest::Tarball { pkg, version, filename } => {
            let upstream = state.upstream.clone();
            let tarball_path = format!("/{pkg}/-/{filename}");
            let outcome = state
                .cache
                .serve(
                    &target,
                    &pkg,
                    &version,
                    |repo| {
                        let upstream = upstream.clone();
                        let path = tarball_path.clone();
                        async move { upstream.fetch(&repo, &path, &[]).await }
                    },
                    ServeOptions {
                        content_type: TARBALL_CONTENT_TYPE.into(),
                        metadata: HashMap::from([("filename".to_owned(), filename.clone())]),
                        ttl_secs: None,
                    },
                )
                .await?;

            let (ip, ua) = client_meta(request_headers);
            match outcome {
                ServeOutcome::Hit(hit) => {
                    state.artifacts.record_download(hit.repo_id, &pkg, &version, ip, ua);
                    Ok(headers::hit_response(hit, headers::CC_IMMUTABLE))
                }
                ServeOutcome::Miss(miss) => {
                    state.artifacts.record_download(miss.repo_id, &pkg, &version, ip, ua);
                    Ok(headers::miss_response(miss, TARBALL_CONTENT_TYPE, headers::CC_IMMUTABLE))
                }
                ServeOutcome::NotFound => Err(Error::NotFound),
            }
        }
    }
}
