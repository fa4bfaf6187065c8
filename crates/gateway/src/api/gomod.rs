//! Go module proxy adapter.
//!
//! `/go/<module>/@v/list`, `@v/<ver>.info`, `@v/<ver>.mod` and `/@latest`
//! are proxied with a short-lived cache header; only `@v/<ver>.zip` goes
//! through the pull-through cache. Upstream module paths use the proxy
//! protocol's escaping: every upper-case letter becomes `!` plus its
//! lower-case.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;

use amargo_domain::model::RepoFormat;
use amargo_domain::{Error, Result};

use crate::api::{client_meta, headers, route_target};
use crate::cache::{ServeOptions, ServeOutcome};
use crate::state::AppState;

const ZIP_CONTENT_TYPE: &str = "application/zip";

/// `github.com/Masterminds/semver` → `github.com/!masterminds/semver`.
pub fn escape_module_path(module: &str) -> String {
    let mut out = String::with_capacity(module.len());
    for c in module.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Inverse of [`escape_module_path`]; go tooling sends escaped paths.
pub fn unescape_module_path(module: &str) -> Result<String> {
    let mut out = String::with_capacity(module.len());
    let mut chars = module.chars();
    while let Some(c) = chars.next() {
        if c == '!' {
            let next = chars.next().ok_or_else(|| {
                Error::InvalidRequest(format!("dangling '!' in module path '{module}'"))
            })?;
            out.push(next.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

enum GoRequest {
    /// `@v/list`, `@v/<ver>.info`, `@v/<ver>.mod`, `@latest` — passthrough.
    Meta { module: String, suffix: String },
    /// `@v/<ver>.zip` — cached.
    Zip { module: String, version: String },
}

fn parse_path(path: &str) -> Result<GoRequest> {
    let path = path.trim_matches('/');

    if let Some(module) = path.strip_suffix("/@latest") {
        if module.is_empty() {
            return Err(Error::InvalidRequest("empty module path".into()));
        }
        return Ok(GoRequest::Meta {
            module: unescape_module_path(module)?,
            suffix: "@latest".into(),
        });
    }

    let (module, file) = path
        .split_once("/@v/")
        .ok_or_else(|| Error::InvalidRequest(format!("unrecognised go proxy path '{path}'")))?;
    if module.is_empty() || file.is_empty() || file.contains('/') {
        return Err(Error::InvalidRequest(format!("bad go proxy path '{path}'")));
    }
    let module = unescape_module_path(module)?;

    if let Some(version) = file.strip_suffix(".zip") {
        if version.is_empty() {
            return Err(Error::InvalidRequest(format!("bad zip path '{path}'")));
        }
        return Ok(GoRequest::Zip {
            module,
            version: version.to_owned(),
        });
    }
    if file == "list" || file.ends_with(".info") || file.ends_with(".mod") {
        return Ok(GoRequest::Meta {
            module,
            suffix: format!("@v/{file}"),
        });
    }
    Err(Error::InvalidRequest(format!("unrecognised go proxy file '{file}'")))
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
    let target = route_target(state, RepoFormat::Go)?;

    match parse_path(path)? {
        GoRequest::Meta { module, suffix } => {
            let escaped = escape_module_path(&module);
            for repo in state.cache.proxy_candidates(&target).await? {
                match state
                    .upstream
                    .fetch(&repo, &format!("/{escaped}/{suffix}"), &[])
                    .await?
                {
                    Some(found) => {
                        let content_type = found.content_type.clone();
                        return Ok(headers::passthrough_stream(
                            found.stream,
                            content_type.as_deref().unwrap_or("text/plain; charset=utf-8"),
                            headers::CC_MUTABLE,
                            Some(&repo.name),
                        ));
                    }
                    None => continue,
                }
            }
            Err(Error::NotFound)
        }
        GoRequest::Zip { module, version } => {
            let upstream = state.upstream.clone();
            let module_for_hook = module.clone();
            let version_for_hook = version.clone();
            let outcome = state
                .cache
                .serve(
                    &target,
                    &module,
                    &version,
                    move |repo| {
                        let upstream = upstream.clone();
                        let escaped = escape_module_path(&module_for_hook);
                        let version = version_for_hook.clone();
                        async move {
                            upstream
                                .fetch(&repo, &format!("/{escaped}/@v/{version}.zip"), &[])
                                .await
                        }
                    },
                    ServeOptions {
                        content_type: ZIP_CONTENT_TYPE.into(),
                        metadata: HashMap::from([("module".to_owned(), module.clone())]),
                        ttl_secs: None,
                    },
                )
                .await?;

            let (ip, ua) = client_meta(request_headers);
            match outcome {
                ServeOutcome::Hit(hit) => {
                    state.artifacts.record_download(hit.repo_id, &module, &version, ip, ua);
                    Ok(headers::hit_response(hit, headers::CC_IMMUTABLE))
                }
                ServeOutcome::Miss(miss) => {
                    state.artifacts.record_download(miss.repo_id, &module, &version, ip, ua);
                    Ok(headers::miss_response(miss, ZIP_CONTENT_TYPE, headers::CC_IMMUTABLE))
                }
                ServeOutcome::NotFound => Err(Error::NotFound),
            }
        }
    }
}
