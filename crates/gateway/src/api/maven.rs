//! Maven adapter.
//!
//! `/maven/<group-path>/<artifact-id>/<version>/<filename>` pulls through
//! the cache; `maven-metadata.xml` (which carries no version) is proxied
//! with the short cache header. Content types follow the conventional
//! extension table.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;

use amargo_domain::model::RepoFormat;
use amargo_domain::{Error, Result};

use crate::api::{client_meta, headers, route_target};
use crate::cache::{ServeOptions, ServeOutcome};
use crate::state::AppState;

#[derive(Debug, PartialEq, Eq)]
struct MavenCoords {
    group_id: String,
    artifact_id: String,
    /// `None` for `maven-metadata.xml`.
    version: Option<String>,
    filename: String,
}

/// Last segment is the filename. For `maven-metadata.xml` the segment
/// before it is the artifact id and the rest joins into the group id;
/// otherwise the last three segments are `(artifact, version, filename)`.
fn parse_path(path: &str) -> Result<MavenCoords> {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let (&filename, rest) = segments
        .split_last()
        .ok_or_else(|| Error::InvalidRequest("empty maven path".into()))?;

    if filename == "maven-metadata.xml" {
        let (&artifact_id, group) = rest
            .split_last()
            .ok_or_else(|| Error::InvalidRequest(format!("bad metadata path '{path}'")))?;
        if group.is_empty() {
            return Err(Error::InvalidRequest(format!("metadata path '{path}' has no group")));
        }
        return Ok(MavenCoords {
            group_id: group.join("."),
            artifact_id: artifact_id.to_owned(),
            version: None,
            filename: filename.to_owned(),
        });
    }

    if rest.len() < 3 {
        return Err(Error::InvalidRequest(format!("maven path '{path}' too short")));
    }
    let version = rest[rest.len() - 1];
    let artifact_id = rest[rest.len() - 2];
    let group = &rest[..rest.len() - 2];
    Ok(MavenCoords {
        group_id: group.join("."),
        artifact_id: artifact_id.to_owned(),
        version: Some(version.to_owned()),
        filename: filename.to_owned(),
    })
}

/// Conventional content type for a maven file.
fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or_default();
    match ext {
        "jar" | "war" | "ear" => "application/java-archive",
        "pom" | "xml" => "application/xml",
        "sha1" | "md5" | "asc" => "text/plain",
        _ => "application/octet-stream",
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
    let target = route_target(state, RepoFormat::Maven)?;
    let coords = parse_path(path)?;
    let upstream_path = format!("/{}", path.trim_matches('/'));
    let content_type = content_type_for(&coords.filename);

    // maven-metadata.xml is mutable: stream it through, never store it.
    let Some(version) = coords.version.clone() else {
        for repo in state.cache.proxy_candidates(&target).await? {
            match state.upstream.fetch(&repo, &upstream_path, &[]).await? {
                Some(found) => {
                    return Ok(headers::passthrough_stream(
                        found.stream,
                        content_type,
                        headers::CC_MUTABLE,
                        Some(&repo.name),
                    ));
                }
                None => continue,
            }
        }
        return Err(Error::NotFound);
    };

    // Versioned files are immutable; every sibling file of a release (jar,
    // pom, checksums) is its own artifact, so the filename joins the
    // identity.
    let artifact_name = format!("{}:{}:{}", coords.group_id, coords.artifact_id, coords.filename);

    let upstream = state.upstream.clone();
    let hook_path = upstream_path.clone();
    let outcome = state
        .cache
        .serve(
            &target,
            &artifact_name,
            &version,
            move |repo| {
                let upstream = upstream.clone();
                let path = hook_path.clone();
                async move { upstream.fetch(&repo, &path, &[]).await }
            },
            ServeOptions {
                content_type: content_type.into(),
                metadata: HashMap::from([
                    ("group".to_owned(), coords.group_id.clone()),
                    ("artifact".to_owned(), coords.artifact_id.clone()),
                    ("filename".to_owned(), coords.filename.clone()),
                ]),
                ttl_secs: None,
            },
        )
        .await?;

    let (ip, ua) = client_meta(request_headers);
    match outcome {
        ServeOutcome::Hit(hit) => {
            state
                .artifacts
                .record_download(hit.repo_id, &artifact_name, &version, ip, ua);
            Ok(headers::hit_response(hit, headers::CC_IMMUTABLE))
        }
        ServeOutcome::Miss(miss) => {
            state
                .artifacts
                .record_download(miss.repo_id, &artifact_name, &version, ip, ua);
            Ok(headers::miss_response(miss, content_type, headers::CC_IMMUTABLE))
        }
        ServeOutcome::NotFound => Err(Error::NotFound),
    }
}
