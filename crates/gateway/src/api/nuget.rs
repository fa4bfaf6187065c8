//! NuGet V3 adapter.
//!
//! Serves a minimal service index pointing the flat-container resource at
//! this proxy; `/nuget/v3-flatcontainer/<id>/index.json` (version list) and
//! `.nuspec` files are proxied, `.nupkg` packages pull through the cache.
//! Ids and versions are lower-cased as the flat-container protocol
//! requires.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};

use amargo_domain::model::RepoFormat;
use amargo_domain::{Error, Result};

use crate::api::{client_meta, headers, local_base, route_target};
use crate::cache::{ServeOptions, ServeOutcome};
use crate::state::AppState;

const NUPKG_CONTENT_TYPE: &str = "application/octet-stream";

enum NugetRequest {
    /// `<id>/index.json` — the version list, proxied.
    VersionList { id: String },
    /// `<id>/<version>/<filename>.nupkg` — cached.
    Package { id: String, version: String, filename: String },
    /// `<id>/<version>/<filename>.nuspec` — proxied.
    Spec { id: String, version: String, filename: String },
}

fn parse_path(path: &str) -> Result<NugetRequest> {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    match segments.as_slice() {
        [id, "index.json"] => Ok(NugetRequest::VersionList {
            id: id.to_lowercase(),
        }),
        [id, version, filename] if filename.ends_with(".nupkg") => Ok(NugetRequest::Package {
            id: id.to_lowercase(),
            version: version.to_lowercase(),
            filename: filename.to_lowercase(),
        }),
        [id, version, filename] if filename.ends_with(".nuspec") => Ok(NugetRequest::Spec {
            id: id.to_lowercase(),
            version: version.to_lowercase(),
            filename: filename.to_lowercase(),
        }),
        _ => Err(Error::InvalidRequest(format!("unrecognised nuget path '{path}'"))),
    }
}

/// `GET /nuget/v3/index.json` — the service index. Package downloads go
/// through this proxy; registration metadata stays on the upstream, which
/// clients reach directly.
pub async fn service_index(State(state): State<AppState>, request_headers: HeaderMap) -> Response {
    match index(&state, &request_headers).await {
        Ok(resp) => resp,
        Err(e) => headers::error_response(e),
    }
}

async fn index(state: &AppState, request_headers: &HeaderMap) -> Result<Response> {
    let target = route_target(state, RepoFormat::Nuget)?;
    let base = local_base(request_headers);

    let registrations = state
        .cache
        .proxy_candidates(&target)
        .await?
        .first()
        .and_then(|repo| repo.upstream_base().map(ToOwned::to_owned))
        .map(|upstream| format!("{upstream}/v3/registration5-semver1/"));

    let mut resources = vec![
        serde_json::json!({
            "@id": format!("{base}/nuget/v3-flatcontainer/"),
            "@type": "PackageBaseAddress/3.0.0",
            "comment": "Package content served through this proxy",
        }),
    ];
    if let Some(registrations) = registrations {
        resources.push(serde_json::json!({
            "@id": registrations,
            "@type": "RegistrationsBaseUrl/3.6.0",
        }));
    }

    Ok(Json(serde_json::json!({
        "version": "3.0.0",
        "resources": resources,
    }))
    .into_response())
}

pub async fn serve_flat(
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
    let target = route_target(state, RepoFormat::Nuget)?;

    match parse_path(path)? {
        NugetRequest::VersionList { id } => {
            passthrough(state, &target, &format!("/v3-flatcontainer/{id}/index.json"), "application/json").await
        }
        NugetRequest::Spec { id, version, filename } => {
            passthrough(
                state,
                &target,
                &format!("/v3-flatcontainer/{id}/{version}/{filename}"),
                "application/xml",
            )
            .await
        }
        NugetRequest::Package { id, version, filename } => {
            let upstream = state.upstream.clone();
            let hook_path = format!("/v3-flatcontainer/{id}/{version}/{filename}");
            let outcome = state
                .cache
                .serve(
                    &target,
                    &id,
                    &version,
                    move |repo| {
                        let upstream = upstream.clone();
                        let path = hook_path.clone();
                        async move { upstream.fetch(&repo, &path, &[]).await }
                    },
                    ServeOptions {
                        content_type: NUPKG_CONTENT_TYPE.into(),
                        metadata: HashMap::from([("filename".to_owned(), filename.clone())]),
                        ttl_secs: None,
                    },
                )
                .await?;

            let (ip, ua) = client_meta(request_headers);
            match outcome {
                ServeOutcome::Hit(hit) => {
                    state.artifacts.record_download(hit.repo_id, &id, &version, ip, ua);
                    Ok(headers::hit_response(hit, headers::CC_IMMUTABLE))
                }
                ServeOutcome::Miss(miss) => {
                    state.artifacts.record_download(miss.repo_id, &id, &version, ip, ua);
                    Ok(headers::miss_response(miss, NUPKG_CONTENT_TYPE, headers::CC_IMMUTABLE))
                }
                ServeOutcome::NotFound => Err(Error::NotFound),
            }
        }
    }
}

async fn passthrough(
    state: &AppState,
    target: &str,
    path: &str,
    default_content_type: &str,
) -> Result<Response> {
    for repo in state.cache.proxy_candidates(target).await? {
        match state.upstream.fetch(&repo, path, &[]).await? {
            Some(found) => {
                let content_type = found.content_type.clone();
                return Ok(headers::passthrough_stream(
                    found.stream,
                    content_type.as_deref().unwrap_or(default_content_type),
                    headers::CC_MUTABLE,
                    Some(&repo.name),
                ));
            }
            None => continue,
        }
    }
    Err(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_list_parses_and_lowercases() {
        let NugetRequest::VersionList { id } = parse_path("Newtonsoft.Json/index.json").unwrap()
        else {
            panic!("expected version list");
        };
        assert_eq!(id, "newtonsoft.json");
    }

    #[test]
    fn nupkg_is_a_package_request() {
        let NugetRequest::Package { id, version, filename } =
            parse_path("newtonsoft.json/13.0.3/newtonsoft.json.13.0.3.nupkg").unwrap()
        else {
            panic!("expected package");
        };
        assert_eq!(id, "newtonsoft.json");
        assert_eq!(version, "13.0.3");
        assert_eq!(filename, "newtonsoft.json.13.0.3.nupkg");
    }

    #[test]
    fn nuspec_is_passthrough() {
        assert!(matches!(
            parse_path("newtonsoft.json/13.0.3/newtonsoft.json.nuspec").unwrap(),
            NugetRequest::Spec { .. }
        ));
    }

    #[test]
    fn other_shapes_are_invalid() {
        assert!(parse_path("newtonsoft.json").is_err());
        assert!(parse_path("a/b/c/d.nupkg").is_err());
        assert!(parse_path("a/1.0/file.zip").is_err());
    }
}
