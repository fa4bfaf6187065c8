//! Docker Registry v2 adapter.
//!
//! Manifests and blobs are cached as composite artifacts
//! (`"<image>:manifest:<ref>"`, `"<image>:blob:<digest>"`). Responses carry
//! `Docker-Content-Digest`; blob requests are digest-verified against the
//! stored bytes before serving. Docker Hub members get the `library/`
//! normalisation for official images and a short-lived pull token per
//! fetch.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use amargo_domain::model::RepoFormat;
use amargo_domain::{Error, Result};

use crate::api::{client_meta, headers, route_target};
use crate::cache::{ServeOptions, ServeOutcome};
use crate::state::AppState;
use crate::upstream::UpstreamClient;

const API_VERSION_HEADER: &str = "docker-distribution-api-version";
const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const MANIFEST_CONTENT_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DEFAULT_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

enum DockerRequest {
    Manifest { image: String, reference: String },
    Blob { image: String, digest: String },
}

/// Registry paths embed the image name with arbitrary depth:
/// `<name...>/manifests/<ref>` or `<name...>/blobs/<digest>`.
fn parse_path(path: &str) -> Result<DockerRequest> {
    let path = path.trim_matches('/');
    if let Some((image, reference)) = path.rsplit_once("/manifests/") {
        if image.is_empty() || reference.is_empty() || reference.contains('/') {
            return Err(Error::InvalidRequest(format!("bad manifest path '{path}'")));
        }
        return Ok(DockerRequest::Manifest {
            image: image.to_owned(),
            reference: reference.to_owned(),
        });
    }
    if let Some((image, digest)) = path.rsplit_once("/blobs/") {
        if image.is_empty() || !digest.starts_with("sha256:") || digest.contains('/') {
            return Err(Error::InvalidRequest(format!("bad blob path '{path}'")));
        }
        return Ok(DockerRequest::Blob {
            image: image.to_owned(),
            digest: digest.to_owned(),
        });
    }
    Err(Error::InvalidRequest(format!("unrecognised registry path '{path}'")))
}

/// Docker Hub hosts official images under `library/`.
fn upstream_image(repo_is_hub: bool, image: &str) -> String {
    if repo_is_hub && !image.contains('/') {
        format!("library/{image}")
    } else {
        image.to_owned()
    }
}

/// `GET /v2/` — version check.
pub async fn ping() -> Response {
    (
        StatusCode::OK,
        [
            (API_VERSION_HEADER, "registry/2.0"),
            (header::CONTENT_TYPE.as_str(), "application/json"),
        ],
        "{}",
    )
        .into_response()
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
    let target = route_target(state, RepoFormat::Docker)?;
    match parse_path(path)? {
        DockerRequest::Manifest { image, reference } => {
            serve_manifest(state, &target, &image, &reference, request_headers).await
        }
        DockerRequest::Blob { image, digest } => {
            serve_blob(state, &target, &image, &digest, request_headers).await
        }
    }
}

async fn serve_manifest(
    state: &AppState,
    target: &str,
    image: &str,
    reference: &str,
    request_headers: &HeaderMap,
) -> Result<Response> {
    let artifact_name = format!("{image}:manifest:{reference}");
    let accept = request_headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && *v != "*/*")
        .unwrap_or(DEFAULT_ACCEPT)
        .to_owned();

    let upstream = state.upstream.clone();
    let image_owned = image.to_owned();
    let reference_owned = reference.to_owned();
    let outcome = state
        .cache
        .serve(
            target,
            &artifact_name,
            reference,
            move |repo| {
                let upstream = upstream.clone();
                let image = image_owned.clone();
                let reference = reference_owned.clone();
                let accept = accept.clone();
                async move {
                    let is_hub = UpstreamClient::is_docker_hub(&repo);
                    let image = upstream_image(is_hub, &image);
                    let mut extra = vec![("accept", accept)];
                    if is_hub {
                        let token = upstream.docker_token(&image).await?;
                        extra.push(("authorization", format!("Bearer {token}")));
                    }
                    upstream
                        .fetch(&repo, &format!("/v2/{image}/manifests/{reference}"), &extra)
                        .await
                }
            },
            ServeOptions {
                content_type: MANIFEST_CONTENT_TYPE.into(),
                metadata: HashMap::from([("image".to_owned(), image.to_owned())]),
                ttl_secs: None,
            },
        )
        .await?;

    let (ip, ua) = client_meta(request_headers);
    match outcome {
        ServeOutcome::Hit(hit) => {
            state
                .artifacts
                .record_download(hit.repo_id, &artifact_name, reference, ip, ua);
            let digest = format!("sha256:{}", hit.info.digest);
            let mut resp = headers::hit_response(hit, headers::CC_MUTABLE);
            insert_docker_headers(&mut resp, Some(&digest));
            Ok(resp)
        }
        ServeOutcome::Miss(miss) => {
            state
                .artifacts
                .record_download(miss.repo_id, &artifact_name, reference, ip, ua);
            let digest = miss.content_digest.clone();
            let mut resp = headers::miss_response(miss, MANIFEST_CONTENT_TYPE, headers::CC_MUTABLE);
            insert_docker_headers(&mut resp, digest.as_deref());
            Ok(resp)
        }
        ServeOutcome::NotFound => Err(Error::NotFound),
    }
}

async fn serve_blob(
    state: &AppState,
    target: &str,
    image: &str,
    digest: &str,
    request_headers: &HeaderMap,
) -> Result<Response> {
    let artifact_name = format!("{image}:blob:{digest}");
    let expected_hex = digest.trim_start_matches("sha256:").to_owned();

    let upstream = state.upstream.clone();
    let image_owned = image.to_owned();
    let digest_owned = digest.to_owned();
    let outcome = state
        .cache
        .serve(
            target,
            &artifact_name,
            digest,
            move |repo| {
                let upstream = upstream.clone();
                let image = image_owned.clone();
                let digest = digest_owned.clone();
                async move {
                    let is_hub = UpstreamClient::is_docker_hub(&repo);
                    let image = upstream_image(is_hub, &image);
                    let mut extra = Vec::new();
                    if is_hub {
                        let token = upstream.docker_token(&image).await?;
                        extra.push(("authorization", format!("Bearer {token}")));
                    }
                    upstream
                        .fetch(&repo, &format!("/v2/{image}/blobs/{digest}"), &extra)
                        .await
                }
            },
            ServeOptions {
                content_type: "application/octet-stream".into(),
                metadata: HashMap::from([("image".to_owned(), image.to_owned())]),
                ttl_secs: None,
            },
        )
        .await?;

    let (ip, ua) = client_meta(request_headers);
    match outcome {
        ServeOutcome::Hit(hit) => {
            // The digest in the URL must equal the SHA-256 of the bytes.
            if hit.info.digest != expected_hex {
                return Err(Error::Internal(format!(
                    "cached blob digest {} does not match requested {digest}",
                    hit.info.digest
                )));
            }
            state
                .artifacts
                .record_download(hit.repo_id, &artifact_name, digest, ip, ua);
            let mut resp = headers::hit_response(hit, headers::CC_IMMUTABLE);
            insert_docker_headers(&mut resp, Some(digest));
            Ok(resp)
        }
        ServeOutcome::Miss(mut miss) => {
            state
                .artifacts
                .record_download(miss.repo_id, &artifact_name, digest, ip, ua);

            // Verify the stored bytes once population completes; a corrupt
            // upstream response must not stay cached.
            let verify_artifacts = state.artifacts.clone();
            let verify_repo = miss.repo_id;
            let verify_name = artifact_name.clone();
            let verify_version = digest.to_owned();
            let info_rx = std::mem::replace(&mut miss.info_rx, tokio::sync::oneshot::channel().1);
            let mut resp =
                headers::miss_response(miss, "application/octet-stream", headers::CC_IMMUTABLE);
            insert_docker_headers(&mut resp, Some(digest));

            tokio::spawn(async move {
                if let Ok(Ok(info)) = info_rx.await {
                    if info.digest != expected_hex {
                        tracing::warn!(
                            expected = %expected_hex,
                            actual = %info.digest,
                            name = %verify_name,
                            "blob digest mismatch after fetch, evicting"
                        );
                        if let Err(e) = verify_artifacts
                            .delete(verify_repo, &verify_name, &verify_version)
                            .await
                        {
                            tracing::warn!(error = %e, "failed to evict mismatched blob");
                        }
                    }
                }
            });

            Ok(resp)
        }
        ServeOutcome::NotFound => Err(Error::NotFound),
    }
}

fn insert_docker_headers(resp: &mut Response, digest: Option<&str>) {
    let headers = resp.headers_mut();
    if let Ok(value) = "registry/2.0".parse() {
        headers.insert(API_VERSION_HEADER, value);
    }
    if let Some(digest) = digest {
        if let Ok(value) = digest.parse() {
            headers.insert(CONTENT_DIGEST_HEADER, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_paths_parse_with_nested_names() {
        let DockerRequest::Manifest { image, reference } =
            parse_path("library/alpine/manifests/3.19").unwrap()
        else {
            panic!("expected manifest");
        };
        assert_eq!(image, "library/alpine");
        assert_eq!(reference, "3.19");

        let DockerRequest::Manifest { image, .. } =
            parse_path("myorg/team/app/manifests/latest").unwrap()
        else {
            panic!("expected manifest");
        };
        assert_eq!(image, "myorg/team/app");
    }

    #[test]
    fn blob_paths_require_a_sha256_digest() {
        let DockerRequest::Blob { image, digest } =
            parse_path("library/alpine/blobs/sha256:abc123").unwrap()
        else {
            panic!("expected blob");
        };
        assert_eq!(image, "library/alpine");
        assert_eq!(digest, "sha256:abc123");

        assert!(parse_path("library/alpine/blobs/md5:abc").is_err());
        assert!(parse_path("library/alpine/tags/list").is_err());
    }

    #[test]
    fn official_images_get_the_library_prefix_only_for_hub() {
        assert_eq!(upstream_image(true, "alpine"), "library/alpine");
        assert_eq!(upstream_image(true, "grafana/grafana"), "grafana/grafana");
        assert_eq!(upstream_image(false, "alpine"), "alpine");
    }
}
