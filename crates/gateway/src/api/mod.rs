//! Protocol adapters: one module per package ecosystem, each mapping its
//! wire surface onto the cache engine plus a format-specific upstream
//! fetch hook.

pub mod docker;
pub mod gomod;
pub mod headers;
pub mod maven;
pub mod npm;
pub mod nuget;
pub mod pypi;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use amargo_domain::{Error, Result};

use crate::state::AppState;

/// Build the full wire surface.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health))
        // npm
        .route("/npm/*path", get(npm::serve_path))
        // PyPI (PEP 503)
        .route("/pypi/simple", get(pypi::serve_index))
        .route("/pypi/simple/", get(pypi::serve_index))
        .route("/pypi/simple/:pkg", get(pypi::serve_project))
        .route("/pypi/simple/:pkg/", get(pypi::serve_project))
        .route("/pypi/packages/*path", get(pypi::serve_package))
        // Docker Registry v2
        .route("/v2/", get(docker::ping))
        .route("/v2/*path", get(docker::serve_path))
        // Go module proxy
        .route("/go/*path", get(gomod::serve_path))
        // Maven
        .route("/maven/*path", get(maven::serve_path))
        // NuGet V3
        .route("/nuget/v3/index.json", get(nuget::service_index))
        .route("/nuget/v3-flatcontainer/*path", get(nuget::serve_flat))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Health probe: process up, database reachable, object store reachable.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.meta.ping().await.is_ok();
    let storage = state.blobs.exists("healthz-probe").await.is_ok();
    let status = if database && storage { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "database": database,
        "storage": storage,
    }))
}

/// `(client_ip, user_agent)` for download recording. The IP comes from
/// `X-Forwarded-For` when a fronting proxy supplies it.
pub(crate) fn client_meta(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned());
    let ua = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    (ip, ua)
}

/// External base URL of this proxy as seen by the client, for surfaces
/// that embed absolute URLs (npm metadata, the NuGet service index).
pub(crate) fn local_base(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// Walk a target's proxy members in priority order fetching a passthrough
/// document: clean not-found falls through, other failures abort — the
/// same policy as the cache engine's upstream pass.
pub(crate) async fn passthrough_buffered(
    state: &AppState,
    target: &str,
    build_path: impl Fn(&amargo_domain::model::Repository) -> String,
    extra_headers: &[(&str, String)],
) -> Result<Option<(Bytes, Option<String>, String)>> {
    for repo in state.cache.proxy_candidates(target).await? {
        let path = build_path(&repo);
        match state
            .upstream
            .fetch_buffered(&repo, &path, extra_headers)
            .await?
        {
            Some((body, content_type)) => {
                return Ok(Some((body, content_type, repo.name)));
            }
            None => continue,
        }
    }
    Ok(None)
}

/// Resolve the configured logical target for a format or fail the request.
pub(crate) fn route_target(state: &AppState, format: amargo_domain::model::RepoFormat) -> Result<String> {
    state
        .config
        .route_for(format)
        .map(ToOwned::to_owned)
        .ok_or(Error::NotFound)
}
