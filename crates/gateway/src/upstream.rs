//! Shared upstream HTTP client for the protocol adapters.
//!
//! Maps upstream status codes onto the error taxonomy the cache engine's
//! group pass relies on: a clean 404/410 is `Ok(None)` ("try the next
//! member"), 401/403 is `Unauthorized`, anything else non-2xx or a
//! transport failure is `UpstreamUnavailable`. Basic auth is applied for
//! members that carry credentials (password through env indirection), and
//! Docker Hub fetches go through the short-deadline token flow.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::Deserialize;

use amargo_domain::config::UpstreamConfig;
use amargo_domain::model::Repository;
use amargo_domain::{Error, Result};

use crate::cache::UpstreamFetch;

const DOCKER_HUB_AUTH: &str =
    "https://auth.docker.io/token?service=registry.docker.io&scope=repository";

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    request_timeout: Duration,
    token_timeout: Duration,
    /// Docker Hub bearer tokens keyed by image scope.
    docker_tokens: Mutex<HashMap<String, CachedToken>>,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            token_timeout: Duration::from_secs(cfg.token_timeout_secs),
            docker_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch `path` (leading slash) relative to the member's upstream base.
    pub async fn fetch(
        &self,
        repo: &Repository,
        path: &str,
        headers: &[(&str, String)],
    ) -> Result<Option<UpstreamFetch>> {
        let base = repo.upstream_base().ok_or_else(|| {
            Error::Internal(format!("repository '{}' has no upstream", repo.name))
        })?;
        self.fetch_url(repo, &format!("{base}{path}"), headers).await
    }

    /// Fetch an absolute URL on behalf of a member repository.
    pub async fn fetch_url(
        &self,
        repo: &Repository,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Option<UpstreamFetch>> {
        let mut req = self.http.get(url);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        if let (Some(user), Some(password_env)) = (&repo.username, &repo.password_env) {
            match std::env::var(password_env) {
                Ok(password) => req = req.basic_auth(user, Some(password)),
                Err(_) => tracing::warn!(
                    repo = %repo.name,
                    env = %password_env,
                    "upstream password env var not set, fetching unauthenticated"
                ),
            }
        }

        let resp = tokio::time::timeout(self.request_timeout, req.send())
            .await
            .map_err(|_| Error::UpstreamUnavailable(format!("{url}: deadline exceeded")))?
            .map_err(|e| Error::UpstreamUnavailable(format!("{url}: {e}")))?;

        let status = resp.status();
        match status {
            s if s.is_success() => {
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(ToOwned::to_owned);
                let content_digest = resp
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|v| v.to_str().ok())
                    .map(ToOwned::to_owned);
                let content_length = resp.content_length();
                Ok(Some(UpstreamFetch {
                    stream: Box::pin(
                        resp.bytes_stream()
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
                    ),
                    content_type,
                    content_length,
                    content_digest,
                }))
            }
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => Ok(None),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(Error::Unauthorized(format!("{url}: {status}")))
            }
            s => Err(Error::UpstreamUnavailable(format!("{url}: {s}"))),
        }
    }

    /// Fetch and buffer a small document (metadata pages that get rewritten
    /// before serving). Returns `(body, content_type)`.
    pub async fn fetch_buffered(
        &self,
        repo: &Repository,
        path: &str,
        headers: &[(&str, String)],
    ) -> Result<Option<(Bytes, Option<String>)>> {
        let Some(found) = self.fetch(repo, path, headers).await? else {
            return Ok(None);
        };
        let mut stream = found.stream;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(|e| {
                Error::UpstreamUnavailable(format!("{path}: body read: {e}"))
            })?);
        }
        Ok(Some((Bytes::from(buf), found.content_type)))
    }

    /// Whether this member points at Docker Hub and therefore needs the
    /// `library/` normalisation and the token flow.
    pub fn is_docker_hub(repo: &Repository) -> bool {
        repo.upstream_base()
            .is_some_and(|u| u.contains("docker.io"))
    }

    /// Short-lived Docker Hub pull token for `image`, cached by scope. The
    /// acquisition deadline is tight; a slow auth server fails the fetch
    /// rather than stalling the request.
    pub async fn docker_token(&self, image: &str) -> Result<String> {
        {
            let tokens = self.docker_tokens.lock();
            if let Some(cached) = tokens.get(image) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let url = format!("{DOCKER_HUB_AUTH}:{image}:pull");
        let resp = tokio::time::timeout(self.token_timeout, self.http.get(&url).send())
            .await
            .map_err(|_| {
                Error::UpstreamUnavailable(format!("docker hub token for '{image}': deadline exceeded"))
            })?
            .map_err(|e| Error::UpstreamUnavailable(format!("docker hub token: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Unauthorized(format!(
                "docker hub token for '{image}': {}",
                resp.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            #[serde(default)]
            expires_in: Option<u64>,
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("docker hub token body: {e}")))?;

        // Renew 30s early so an in-flight fetch never carries a token that
        // expires mid-request.
        let lifetime = body.expires_in.unwrap_or(300).saturating_sub(30).max(30);
        self.docker_tokens.lock().insert(
            image.to_owned(),
            CachedToken {
                token: body.token.clone(),
                expires_at: Instant::now() + Duration::from_secs(lifetime),
            },
        );
        Ok(body.token)
    }
}
