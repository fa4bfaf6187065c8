//! The composite serve operation: candidate enumeration, the sequential
//! cache-lookup pass, the sequential upstream pass, and tee-and-store.
//!
//! Concurrent identical misses are not coalesced across processes; each
//! racer fetches upstream and the atomic artifact upsert makes the last
//! writer win with self-consistent bytes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use amargo_artifacts::Artifacts;
use amargo_domain::config::UpstreamConfig;
use amargo_domain::model::{ArtifactInfo, GroupMember, Repository};
use amargo_domain::stream::ByteStream;
use amargo_domain::{Error, Result};
use amargo_meta::{MemberFilter, MetaStore};

use super::{tee, UpstreamFetch};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Served from cache.
pub struct Hit {
    pub repo_id: i64,
    pub repo_name: String,
    pub stream: ByteStream,
    pub info: ArtifactInfo,
}

impl std::fmt::Debug for Hit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hit")
            .field("repo_id", &self.repo_id)
            .field("repo_name", &self.repo_name)
            .field("info", &self.info)
            .finish()
    }
}

/// Teed from upstream: `stream` yields the same bytes the cache is
/// ingesting; `info_rx` completes when the background store finishes.
pub struct Miss {
    pub repo_id: i64,
    pub repo_name: String,
    pub stream: ByteStream,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_digest: Option<String>,
    pub info_rx: oneshot::Receiver<Result<ArtifactInfo>>,
}

impl std::fmt::Debug for Miss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Miss")
            .field("repo_id", &self.repo_id)
            .field("repo_name", &self.repo_name)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("content_digest", &self.content_digest)
            .finish()
    }
}

/// Explicit sum-typed outcome so the group-fallthrough policy stays
/// statically obvious; hard errors travel in the surrounding `Result`.
#[derive(Debug)]
pub enum ServeOutcome {
    Hit(Hit),
    Miss(Miss),
    NotFound,
}

/// Store-time attributes supplied by the adapter.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Content type recorded when the upstream response has none.
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    /// Per-artifact TTL override.
    pub ttl_secs: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Cache {
    meta: Arc<MetaStore>,
    artifacts: Arc<Artifacts>,
    tee_buffer: usize,
    populate_timeout: Duration,
}

impl Cache {
    pub fn new(meta: Arc<MetaStore>, artifacts: Arc<Artifacts>, cfg: &UpstreamConfig) -> Self {
        Self {
            meta,
            artifacts,
            tee_buffer: cfg.tee_buffer_chunks,
            populate_timeout: Duration::from_secs(cfg.populate_timeout_secs),
        }
    }

    /// Ordered candidate list for a logical target: the group's members, or
    /// the single repository itself.
    pub async fn candidates(&self, target: &str) -> Result<Vec<GroupMember>> {
        if self.meta.group_exists(target).await? {
            return self.meta.group_members(target, MemberFilter::All).await;
        }
        match self.meta.repository_by_name(target).await? {
            Some(repo) if repo.enabled => Ok(vec![GroupMember {
                repository: repo,
                priority: 0,
            }]),
            Some(_) => Ok(Vec::new()),
            None => Err(Error::Internal(format!(
                "unknown repository or group '{target}'"
            ))),
        }
    }

    /// Proxy-only candidates, for passthrough surfaces that never cache.
    pub async fn proxy_candidates(&self, target: &str) -> Result<Vec<Repository>> {
        Ok(self
            .candidates(target)
            .await?
            .into_iter()
            .map(|m| m.repository)
            .filter(Repository::is_proxy)
            .collect())
    }

    /// Serve `(name, version)` from `target`.
    ///
    /// The lookup pass and the upstream pass both walk candidates strictly
    /// in priority order; the order is semantic. A clean upstream not-found
    /// falls through to the next proxy member; any other upstream failure
    /// aborts the pass so a broken mirror cannot mask correct content.
    pub async fn serve<F, Fut>(
        &self,
        target: &str,
        name: &str,
        version: &str,
        fetch: F,
        opts: ServeOptions,
    ) -> Result<ServeOutcome>
    where
        F: Fn(Repository) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Option<UpstreamFetch>>> + Send,
    {
        let candidates = self.candidates(target).await?;

        // ── Cache-lookup pass ────────────────────────────────────────
        for member in &candidates {
            let repo = &member.repository;
            match self.artifacts.get(repo.id, name, version).await {
                Ok(Some((stream, info))) => {
                    tracing::debug!(repo = %repo.name, name, version, "cache hit");
                    return Ok(ServeOutcome::Hit(Hit {
                        repo_id: repo.id,
                        repo_name: repo.name.clone(),
                        stream,
                        info,
                    }));
                }
                Ok(None) => {}
                // Fail open: a broken lookup is a miss, not an outage.
                Err(e) => {
                    tracing::warn!(repo = %repo.name, name, version, error = %e, "cache lookup failed");
                }
            }
        }

        // ── Upstream pass ────────────────────────────────────────────
        for member in candidates {
            let repo = member.repository;
            if !repo.is_proxy() {
                continue;
            }
            match fetch(repo.clone()).await? {
                None => {
                    tracing::debug!(repo = %repo.name, name, version, "upstream not found, trying next");
                    continue;
                }
                Some(found) => {
                    return Ok(ServeOutcome::Miss(self.tee_and_store(
                        repo, name, version, found, &opts,
                    )));
                }
            }
        }

        Ok(ServeOutcome::NotFound)
    }

    /// Fan the upstream body out to the caller and the store sink. The
    /// caller going away never cancels the store; the populate timeout is
    /// the only bound on background ingestion.
    fn tee_and_store(
        &self,
        repo: Repository,
        name: &str,
        version: &str,
        found: UpstreamFetch,
        opts: &ServeOptions,
    ) -> Miss {
        let (client_stream, store_stream) = tee::split(found.stream, self.tee_buffer);
        let (info_tx, info_rx) = oneshot::channel();

        let artifacts = self.artifacts.clone();
        let store_repo = repo.clone();
        let store_name = name.to_owned();
        let store_version = version.to_owned();
        let store_ct = found
            .content_type
            .clone()
            .unwrap_or_else(|| opts.content_type.clone());
        let metadata = opts.metadata.clone();
        let ttl_secs = opts.ttl_secs;
        let populate_timeout = self.populate_timeout;

        tokio::spawn(async move {
            let stored = tokio::time::timeout(
                populate_timeout,
                artifacts.store(
                    &store_repo,
                    &store_name,
                    &store_version,
                    store_stream,
                    &store_ct,
                    metadata,
                    ttl_secs,
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "cache population of {store_name}@{store_version} exceeded {populate_timeout:?}"
                )))
            });
            if let Err(e) = &stored {
                tracing::warn!(
                    repo = %store_repo.name,
                    name = %store_name,
                    version = %store_version,
                    error = %e,
                    "cache population failed; response already streaming"
                );
            }
            // The receiver may be gone (nobody awaits population).
            let _ = info_tx.send(stored);
        });

        tracing::info!(repo = %repo.name, name, version, "cache miss, teeing from upstream");
        Miss {
            repo_id: repo.id,
            repo_name: repo.name,
            stream: client_stream,
            content_type: found.content_type,
            content_length: found.content_length,
            content_digest: found.content_digest,
            info_rx,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use amargo_blobs::fs::FsBlobs;
    use amargo_blobs::Blobs;
    use amargo_domain::config::{GroupConfig, GroupMemberConfig, RepositoryConfig};
    use amargo_domain::model::{RepoFormat, RepoKind};
    use bytes::Bytes;
    use futures_util::StreamExt;

    struct Fixture {
        cache: Cache,
        meta: Arc<MetaStore>,
        artifacts: Arc<Artifacts>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetaStore::open_in_memory().await.unwrap());
        let blobs: Arc<dyn Blobs> = Arc::new(FsBlobs::new(dir.path()).unwrap());
        let artifacts = Arc::new(Artifacts::new(meta.clone(), blobs));
        let cache = Cache::new(meta.clone(), artifacts.clone(), &UpstreamConfig::default());
        Fixture {
            cache,
            meta,
            artifacts,
            _dir: dir,
        }
    }

    async fn add_proxy(meta: &MetaStore, name: &str) -> Repository {
        meta.upsert_repository(&RepositoryConfig {
            name: name.into(),
            format: RepoFormat::Npm,
            kind: RepoKind::Proxy,
            upstream: Some(format!("https://{name}.example")),
            username: None,
            password_env: None,
            ttl_secs: 3600,
            enabled: true,
        })
        .await
        .unwrap()
    }

    async fn add_group(meta: &MetaStore, name: &str, members: &[(&str, i64)]) {
        meta.upsert_group(&GroupConfig {
            name: name.into(),
            format: RepoFormat::Npm,
            members: members
                .iter()
                .map(|(repo, priority)| GroupMemberConfig {
                    repository: (*repo).into(),
                    priority: *priority,
                })
                .collect(),
        })
        .await
        .unwrap();
    }

    fn upstream_body(bytes: &'static [u8]) -> UpstreamFetch {
        UpstreamFetch {
            stream: Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from_static(bytes))])),
            content_type: Some("application/octet-stream".into()),
            content_length: Some(bytes.len() as u64),
            content_digest: None,
        }
    }

    async fn collect(mut s: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn no_fetch(_repo: Repository) -> impl Future<Output = Result<Option<UpstreamFetch>>> + Send {
        async { panic!("fetch hook must not run when the cache hits") }
    }

    #[tokio::test]
    async fn miss_fetches_tees_and_persists() {
        let fx = fixture().await;
        add_proxy(&fx.meta, "npm-up").await;

        let outcome = fx
            .cache
            .serve(
                "npm-up",
                "express",
                "4.18.2",
                |_repo| async { Ok(Some(upstream_body(b"tarball bytes"))) },
                ServeOptions {
                    content_type: "application/octet-stream".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ServeOutcome::Miss(miss) = outcome else {
            panic!("expected a miss");
        };
        assert_eq!(miss.repo_name, "npm-up");

        // Caller sees the upstream bytes while the store ingests them.
        let delivered = collect(miss.stream).await;
        assert_eq!(delivered, b"tarball bytes");

        let info = miss.info_rx.await.unwrap().unwrap();
        assert_eq!(info.size, 13);

        // A second serve is now a hit with the same bytes.
        let outcome = fx
            .cache
            .serve("npm-up", "express", "4.18.2", no_fetch, ServeOptions::default())
            .await
            .unwrap();
        let ServeOutcome::Hit(hit) = outcome else {
            panic!("expected a hit");
        };
        assert_eq!(hit.repo_name, "npm-up");
        assert_eq!(collect(hit.stream).await, b"tarball bytes");
    }

    #[tokio::test]
    async fn group_lookup_prefers_lower_priority_member() {
        let fx = fixture().await;
        let first = add_proxy(&fx.meta, "mirror-a").await;
        let second = add_proxy(&fx.meta, "mirror-b").await;
        add_group(&fx.meta, "npm-all", &[("mirror-a", 1), ("mirror-b", 2)]).await;

        // Both members hold the artifact; content differs.
        for (repo, payload) in [(&first, &b"from-a"[..]), (&second, &b"from-b"[..])] {
            fx.artifacts
                .store(
                    repo,
                    "pkg",
                    "1.0.0",
                    Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from(payload.to_vec()))])),
                    "application/octet-stream",
                    HashMap::new(),
                    None,
                )
                .await
                .unwrap();
        }

        let outcome = fx
            .cache
            .serve("npm-all", "pkg", "1.0.0", no_fetch, ServeOptions::default())
            .await
            .unwrap();
        let ServeOutcome::Hit(hit) = outcome else {
            panic!("expected a hit");
        };
        assert_eq!(hit.repo_name, "mirror-a");
        assert_eq!(collect(hit.stream).await, b"from-a");
    }

    #[tokio::test]
    async fn upstream_pass_falls_through_on_clean_not_found() {
        let fx = fixture().await;
        add_proxy(&fx.meta, "primary").await;
        let secondary = add_proxy(&fx.meta, "secondary").await;
        add_group(&fx.meta, "npm-all", &[("primary", 1), ("secondary", 2)]).await;

        let outcome = fx
            .cache
            .serve(
                "npm-all",
                "pkg",
                "1.0.0",
                |repo| async move {
                    if repo.name == "primary" {
                        Ok(None)
                    } else {
                        Ok(Some(upstream_body(b"secondary bytes")))
                    }
                },
                ServeOptions {
                    content_type: "application/octet-stream".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ServeOutcome::Miss(miss) = outcome else {
            panic!("expected a miss");
        };
        assert_eq!(miss.repo_name, "secondary");
        assert_eq!(collect(miss.stream).await, b"secondary bytes");

        // Cached against the member that actually served it.
        let info = miss.info_rx.await.unwrap().unwrap();
        assert_eq!(info.repo_id, secondary.id);
    }

    #[tokio::test]
    async fn upstream_failure_aborts_the_pass() {
        let fx = fixture().await;
        add_proxy(&fx.meta, "flaky").await;
        add_proxy(&fx.meta, "healthy").await;
        add_group(&fx.meta, "npm-all", &[("flaky", 1), ("healthy", 2)]).await;

        let err = fx
            .cache
            .serve(
                "npm-all",
                "pkg",
                "1.0.0",
                |repo| async move {
                    if repo.name == "flaky" {
                        Err(Error::UpstreamUnavailable("503 from flaky".into()))
                    } else {
                        panic!("the pass must abort before reaching the second member")
                    }
                },
                ServeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn all_not_found_is_a_clean_not_found() {
        let fx = fixture().await;
        add_proxy(&fx.meta, "a").await;
        add_proxy(&fx.meta, "b").await;
        add_group(&fx.meta, "npm-all", &[("a", 1), ("b", 2)]).await;

        let outcome = fx
            .cache
            .serve("npm-all", "pkg", "1.0.0", |_repo| async { Ok(None) }, ServeOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, ServeOutcome::NotFound));
    }

    #[tokio::test]
    async fn unknown_target_is_an_internal_error() {
        let fx = fixture().await;
        let err = fx
            .cache
            .serve("nope", "pkg", "1.0.0", no_fetch, ServeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn caller_disconnect_still_populates_the_cache() {
        let fx = fixture().await;
        add_proxy(&fx.meta, "npm-up").await;

        // A 4 MiB body in small chunks so the tee is mid-flight when the
        // caller walks away.
        let expected_size: i64 = 4096 * 1024;

        let outcome = fx
            .cache
            .serve(
                "npm-up",
                "big",
                "1.0.0",
                move |_repo| {
                    let body: Vec<std::io::Result<Bytes>> = (0..4096)
                        .map(|i| Ok(Bytes::from(vec![(i % 256) as u8; 1024])))
                        .collect();
                    async move {
                        Ok(Some(UpstreamFetch {
                            stream: Box::pin(futures_util::stream::iter(body)),
                            content_type: None,
                            content_length: None,
                            content_digest: None,
                        }))
                    }
                },
                ServeOptions {
                    content_type: "application/octet-stream".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ServeOutcome::Miss(mut miss) = outcome else {
            panic!("expected a miss");
        };

        // Read one chunk, then disconnect.
        let first = miss.stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1024);
        drop(miss.stream);

        // Background population still completes.
        let info = miss.info_rx.await.unwrap().unwrap();
        assert_eq!(info.size, expected_size);

        let outcome = fx
            .cache
            .serve("npm-up", "big", "1.0.0", no_fetch, ServeOptions::default())
            .await
            .unwrap();
        let ServeOutcome::Hit(hit) = outcome else {
            panic!("expected a hit after disconnect");
        };
        assert_eq!(collect(hit.stream).await.len() as i64, expected_size);
    }
}
