//! TTL eviction: periodic batch scan for expired cache entries with
//! coordinated removal from the object store and the metadata index.
//!
//! Blob deletion is best-effort — a failed delete is logged and the row
//! removal proceeds; the orphaned blob costs storage, not correctness.
//! The pass is re-entrant safe: concurrent passes contend at the metadata
//! layer but cannot corrupt state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use amargo_blobs::Blobs;
use amargo_meta::MetaStore;

pub struct Evictor {
    meta: Arc<MetaStore>,
    blobs: Arc<dyn Blobs>,
    batch_size: u32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub batches: u32,
    pub artifacts_deleted: u64,
    pub orphan_entries_deleted: u64,
    pub blob_delete_failures: u64,
}

impl Evictor {
    pub fn new(meta: Arc<MetaStore>, blobs: Arc<dyn Blobs>, batch_size: u32) -> Self {
        Self {
            meta,
            blobs,
            batch_size: batch_size.max(1),
        }
    }

    /// One full pass: drain expired entries batch by batch until a batch
    /// comes back short.
    pub async fn run_pass(&self) -> PassStats {
        let mut stats = PassStats::default();
        loop {
            let now = Utc::now();
            let entries = match self.meta.expired_entries(now, self.batch_size).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "eviction scan failed, ending pass");
                    break;
                }
            };
            if entries.is_empty() {
                break;
            }
            stats.batches += 1;
            let short_batch = (entries.len() as u32) < self.batch_size;

            let ids: Vec<i64> = entries.iter().map(|e| e.artifact_id).collect();
            let live = match self.meta.artifacts_by_ids(&ids).await {
                Ok(live) => live,
                Err(e) => {
                    tracing::warn!(error = %e, "eviction artifact lookup failed, ending pass");
                    break;
                }
            };

            // Blobs first, then rows: a failed blob delete only orphans the
            // blob until the row goes, never the other way around.
            for (_, storage_key) in &live {
                if let Err(e) = self.blobs.delete(storage_key).await {
                    stats.blob_delete_failures += 1;
                    tracing::warn!(key = %storage_key, error = %e, "blob delete failed");
                }
            }

            let live_ids: Vec<i64> = live.iter().map(|(id, _)| *id).collect();
            match self.meta.delete_artifacts(&live_ids).await {
                Ok(deleted) => stats.artifacts_deleted += deleted,
                Err(e) => {
                    tracing::warn!(error = %e, "eviction bulk delete failed, ending pass");
                    break;
                }
            }

            // Entries whose artifact is already gone get removed directly.
            let live_set: HashSet<i64> = live_ids.iter().copied().collect();
            let orphan_keys: Vec<String> = entries
                .iter()
                .filter(|e| !live_set.contains(&e.artifact_id))
                .map(|e| e.key.clone())
                .collect();
            if !orphan_keys.is_empty() {
                match self.meta.delete_cache_entries(&orphan_keys).await {
                    Ok(removed) => stats.orphan_entries_deleted += removed,
                    Err(e) => tracing::warn!(error = %e, "orphan entry cleanup failed"),
                }
            }

            if short_batch {
                break;
            }
        }

        if stats.artifacts_deleted > 0 || stats.orphan_entries_deleted > 0 {
            tracing::info!(
                batches = stats.batches,
                artifacts = stats.artifacts_deleted,
                orphans = stats.orphan_entries_deleted,
                blob_failures = stats.blob_delete_failures,
                "eviction pass complete"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amargo_artifacts::Artifacts;
    use amargo_domain::model::cache_key;
    use amargo_blobs::fs::FsBlobs;
    use amargo_domain::config::RepositoryConfig;
    use amargo_domain::model::{RepoFormat, RepoKind};
    use bytes::Bytes;
    use std::collections::HashMap;

    async fn fixture() -> (Arc<MetaStore>, Arc<dyn Blobs>, Artifacts, amargo_domain::model::Repository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetaStore::open_in_memory().await.unwrap());
        let blobs: Arc<dyn Blobs> = Arc::new(FsBlobs::new(dir.path()).unwrap());
        let artifacts = Artifacts::new(meta.clone(), blobs.clone());
        let repo = meta
            .upsert_repository(&RepositoryConfig {
                name: "npm".into(),
                format: RepoFormat::Npm,
                kind: RepoKind::Proxy,
                upstream: Some("https://registry.npmjs.org".into()),
                username: None,
                password_env: None,
                ttl_secs: 3600,
                enabled: true,
            })
            .await
            .unwrap();
        (meta, blobs, artifacts, repo, dir)
    }

    fn body(payload: &'static [u8]) -> amargo_domain::stream::ByteStream {
        Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from_static(payload))]))
    }

    #[tokio::test]
    async fn expired_artifacts_are_fully_removed() {
        let (meta, blobs, artifacts, repo, _dir) = fixture().await;

        // Already expired: negative TTL override.
        let info = artifacts
            .store(&repo, "stale", "1.0.0", body(b"old bytes"), "application/octet-stream", HashMap::new(), Some(-60))
            .await
            .unwrap();
        // Still fresh.
        artifacts
            .store(&repo, "fresh", "1.0.0", body(b"new bytes"), "application/octet-stream", HashMap::new(), None)
            .await
            .unwrap();

        let evictor = Evictor::new(meta.clone(), blobs.clone(), 100);
        let stats = evictor.run_pass().await;

        assert_eq!(stats.artifacts_deleted, 1);
        assert!(meta.artifact(repo.id, "stale", "1.0.0").await.unwrap().is_none());
        assert!(meta
            .cache_entry(&cache_key(repo.id, "stale", "1.0.0"))
            .await
            .unwrap()
            .is_none());
        assert!(!blobs.exists(&info.storage_key).await.unwrap());

        // The fresh artifact is untouched.
        assert!(meta.artifact(repo.id, "fresh", "1.0.0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pass_drains_multiple_batches() {
        let (meta, blobs, artifacts, repo, _dir) = fixture().await;
        for i in 0..7 {
            artifacts
                .store(&repo, &format!("pkg{i}"), "1.0.0", body(b"x"), "application/octet-stream", HashMap::new(), Some(-60))
                .await
                .unwrap();
        }

        let evictor = Evictor::new(meta.clone(), blobs, 3);
        let stats = evictor.run_pass().await;
        assert_eq!(stats.artifacts_deleted, 7);
        assert!(stats.batches >= 3);
        assert!(meta.expired_entries(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_store_is_a_quiet_pass() {
        let (meta, blobs, _artifacts, _repo, _dir) = fixture().await;
        let evictor = Evictor::new(meta, blobs, 100);
        assert_eq!(evictor.run_pass().await, PassStats::default());
    }

    #[tokio::test]
    async fn missing_blob_does_not_block_row_removal() {
        let (meta, blobs, artifacts, repo, _dir) = fixture().await;
        let info = artifacts
            .store(&repo, "stale", "1.0.0", body(b"x"), "application/octet-stream", HashMap::new(), Some(-60))
            .await
            .unwrap();
        // Blob vanishes out from under the index.
        blobs.delete(&info.storage_key).await.unwrap();

        let evictor = Evictor::new(meta.clone(), blobs, 100);
        let stats = evictor.run_pass().await;
        // Fs delete is idempotent so this counts as success; the row must
        // be gone either way.
        assert_eq!(stats.artifacts_deleted, 1);
        assert!(meta.artifact(repo.id, "stale", "1.0.0").await.unwrap().is_none());
    }
}
