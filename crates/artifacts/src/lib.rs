//! Artifact service: atomic store-with-checksum over the object store and
//! the metadata index, cache lookup, deletion, and download recording.
//!
//! `store` is the single write path for the pull-through cache: it streams
//! the body into the object store while computing a running SHA-256 and
//! byte count, then upserts the artifact row and its TTL cache entry in one
//! transaction. If the stream or the put fails, no metadata row is written.

pub mod keys;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use amargo_blobs::Blobs;
use amargo_domain::model::{ArtifactInfo, DownloadEvent, Repository};
use amargo_domain::stream::ByteStream;
use amargo_domain::{Error, Result};
use amargo_meta::{MetaStore, NewArtifact};

/// Queue depth for the telemetry worker. Download events beyond this are
/// dropped rather than blocking the serving path.
const TELEMETRY_QUEUE: usize = 1024;

pub struct Artifacts {
    meta: Arc<MetaStore>,
    blobs: Arc<dyn Blobs>,
    telemetry: mpsc::Sender<DownloadEvent>,
}

impl Artifacts {
    /// Build the service and spawn its telemetry worker.
    pub fn new(meta: Arc<MetaStore>, blobs: Arc<dyn Blobs>) -> Self {
        let (tx, mut rx) = mpsc::channel::<DownloadEvent>(TELEMETRY_QUEUE);
        let worker_meta = meta.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Err(e) = worker_meta.record_download(&ev).await {
                    tracing::warn!(error = %e, repo_id = ev.repo_id, "download event write failed");
                }
            }
        });
        Self {
            meta,
            blobs,
            telemetry: tx,
        }
    }

    /// Consume `body` to EOF, persisting it under the deterministic storage
    /// key for `(repo, name, version)`. On success the artifact row and its
    /// cache entry are upserted atomically with
    /// `expires_at = now + (ttl ?: repository ttl)`.
    pub async fn store(
        &self,
        repo: &Repository,
        name: &str,
        version: &str,
        body: ByteStream,
        content_type: &str,
        metadata: HashMap<String, String>,
        ttl_secs: Option<i64>,
    ) -> Result<ArtifactInfo> {
        let storage_key = keys::storage_key(&repo.name, name, version);

        // Tee the digest/size off the chunks as they stream into the store.
        let acc = Arc::new(Mutex::new((Sha256::new(), 0u64)));
        let acc_tap = acc.clone();
        let counted: ByteStream = Box::pin(body.inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                let mut acc = acc_tap.lock();
                acc.0.update(chunk);
                acc.1 += chunk.len() as u64;
            }
        }));

        self.blobs
            .put(&storage_key, counted, content_type)
            .await
            .map_err(|e| Error::Store(format!("object store put '{storage_key}': {e}")))?;

        let (digest, size) = {
            let mut acc = acc.lock();
            let hasher = std::mem::take(&mut acc.0);
            (hex::encode(hasher.finalize()), acc.1)
        };

        let effective_ttl = ttl_secs.unwrap_or(repo.ttl_secs);
        let expires_at = Utc::now() + Duration::seconds(effective_ttl);

        self.meta
            .upsert_artifact_with_entry(NewArtifact {
                repo_id: repo.id,
                name: name.to_owned(),
                version: version.to_owned(),
                storage_key,
                size: size as i64,
                digest,
                content_type: content_type.to_owned(),
                metadata,
                ttl_secs,
                expires_at,
            })
            .await
            .map_err(|e| Error::Store(format!("metadata upsert: {e}")))
    }

    /// Cache lookup. Opens a blob reader on hit and fires a non-blocking
    /// last-accessed touch; never mutates on miss. A metadata row whose
    /// blob has gone missing is treated as a miss.
    pub async fn get(
        &self,
        repo_id: i64,
        name: &str,
        version: &str,
    ) -> Result<Option<(ByteStream, ArtifactInfo)>> {
        let Some(info) = self.meta.artifact(repo_id, name, version).await? else {
            return Ok(None);
        };
        let stream = match self.blobs.get(&info.storage_key).await {
            Ok(s) => s,
            Err(Error::NotFound) => {
                tracing::warn!(
                    key = %info.storage_key,
                    "artifact row present but blob missing; treating as miss"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let meta = self.meta.clone();
        let artifact_id = info.id;
        tokio::spawn(async move {
            if let Err(e) = meta.touch_last_accessed(artifact_id).await {
                tracing::debug!(error = %e, artifact_id, "last-accessed touch failed");
            }
        });

        Ok(Some((stream, info)))
    }

    pub async fn exists(&self, repo_id: i64, name: &str, version: &str) -> Result<bool> {
        Ok(self.meta.artifact(repo_id, name, version).await?.is_some())
    }

    /// Remove blob then metadata. Idempotent.
    pub async fn delete(&self, repo_id: i64, name: &str, version: &str) -> Result<()> {
        let Some(info) = self.meta.artifact(repo_id, name, version).await? else {
            return Ok(());
        };
        self.blobs.delete(&info.storage_key).await?;
        self.meta.delete_artifact(info.id).await
    }

    /// Fire-and-forget download recording. A full queue drops the event.
    pub fn record_download(
        &self,
        repo_id: i64,
        name: &str,
        version: &str,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) {
        let ev = DownloadEvent {
            repo_id,
            name: name.to_owned(),
            version: version.to_owned(),
            at: Utc::now(),
            client_ip,
            user_agent,
        };
        if self.telemetry.try_send(ev).is_err() {
            tracing::debug!(repo_id, "telemetry queue full, dropping download event");
        }
    }
}
