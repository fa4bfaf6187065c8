//! Filesystem blob backend.
//!
//! Blobs live under a root directory at their key path; content type and
//! upload time ride in a `.meta` JSON sidecar next to each blob. Puts write
//! to a temp file in the target directory and rename into place, which is
//! atomic on a POSIX filesystem.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use amargo_domain::stream::ByteStream;
use amargo_domain::{Error, Result};

use crate::{BlobMeta, Blobs};

const META_SUFFIX: &str = ".meta";
const TMP_PREFIX: &str = ".put-";

/// Process-unique sequence for temp file names.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: u64,
    /// Lower-case hex SHA-256 of the blob, used as the ETag.
    digest: String,
    stored_at: DateTime<Utc>,
}

pub struct FsBlobs {
    root: PathBuf,
}

impl FsBlobs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are derived server-side, but refuse traversal outright.
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(Error::InvalidRequest(format!("bad blob key '{key}'")));
        }
        Ok(self.root.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(META_SUFFIX);
        PathBuf::from(s)
    }
}

#[async_trait]
impl Blobs for FsBlobs {
    async fn put(&self, key: &str, mut body: ByteStream, content_type: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("blob key '{key}' has no parent dir")))?;
        tokio::fs::create_dir_all(dir).await?;

        // Stream into a temp file in the same directory so the final rename
        // stays on one filesystem.
        let tmp_path = dir.join(format!(
            "{TMP_PREFIX}{}-{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let mut file = tokio::fs::File::create(&tmp_path).await?;

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    // Abandon the partial write; the previous blob (if any)
                    // is untouched.
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(Error::Io(e));
                }
            };
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let sidecar = Sidecar {
            content_type: content_type.to_owned(),
            size,
            digest: hex::encode(hasher.finalize()),
            stored_at: Utc::now(),
        };
        let sidecar_json = serde_json::to_vec(&sidecar)?;

        // Blob first, then sidecar: a reader that races the rename sees a
        // complete blob either way.
        tokio::fs::rename(&tmp_path, &path).await?;
        tokio::fs::write(Self::sidecar_path(&path), sidecar_json).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let path = self.blob_path(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn head(&self, key: &str) -> Result<BlobMeta> {
        let path = self.blob_path(key)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(Error::Io(e)),
        };
        let sidecar: Option<Sidecar> = match tokio::fs::read(Self::sidecar_path(&path)).await {
            Ok(raw) => serde_json::from_slice(&raw).ok(),
            Err(_) => None,
        };
        Ok(BlobMeta {
            size: meta.len(),
            content_type: sidecar
                .as_ref()
                .map(|s| s.content_type.clone())
                .unwrap_or_else(|| "application/octet-stream".into()),
            etag: sidecar.as_ref().map(|s| s.digest.clone()),
            last_modified: sidecar.map(|s| s.stored_at),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        for p in [path.clone(), Self::sidecar_path(&path)] {
            match tokio::fs::remove_file(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.blob_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.ends_with(META_SUFFIX) || file_name.starts_with(TMP_PREFIX) {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) {
                    keys.push(key);
                    if keys.len() >= limit {
                        return Ok(keys);
                    }
                }
            }
        }
        Ok(keys)
    }
}
