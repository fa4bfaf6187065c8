//! Object-store adapter: a flat key→blob store.
//!
//! Two backends satisfy the same [`Blobs`] contract: any S3-compatible
//! service ([`s3::S3Blobs`]) and a local directory ([`fs::FsBlobs`], the
//! default for development and tests). Puts are atomic — a reader observing
//! a key sees either the full new blob or the previous state, never a
//! partial write. The adapter does not retry; failures surface as domain
//! errors and are retriable at the caller's discretion.

pub mod fs;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use amargo_domain::stream::ByteStream;
use amargo_domain::Result;

/// Metadata returned by [`Blobs::head`].
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub size: u64,
    pub content_type: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Raw blob I/O by opaque key.
#[async_trait]
pub trait Blobs: Send + Sync {
    /// Consume `body` to end-of-stream and store it under `key`, replacing
    /// any previous blob atomically.
    async fn put(&self, key: &str, body: ByteStream, content_type: &str) -> Result<()>;

    /// Open a reader for the blob. Fails with `NotFound` if absent.
    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Blob metadata without the body. Fails with `NotFound` if absent.
    async fn head(&self, key: &str) -> Result<BlobMeta>;

    /// Remove the blob. Idempotent — deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, at most `limit`, in unspecified order.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;
}
