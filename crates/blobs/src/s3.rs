//! S3-compatible blob backend.
//!
//! Talks the S3 REST API directly over the shared HTTP stack with AWS
//! Signature V4 request signing. Bodies are streamed with
//! `UNSIGNED-PAYLOAD` so a put never buffers the artifact. Works against
//! AWS S3, MinIO, and anything else speaking the protocol; path-style
//! addressing is the default since most non-AWS deployments require it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use serde::Deserialize;

use amargo_domain::config::S3StorageConfig;
use amargo_domain::stream::ByteStream;
use amargo_domain::{Error, Result};

use crate::{BlobMeta, Blobs};

mod sig;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub struct S3Blobs {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    path_style: bool,
}

impl S3Blobs {
    /// Build a client from config. Credentials come from the configured
    /// environment variables, never from the config file itself.
    pub fn from_config(cfg: &S3StorageConfig) -> Result<Self> {
        let access_key = std::env::var(&cfg.access_key_env).map_err(|_| {
            Error::Config(format!("S3 access key env var '{}' not set", cfg.access_key_env))
        })?;
        let secret_key = std::env::var(&cfg.secret_key_env).map_err(|_| {
            Error::Config(format!("S3 secret key env var '{}' not set", cfg.secret_key_env))
        })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_owned(),
            bucket: cfg.bucket.clone(),
            region: cfg.region.clone(),
            access_key,
            secret_key,
            path_style: cfg.path_style,
        })
    }

    /// `(url, host, canonical_uri)` for an object key or bucket-level call.
    fn addr(&self, key: Option<&str>, query: &str) -> Result<(String, String, String)> {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .ok_or_else(|| Error::Config(format!("S3 endpoint '{}' has no scheme", self.endpoint)))?
            .to_owned();

        let mut canonical_uri = String::from("/");
        if self.path_style {
            canonical_uri.push_str(&self.bucket);
            canonical_uri.push('/');
        }
        if let Some(key) = key {
            canonical_uri.push_str(&sig::encode_key(key));
        }
        // Virtual-hosted style prepends the bucket to the host instead.
        let (host, canonical_uri) = if self.path_style {
            (host, canonical_uri)
        } else {
            (format!("{}.{host}", self.bucket), canonical_uri)
        };

        let scheme = if self.endpoint.starts_with("https://") { "https" } else { "http" };
        let mut url = format!("{scheme}://{host}{canonical_uri}");
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        Ok((url, host, canonical_uri))
    }

    fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_uri: &str,
        canonical_query: &str,
        content_type: Option<&str>,
    ) -> Vec<(String, String)> {
        sig::sign_request(&sig::SignInput {
            method,
            host,
            canonical_uri,
            canonical_query,
            content_type,
            payload_hash: UNSIGNED_PAYLOAD,
            region: &self.region,
            access_key: &self.access_key,
            secret_key: &self.secret_key,
            now: Utc::now(),
        })
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| Error::Http(format!("S3 request failed: {e}")))
    }
}

#[async_trait]
impl Blobs for S3Blobs {
    async fn put(&self, key: &str, body: ByteStream, content_type: &str) -> Result<()> {
        let (url, host, uri) = self.addr(Some(key), "")?;
        let mut req = self.client.put(&url);
        // The signed header set includes content-type.
        for (name, value) in self.sign("PUT", &host, &uri, "", Some(content_type)) {
            req = req.header(name, value);
        }
        let resp = self.send(req.body(reqwest::Body::wrap_stream(body))).await?;
        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "S3 put '{key}' returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let (url, host, uri) = self.addr(Some(key), "")?;
        let mut req = self.client.get(&url);
        for (name, value) in self.sign("GET", &host, &uri, "", None) {
            req = req.header(name, value);
        }
        let resp = self.send(req).await?;
        match resp.status() {
            s if s.is_success() => Ok(Box::pin(
                resp.bytes_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            )),
            reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound),
            s => Err(Error::Http(format!("S3 get '{key}' returned {s}"))),
        }
    }

    async fn head(&self, key: &str) -> Result<BlobMeta> {
        let (url, host, uri) = self.addr(Some(key), "")?;
        let mut req = self.client.head(&url);
        for (name, value) in self.sign("HEAD", &host, &uri, "", None) {
            req = req.header(name, value);
        }
        let resp = self.send(req).await?;
        match resp.status() {
            s if s.is_success() => {
                let headers = resp.headers();
                let size = headers
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let content_type = headers
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_owned();
                let etag = headers
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_owned());
                let last_modified = headers
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                Ok(BlobMeta {
                    size,
                    content_type,
                    etag,
                    last_modified,
                })
            }
            reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound),
            s => Err(Error::Http(format!("S3 head '{key}' returned {s}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let (url, host, uri) = self.addr(Some(key), "")?;
        let mut req = self.client.delete(&url);
        for (name, value) in self.sign("DELETE", &host, &uri, "", None) {
            req = req.header(name, value);
        }
        let resp = self.send(req).await?;
        // S3 returns 204 for both present and absent keys.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Http(format!(
                "S3 delete '{key}' returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        // Canonical query string must be sorted by parameter name.
        let query = format!(
            "list-type=2&max-keys={}&prefix={}",
            limit,
            sig::encode_component(prefix),
        );
        let (url, host, uri) = self.addr(None, &query)?;
        let mut req = self.client.get(&url);
        for (name, value) in self.sign("GET", &host, &uri, &query, None) {
            req = req.header(name, value);
        }
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("S3 list returned {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Http(format!("S3 list body: {e}")))?;
        let parsed: ListBucketResult = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Http(format!("S3 list XML: {e}")))?;
        Ok(parsed.contents.into_iter().map(|c| c.key).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}
