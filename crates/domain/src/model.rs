//! The repository/artifact model shared by the metadata store, the artifact
//! service, and the cache engine.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Formats and repository kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Package ecosystem a repository speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoFormat {
    Npm,
    Pypi,
    Docker,
    Go,
    Maven,
    Nuget,
    Generic,
}

impl RepoFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoFormat::Npm => "npm",
            RepoFormat::Pypi => "pypi",
            RepoFormat::Docker => "docker",
            RepoFormat::Go => "go",
            RepoFormat::Maven => "maven",
            RepoFormat::Nuget => "nuget",
            RepoFormat::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "npm" => Some(RepoFormat::Npm),
            "pypi" => Some(RepoFormat::Pypi),
            "docker" => Some(RepoFormat::Docker),
            "go" => Some(RepoFormat::Go),
            "maven" => Some(RepoFormat::Maven),
            "nuget" => Some(RepoFormat::Nuget),
            "generic" => Some(RepoFormat::Generic),
            _ => None,
        }
    }
}

impl fmt::Display for RepoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a repository sources its artifacts.
///
/// A `Proxy` pulls from a configured upstream; a `Hosted` repository holds
/// only what was stored into it; a `Group` is a virtual repository resolved
/// through its members and never holds artifacts itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Hosted,
    Proxy,
    Group,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::Hosted => "hosted",
            RepoKind::Proxy => "proxy",
            RepoKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hosted" => Some(RepoKind::Hosted),
            "proxy" => Some(RepoKind::Proxy),
            "group" => Some(RepoKind::Group),
            _ => None,
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named, typed, single-format artifact source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    /// Globally unique, lower-case, stable.
    pub name: String,
    pub format: RepoFormat,
    pub kind: RepoKind,
    /// Upstream base URL. Present iff `kind == Proxy`.
    pub upstream: Option<String>,
    /// Basic-auth user for the upstream, if it needs credentials.
    pub username: Option<String>,
    /// Name of the environment variable holding the upstream password.
    pub password_env: Option<String>,
    /// Default TTL for cache entries in this repository, in seconds.
    pub ttl_secs: i64,
    pub enabled: bool,
}

impl Repository {
    /// True for members eligible for the upstream-fetch pass.
    pub fn is_proxy(&self) -> bool {
        self.kind == RepoKind::Proxy
            && self.upstream.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> Option<&str> {
        self.upstream.as_deref().map(|u| u.trim_end_matches('/'))
    }
}

/// A `(repository, priority)` pair resolved from a group.
///
/// Smaller priority is tried first; ties break by repository name ascending
/// so resolution order is deterministic.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub repository: Repository,
    pub priority: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Metadata for a stored blob. Identity is `(repository, name, version)`;
/// upserts replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub id: i64,
    pub repo_id: i64,
    pub name: String,
    pub version: String,
    /// Object-store path, deterministic from `(repo name, name, version)`.
    pub storage_key: String,
    /// Size of the stored bytes. 64-bit; never negative.
    pub size: i64,
    /// Lower-case hex SHA-256 of the stored bytes. Exposed as the ETag.
    pub digest: String,
    pub content_type: String,
    /// Free-form adapter-supplied metadata (filename, source repo, ...).
    pub metadata: HashMap<String, String>,
    /// Per-artifact TTL override in seconds, if any.
    pub ttl_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// The TTL stamp on a stored artifact. Exactly one per artifact; removed by
/// cascade when the artifact row goes.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// `"<repo-id>:<name>:<version>"`.
    pub key: String,
    pub artifact_id: i64,
    pub repo_id: i64,
    pub storage_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Build the cache-entry key for an artifact identity.
pub fn cache_key(repo_id: i64, name: &str, version: &str) -> String {
    format!("{repo_id}:{name}:{version}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Download events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only audit row. Never read on the serving path; writes may be
/// dropped under pressure.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub repo_id: i64,
    pub name: String,
    pub version: String,
    pub at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}
