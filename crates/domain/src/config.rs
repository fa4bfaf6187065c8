use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::model::{RepoFormat, RepoKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Declarative repository definitions, upserted into the metadata store
    /// at startup.
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    /// Declarative group definitions.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Per-format logical target: which repository or group each wire
    /// surface serves (key = format, value = repository or group name).
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_8080")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Upper bound on in-flight requests (backpressure protection).
    #[serde(default = "d_256")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".into(),
            max_concurrent_requests: 256,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_backend")]
    pub backend: StorageBackend,
    #[serde(default)]
    pub fs: FsStorageConfig,
    #[serde(default)]
    pub s3: S3StorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            fs: FsStorageConfig::default(),
            s3: S3StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsStorageConfig {
    #[serde(default = "d_fs_root")]
    pub root: PathBuf,
}

impl Default for FsStorageConfig {
    fn default() -> Self {
        Self {
            root: d_fs_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3StorageConfig {
    /// S3-compatible endpoint, e.g. `https://s3.amazonaws.com` or a MinIO
    /// address. Required when the backend is `s3`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "d_region")]
    pub region: String,
    /// Env var holding the access key id.
    #[serde(default = "d_access_key_env")]
    pub access_key_env: String,
    /// Env var holding the secret access key.
    #[serde(default = "d_secret_key_env")]
    pub secret_key_env: String,
    /// Use path-style addressing (`endpoint/bucket/key`). Required by most
    /// non-AWS S3 implementations.
    #[serde(default = "d_true")]
    pub path_style: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: d_db_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Eviction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Seconds between eviction passes.
    #[serde(default = "d_3600")]
    pub interval_secs: u64,
    /// Max expired cache entries handled per batch.
    #[serde(default = "d_100")]
    pub batch_size: u32,
    /// Run one pass immediately at startup.
    #[serde(default = "d_true")]
    pub on_startup: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            batch_size: 100,
            on_startup: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream fetching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Per-request deadline for upstream fetches, in seconds.
    #[serde(default = "d_120")]
    pub request_timeout_secs: u64,
    /// Upper bound on background cache population after the caller is gone.
    #[serde(default = "d_300")]
    pub populate_timeout_secs: u64,
    /// Deadline for Docker Hub token acquisition.
    #[serde(default = "d_5")]
    pub token_timeout_secs: u64,
    /// Chunks buffered per tee sink before backpressure kicks in.
    #[serde(default = "d_64")]
    pub tee_buffer_chunks: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            populate_timeout_secs: 300,
            token_timeout_secs: 5,
            tee_buffer_chunks: 64,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repositories and groups
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub format: RepoFormat,
    #[serde(rename = "type")]
    pub kind: RepoKind,
    /// Upstream base URL (proxy repositories only).
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Env var holding the upstream password. Credentials are never inline.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Default cache TTL in seconds.
    #[serde(default = "d_86400")]
    pub ttl_secs: i64,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub format: RepoFormat,
    pub members: Vec<GroupMemberConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberConfig {
    pub repository: String,
    /// Smaller is tried first.
    #[serde(default)]
    pub priority: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Check the declarative configuration for contradictions. Startup
    /// aborts on any `Error`-severity issue.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let err = |issues: &mut Vec<ConfigIssue>, message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            });
        };
        let warn = |issues: &mut Vec<ConfigIssue>, message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message,
            });
        };

        // Repository names must be unique and lower-case.
        let mut seen = std::collections::HashSet::new();
        for repo in &self.repositories {
            if !seen.insert(repo.name.as_str()) {
                err(&mut issues, format!("duplicate repository name '{}'", repo.name));
            }
            if repo.name != repo.name.to_lowercase() {
                err(&mut issues, format!("repository name '{}' must be lower-case", repo.name));
            }
            match repo.kind {
                RepoKind::Proxy => {
                    if repo.upstream.as_deref().map_or(true, str::is_empty) {
                        err(
                            &mut issues,
                            format!("proxy repository '{}' has no upstream URL", repo.name),
                        );
                    }
                }
                RepoKind::Hosted => {
                    if repo.upstream.is_some() {
                        err(
                            &mut issues,
                            format!("hosted repository '{}' must not set an upstream", repo.name),
                        );
                    }
                }
                RepoKind::Group => {
                    err(
                        &mut issues,
                        format!(
                            "repository '{}' declares type=group — define it under [[groups]] instead",
                            repo.name
                        ),
                    );
                }
            }
            if repo.password_env.is_some() && repo.username.is_none() {
                warn(
                    &mut issues,
                    format!("repository '{}' sets password_env without username", repo.name),
                );
            }
            if repo.ttl_secs <= 0 {
                err(&mut issues, format!("repository '{}' has non-positive ttl_secs", repo.name));
            }
        }

        // Group members must exist and share the group's format.
        let repo_by_name: HashMap<&str, &RepositoryConfig> =
            self.repositories.iter().map(|r| (r.name.as_str(), r)).collect();
        for group in &self.groups {
            if repo_by_name.contains_key(group.name.as_str()) {
                err(
                    &mut issues,
                    format!("group '{}' collides with a repository name", group.name),
                );
            }
            if group.members.is_empty() {
                warn(&mut issues, format!("group '{}' has no members", group.name));
            }
            for member in &group.members {
                match repo_by_name.get(member.repository.as_str()) {
                    None => err(
                        &mut issues,
                        format!(
                            "group '{}' references unknown repository '{}'",
                            group.name, member.repository
                        ),
                    ),
                    Some(repo) if repo.format != group.format => err(
                        &mut issues,
                        format!(
                            "group '{}' ({}) member '{}' has format {}",
                            group.name, group.format, member.repository, repo.format
                        ),
                    ),
                    Some(_) => {}
                }
                if member.priority < 0 {
                    err(
                        &mut issues,
                        format!(
                            "group '{}' member '{}' has negative priority",
                            group.name, member.repository
                        ),
                    );
                }
            }
        }

        // Routes must point at a known repository or group of that format.
        let group_by_name: HashMap<&str, &GroupConfig> =
            self.groups.iter().map(|g| (g.name.as_str(), g)).collect();
        for (format, target) in &self.routes {
            let Some(format) = RepoFormat::parse(format) else {
                err(&mut issues, format!("routes: unknown format '{format}'"));
                continue;
            };
            let target_format = group_by_name
                .get(target.as_str())
                .map(|g| g.format)
                .or_else(|| repo_by_name.get(target.as_str()).map(|r| r.format));
            match target_format {
                None => err(
                    &mut issues,
                    format!("routes.{format} references unknown target '{target}'"),
                ),
                Some(tf) if tf != format => err(
                    &mut issues,
                    format!("routes.{format} target '{target}' has format {tf}"),
                ),
                Some(_) => {}
            }
        }

        // Storage backend sanity.
        if self.storage.backend == StorageBackend::S3 {
            if self.storage.s3.endpoint.is_empty() {
                err(&mut issues, "storage.s3.endpoint is required for the s3 backend".into());
            }
            if self.storage.s3.bucket.is_empty() {
                err(&mut issues, "storage.s3.bucket is required for the s3 backend".into());
            }
        }

        issues
    }

    /// The configured logical target for a wire format, if any.
    pub fn route_for(&self, format: RepoFormat) -> Option<&str> {
        self.routes.get(format.as_str()).map(String::as_str)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_8080() -> u16 {
    8080
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_256() -> usize {
    256
}
fn d_backend() -> StorageBackend {
    StorageBackend::Fs
}
fn d_fs_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn d_region() -> String {
    "us-east-1".into()
}
fn d_access_key_env() -> String {
    "AMARGO_S3_ACCESS_KEY".into()
}
fn d_secret_key_env() -> String {
    "AMARGO_S3_SECRET_KEY".into()
}
fn d_db_path() -> PathBuf {
    PathBuf::from("./data/amargo.db")
}
fn d_3600() -> u64 {
    3600
}
fn d_100() -> u32 {
    100
}
fn d_120() -> u64 {
    120
}
fn d_300() -> u64 {
    300
}
fn d_5() -> u64 {
    5
}
fn d_64() -> usize {
    64
}
fn d_86400() -> i64 {
    86_400
}
fn d_true() -> bool {
    true
}
