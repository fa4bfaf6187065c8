use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, QueryBuilder, Row};

use amargo_domain::config::{GroupConfig, RepositoryConfig};
use amargo_domain::model::{
    cache_key, ArtifactInfo, CacheEntry, DownloadEvent, GroupMember, RepoFormat, RepoKind,
    Repository,
};
use amargo_domain::{Error, Result};

use crate::schema::SCHEMA;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MetaStore {
    pool: SqlitePool,
}

/// Restrict which group members a resolution returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberFilter {
    All,
    /// Only proxy members with a non-empty upstream — the candidates for
    /// the upstream-fetch pass.
    ProxyOnly,
}

/// Input for the atomic artifact + cache-entry upsert.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub repo_id: i64,
    pub name: String,
    pub version: String,
    pub storage_key: String,
    pub size: i64,
    pub digest: String,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    pub ttl_secs: Option<i64>,
    pub expires_at: DateTime<Utc>,
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

impl MetaStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. Capped at one connection: every SQLite
    /// `:memory:` connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(":memory:")
            .map_err(db_err)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ── Repositories ───────────────────────────────────────────────

    pub async fn upsert_repository(&self, cfg: &RepositoryConfig) -> Result<Repository> {
        sqlx::query(
            r#"INSERT INTO repositories (name, format, kind, upstream, username, password_env, ttl_secs, enabled)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                   format = excluded.format,
                   kind = excluded.kind,
                   upstream = excluded.upstream,
                   username = excluded.username,
                   password_env = excluded.password_env,
                   ttl_secs = excluded.ttl_secs,
                   enabled = excluded.enabled"#,
        )
        .bind(&cfg.name)
        .bind(cfg.format.as_str())
        .bind(cfg.kind.as_str())
        .bind(&cfg.upstream)
        .bind(&cfg.username)
        .bind(&cfg.password_env)
        .bind(cfg.ttl_secs)
        .bind(cfg.enabled)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.repository_by_name(&cfg.name)
            .await?
            .ok_or_else(|| Error::Internal(format!("repository '{}' vanished after upsert", cfg.name)))
    }

    pub async fn repository_by_name(&self, name: &str) -> Result<Option<Repository>> {
        let row: Option<RepoRow> = sqlx::query_as(
            "SELECT id, name, format, kind, upstream, username, password_env, ttl_secs, enabled
             FROM repositories WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(RepoRow::into_domain).transpose()
    }

    pub async fn repository_by_id(&self, id: i64) -> Result<Option<Repository>> {
        let row: Option<RepoRow> = sqlx::query_as(
            "SELECT id, name, format, kind, upstream, username, password_env, ttl_secs, enabled
             FROM repositories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(RepoRow::into_domain).transpose()
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows: Vec<RepoRow> = sqlx::query_as(
            "SELECT id, name, format, kind, upstream, username, password_env, ttl_secs, enabled
             FROM repositories ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(RepoRow::into_domain).collect()
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Upsert a group and replace its member set. Member repositories must
    /// already exist.
    pub async fn upsert_group(&self, cfg: &GroupConfig) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO groups (name, format) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET format = excluded.format",
        )
        .bind(&cfg.name)
        .bind(cfg.format.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let group_id: i64 = sqlx::query("SELECT id FROM groups WHERE name = ?")
            .bind(&cfg.name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get(0);

        sqlx::query("DELETE FROM group_members WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for member in &cfg.members {
            let repo_id: Option<i64> = sqlx::query("SELECT id FROM repositories WHERE name = ?")
                .bind(&member.repository)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .map(|row| row.get(0));
            let repo_id = repo_id.ok_or_else(|| {
                Error::Config(format!(
                    "group '{}' references unknown repository '{}'",
                    cfg.name, member.repository
                ))
            })?;
            sqlx::query(
                "INSERT INTO group_members (group_id, repo_id, priority) VALUES (?, ?, ?)",
            )
            .bind(group_id)
            .bind(repo_id)
            .bind(member.priority)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    pub async fn group_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM groups WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// Members of a group sorted by `(priority ASC, repository name ASC)` —
    /// the resolution order is semantic, not a performance hint. Disabled
    /// repositories are never returned.
    pub async fn group_members(
        &self,
        group_name: &str,
        filter: MemberFilter,
    ) -> Result<Vec<GroupMember>> {
        let base = r#"SELECT r.id, r.name, r.format, r.kind, r.upstream, r.username,
                             r.password_env, r.ttl_secs, r.enabled, gm.priority
                      FROM groups g
                      JOIN group_members gm ON gm.group_id = g.id
                      JOIN repositories r ON r.id = gm.repo_id
                      WHERE g.name = ? AND r.enabled = 1"#;
        let sql = match filter {
            MemberFilter::All => format!("{base} ORDER BY gm.priority ASC, r.name ASC"),
            MemberFilter::ProxyOnly => format!(
                "{base} AND r.kind = 'proxy' AND COALESCE(r.upstream, '') != ''
                 ORDER BY gm.priority ASC, r.name ASC"
            ),
        };
        let rows: Vec<MemberRow> = sqlx::query_as(&sql)
            .bind(group_name)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(GroupMember {
                    priority: row.priority,
                    repository: row.repo.into_domain()?,
                })
            })
            .collect()
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Atomically insert-or-replace the artifact row and its cache entry.
    pub async fn upsert_artifact_with_entry(&self, new: NewArtifact) -> Result<ArtifactInfo> {
        let now = Utc::now();
        let metadata_json = serde_json::to_string(&new.metadata)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"INSERT INTO artifacts
                   (repo_id, name, version, storage_key, size, digest, content_type,
                    metadata, ttl_secs, created_at, last_accessed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(repo_id, name, version) DO UPDATE SET
                   storage_key = excluded.storage_key,
                   size = excluded.size,
                   digest = excluded.digest,
                   content_type = excluded.content_type,
                   metadata = excluded.metadata,
                   ttl_secs = excluded.ttl_secs,
                   created_at = excluded.created_at,
                   last_accessed_at = excluded.last_accessed_at"#,
        )
        .bind(new.repo_id)
        .bind(&new.name)
        .bind(&new.version)
        .bind(&new.storage_key)
        .bind(new.size)
        .bind(&new.digest)
        .bind(&new.content_type)
        .bind(&metadata_json)
        .bind(new.ttl_secs)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let artifact_id: i64 =
            sqlx::query("SELECT id FROM artifacts WHERE repo_id = ? AND name = ? AND version = ?")
                .bind(new.repo_id)
                .bind(&new.name)
                .bind(&new.version)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?
                .get(0);

        sqlx::query(
            "INSERT OR REPLACE INTO cache_entries (key, artifact_id, repo_id, storage_key, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cache_key(new.repo_id, &new.name, &new.version))
        .bind(artifact_id)
        .bind(new.repo_id)
        .bind(&new.storage_key)
        .bind(new.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(ArtifactInfo {
            id: artifact_id,
            repo_id: new.repo_id,
            name: new.name,
            version: new.version,
            storage_key: new.storage_key,
            size: new.size,
            digest: new.digest,
            content_type: new.content_type,
            metadata: new.metadata,
            ttl_secs: new.ttl_secs,
            created_at: now,
            last_accessed_at: now,
        })
    }

    pub async fn artifact(
        &self,
        repo_id: i64,
        name: &str,
        version: &str,
    ) -> Result<Option<ArtifactInfo>> {
        let row: Option<ArtifactRow> = sqlx::query_as(
            "SELECT id, repo_id, name, version, storage_key, size, digest, content_type,
                    metadata, ttl_secs, created_at, last_accessed_at
             FROM artifacts WHERE repo_id = ? AND name = ? AND version = ?",
        )
        .bind(repo_id)
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(ArtifactRow::into_domain).transpose()
    }

    /// Bump `last_accessed_at`. No-ops if the artifact was deleted in the
    /// meantime (the serving path races the eviction loop by design).
    pub async fn touch_last_accessed(&self, artifact_id: i64) -> Result<()> {
        sqlx::query("UPDATE artifacts SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(artifact_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_artifact(&self, artifact_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(artifact_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// `(id, storage_key)` for each id that still has a row.
    pub async fn artifacts_by_ids(&self, ids: &[i64]) -> Result<Vec<(i64, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new("SELECT id, storage_key FROM artifacts WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id);
        }
        qb.push(")");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    /// Bulk delete; cascades remove the cache entries.
    pub async fn delete_artifacts(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new("DELETE FROM artifacts WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id);
        }
        qb.push(")");
        let result = qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    // ── Cache entries ──────────────────────────────────────────────

    /// Expired entries, oldest first, bounded to `limit`.
    pub async fn expired_entries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CacheEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT key, artifact_id, repo_id, storage_key, expires_at
             FROM cache_entries WHERE expires_at < ?
             ORDER BY expires_at ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(EntryRow::into_domain).collect())
    }

    /// Direct removal for entries whose artifact is already gone.
    pub async fn delete_cache_entries(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new("DELETE FROM cache_entries WHERE key IN (");
        let mut sep = qb.separated(", ");
        for key in keys {
            sep.push_bind(key);
        }
        qb.push(")");
        let result = qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    pub async fn cache_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, artifact_id, repo_id, storage_key, expires_at
             FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(EntryRow::into_domain))
    }

    // ── Download events ────────────────────────────────────────────

    pub async fn record_download(&self, ev: &DownloadEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO download_events (repo_id, name, version, at, client_ip, user_agent)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ev.repo_id)
        .bind(&ev.name)
        .bind(&ev.version)
        .bind(ev.at)
        .bind(&ev.client_ip)
        .bind(&ev.user_agent)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn download_event_count(&self, repo_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM download_events WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get(0))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(FromRow)]
struct RepoRow {
    id: i64,
    name: String,
    format: String,
    kind: String,
    upstream: Option<String>,
    username: Option<String>,
    password_env: Option<String>,
    ttl_secs: i64,
    enabled: bool,
}

impl RepoRow {
    fn into_domain(self) -> Result<Repository> {
        let format = RepoFormat::parse(&self.format)
            .ok_or_else(|| Error::Internal(format!("repository '{}' has unknown format '{}'", self.name, self.format)))?;
        let kind = RepoKind::parse(&self.kind)
            .ok_or_else(|| Error::Internal(format!("repository '{}' has unknown kind '{}'", self.name, self.kind)))?;
        Ok(Repository {
            id: self.id,
            name: self.name,
            format,
            kind,
            upstream: self.upstream,
            username: self.username,
            password_env: self.password_env,
            ttl_secs: self.ttl_secs,
            enabled: self.enabled,
        })
    }
}

#[derive(FromRow)]
struct MemberRow {
    #[sqlx(flatten)]
    repo: RepoRow,
    priority: i64,
}

#[derive(FromRow)]
struct ArtifactRow {
    id: i64,
    repo_id: i64,
    name: String,
    version: String,
    storage_key: String,
    size: i64,
    digest: String,
    content_type: String,
    metadata: String,
    ttl_secs: Option<i64>,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

impl ArtifactRow {
    fn into_domain(self) -> Result<ArtifactInfo> {
        let metadata: HashMap<String, String> =
            serde_json::from_str(&self.metadata).unwrap_or_default();
        Ok(ArtifactInfo {
            id: self.id,
            repo_id: self.repo_id,
            name: self.name,
            version: self.version,
            storage_key: self.storage_key,
            size: self.size,
            digest: self.digest,
            content_type: self.content_type,
            metadata,
            ttl_secs: self.ttl_secs,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        })
    }
}

#[derive(FromRow)]
struct EntryRow {
    key: String,
    artifact_id: i64,
    repo_id: i64,
    storage_key: String,
    expires_at: DateTime<Utc>,
}

impl EntryRow {
    fn into_domain(self) -> CacheEntry {
        CacheEntry {
            key: self.key,
            artifact_id: self.artifact_id,
            repo_id: self.repo_id,
            storage_key: self.storage_key,
            expires_at: self.expires_at,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn repo_cfg(name: &str, kind: RepoKind, upstream: Option<&str>) -> RepositoryConfig {
        RepositoryConfig {
            name: name.into(),
            format: RepoFormat::Npm,
            kind,
            upstream: upstream.map(Into::into),
            username: None,
            password_env: None,
            ttl_secs: 3600,
            enabled: true,
        }
    }

    fn new_artifact(repo_id: i64, name: &str, version: &str, expires_at: DateTime<Utc>) -> NewArtifact {
        NewArtifact {
            repo_id,
            name: name.into(),
            version: version.into(),
            storage_key: format!("repositories/r/{name}/{version}/artifact"),
            size: 3,
            digest: "abc123".into(),
            content_type: "application/octet-stream".into(),
            metadata: HashMap::new(),
            ttl_secs: None,
            expires_at,
        }
    }

    #[tokio::test]
    async fn repository_upsert_is_idempotent() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let a = store
            .upsert_repository(&repo_cfg("npm", RepoKind::Proxy, Some("https://registry.npmjs.org")))
            .await
            .unwrap();
        let mut cfg = repo_cfg("npm", RepoKind::Proxy, Some("https://mirror.example"));
        cfg.ttl_secs = 60;
        let b = store.upsert_repository(&cfg).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.upstream.as_deref(), Some("https://mirror.example"));
        assert_eq!(b.ttl_secs, 60);
        assert_eq!(store.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_members_order_by_priority_then_name() {
        let store = MetaStore::open_in_memory().await.unwrap();
        for name in ["zeta", "alpha", "mid"] {
            store
                .upsert_repository(&repo_cfg(name, RepoKind::Proxy, Some("https://up.example")))
                .await
                .unwrap();
        }
        store
            .upsert_group(&GroupConfig {
                name: "all".into(),
                format: RepoFormat::Npm,
                members: vec![
                    amargo_domain::config::GroupMemberConfig { repository: "zeta".into(), priority: 1 },
                    amargo_domain::config::GroupMemberConfig { repository: "alpha".into(), priority: 1 },
                    amargo_domain::config::GroupMemberConfig { repository: "mid".into(), priority: 0 },
                ],
            })
            .await
            .unwrap();

        let members = store.group_members("all", MemberFilter::All).await.unwrap();
        let names: Vec<&str> = members.iter().map(|m| m.repository.name.as_str()).collect();
        assert_eq!(names, vec!["mid", "alpha", "zeta"]);
    }

    #[tokio::test]
    async fn proxy_filter_excludes_hosted_members() {
        let store = MetaStore::open_in_memory().await.unwrap();
        store
            .upsert_repository(&repo_cfg("local", RepoKind::Hosted, None))
            .await
            .unwrap();
        store
            .upsert_repository(&repo_cfg("remote", RepoKind::Proxy, Some("https://up.example")))
            .await
            .unwrap();
        store
            .upsert_group(&GroupConfig {
                name: "all".into(),
                format: RepoFormat::Npm,
                members: vec![
                    amargo_domain::config::GroupMemberConfig { repository: "local".into(), priority: 0 },
                    amargo_domain::config::GroupMemberConfig { repository: "remote".into(), priority: 1 },
                ],
            })
            .await
            .unwrap();

        let all = store.group_members("all", MemberFilter::All).await.unwrap();
        assert_eq!(all.len(), 2);
        let proxies = store.group_members("all", MemberFilter::ProxyOnly).await.unwrap();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].repository.name, "remote");
    }

    #[tokio::test]
    async fn artifact_upsert_replaces_and_keeps_one_row() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let repo = store
            .upsert_repository(&repo_cfg("r", RepoKind::Proxy, Some("https://up.example")))
            .await
            .unwrap();
        let expires = Utc::now() + Duration::hours(1);

        let first = store
            .upsert_artifact_with_entry(new_artifact(repo.id, "pkg", "1.0.0", expires))
            .await
            .unwrap();
        let mut replacement = new_artifact(repo.id, "pkg", "1.0.0", expires);
        replacement.digest = "def456".into();
        replacement.size = 99;
        let second = store.upsert_artifact_with_entry(replacement).await.unwrap();

        assert_eq!(first.id, second.id);
        let fetched = store.artifact(repo.id, "pkg", "1.0.0").await.unwrap().unwrap();
        assert_eq!(fetched.digest, "def456");
        assert_eq!(fetched.size, 99);

        let entry = store
            .cache_entry(&cache_key(repo.id, "pkg", "1.0.0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.artifact_id, first.id);
    }

    #[tokio::test]
    async fn artifact_delete_cascades_to_cache_entry() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let repo = store
            .upsert_repository(&repo_cfg("r", RepoKind::Proxy, Some("https://up.example")))
            .await
            .unwrap();
        let info = store
            .upsert_artifact_with_entry(new_artifact(repo.id, "pkg", "1.0.0", Utc::now()))
            .await
            .unwrap();

        store.delete_artifact(info.id).await.unwrap();
        assert!(store.artifact(repo.id, "pkg", "1.0.0").await.unwrap().is_none());
        assert!(store
            .cache_entry(&cache_key(repo.id, "pkg", "1.0.0"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_entries_respect_limit_and_order() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let repo = store
            .upsert_repository(&repo_cfg("r", RepoKind::Proxy, Some("https://up.example")))
            .await
            .unwrap();
        let now = Utc::now();
        for (i, age_hours) in [3, 1, 2].iter().enumerate() {
            store
                .upsert_artifact_with_entry(new_artifact(
                    repo.id,
                    &format!("pkg{i}"),
                    "1.0.0",
                    now - Duration::hours(*age_hours),
                ))
                .await
                .unwrap();
        }
        // One in the future that must not be returned.
        store
            .upsert_artifact_with_entry(new_artifact(repo.id, "fresh", "1.0.0", now + Duration::hours(1)))
            .await
            .unwrap();

        let batch = store.expired_entries(now, 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        // Oldest expiry first.
        assert!(batch[0].expires_at <= batch[1].expires_at);

        let all = store.expired_entries(now, 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn bulk_delete_and_orphan_cleanup() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let repo = store
            .upsert_repository(&repo_cfg("r", RepoKind::Proxy, Some("https://up.example")))
            .await
            .unwrap();
        let now = Utc::now();
        let a = store
            .upsert_artifact_with_entry(new_artifact(repo.id, "a", "1", now - Duration::hours(1)))
            .await
            .unwrap();
        let b = store
            .upsert_artifact_with_entry(new_artifact(repo.id, "b", "1", now - Duration::hours(1)))
            .await
            .unwrap();

        let deleted = store.delete_artifacts(&[a.id, b.id]).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.expired_entries(now, 10).await.unwrap().is_empty());

        let removed = store
            .delete_cache_entries(&[cache_key(repo.id, "a", "1")])
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn download_events_append() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let repo = store
            .upsert_repository(&repo_cfg("r", RepoKind::Proxy, Some("https://up.example")))
            .await
            .unwrap();
        store
            .record_download(&DownloadEvent {
                repo_id: repo.id,
                name: "pkg".into(),
                version: "1.0.0".into(),
                at: Utc::now(),
                client_ip: Some("10.0.0.1".into()),
                user_agent: Some("npm/10".into()),
            })
            .await
            .unwrap();
        assert_eq!(store.download_event_count(repo.id).await.unwrap(), 1);
    }
}
