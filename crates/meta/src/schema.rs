//! Schema applied at startup. Statements are idempotent so every node can
//! run them unconditionally against the shared database.

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL UNIQUE,
    format       TEXT NOT NULL,
    kind         TEXT NOT NULL,
    upstream     TEXT,
    username     TEXT,
    password_env TEXT,
    ttl_secs     INTEGER NOT NULL DEFAULT 86400,
    enabled      INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS groups (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name   TEXT NOT NULL UNIQUE,
    format TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    repo_id  INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    priority INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (group_id, repo_id)
);
CREATE INDEX IF NOT EXISTS idx_group_members_priority
    ON group_members(group_id, priority);

CREATE TABLE IF NOT EXISTS artifacts (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id          INTEGER NOT NULL REFERENCES repositories(id),
    name             TEXT NOT NULL,
    version          TEXT NOT NULL,
    storage_key      TEXT NOT NULL,
    size             INTEGER NOT NULL,
    digest           TEXT NOT NULL,
    content_type     TEXT NOT NULL,
    metadata         TEXT NOT NULL DEFAULT '{}',
    ttl_secs         INTEGER,
    created_at       TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    UNIQUE (repo_id, name, version)
);
CREATE INDEX IF NOT EXISTS idx_artifacts_repo_name     ON artifacts(repo_id, name);
CREATE INDEX IF NOT EXISTS idx_artifacts_last_accessed ON artifacts(last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_name_version  ON artifacts(name, version);

CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    artifact_id INTEGER NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
    repo_id     INTEGER NOT NULL,
    storage_key TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires      ON cache_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_entries_repo_expires ON cache_entries(repo_id, expires_at);

CREATE TABLE IF NOT EXISTS download_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id    INTEGER NOT NULL,
    name       TEXT NOT NULL,
    version    TEXT NOT NULL,
    at         TEXT NOT NULL,
    client_ip  TEXT,
    user_agent TEXT
);
"#;
