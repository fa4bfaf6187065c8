//! Startup sync: the declarative `[[repositories]]` and `[[groups]]`
//! config sections are the source of truth and get upserted into the
//! metadata store before the server starts taking traffic.

use amargo_domain::config::Config;
use amargo_domain::Result;
use amargo_meta::MetaStore;

pub async fn sync_repositories(meta: &MetaStore, config: &Config) -> Result<()> {
    for repo in &config.repositories {
        let stored = meta.upsert_repository(repo).await?;
        tracing::info!(
            repo = %stored.name,
            format = %stored.format,
            kind = %stored.kind,
            enabled = stored.enabled,
            "repository synced"
        );
    }
    for group in &config.groups {
        meta.upsert_group(group).await?;
        tracing::info!(
            group = %group.name,
            format = %group.format,
            members = group.members.len(),
            "group synced"
        );
    }
    Ok(())
}
