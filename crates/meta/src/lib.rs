//! Metadata store: the relational index of repositories, groups, artifacts,
//! cache entries, and download events, plus group resolution.
//!
//! Backed by SQLite through sqlx (WAL journal, pooled connections,
//! runtime-checked queries). All nodes share one database file; rows are
//! upserted, never merged, and artifact deletion cascades to cache entries
//! at the schema level.

mod schema;
mod store;

pub use store::{MemberFilter, MetaStore, NewArtifact};
