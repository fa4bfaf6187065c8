//! The pull-through cache engine and its stream fan-out.

pub mod engine;
pub mod tee;

pub use engine::{Cache, Hit, Miss, ServeOptions, ServeOutcome};

use amargo_domain::stream::ByteStream;

/// What an upstream-fetch hook hands back on success: the body stream plus
/// the response metadata the adapter cares about.
pub struct UpstreamFetch {
    pub stream: ByteStream,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// `Docker-Content-Digest` when the upstream provides it.
    pub content_digest: Option<String>,
}
