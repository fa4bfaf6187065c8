use std::sync::Arc;

use amargo_artifacts::Artifacts;
use amargo_blobs::Blobs;
use amargo_domain::config::Config;
use amargo_meta::MetaStore;

use crate::cache::Cache;
use crate::upstream::UpstreamClient;

/// Shared application state passed to all adapter handlers.
///
/// Wiring is explicit and visible: `MetaStore` and `Blobs` at the bottom,
/// `Artifacts` over the two, `Cache` over artifacts + group resolution, and
/// the upstream client beside them. No ambient container.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub meta: Arc<MetaStore>,
    pub blobs: Arc<dyn Blobs>,
    pub artifacts: Arc<Artifacts>,
    pub cache: Arc<Cache>,
    pub upstream: Arc<UpstreamClient>,
}
