use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use amargo_artifacts::Artifacts;
use amargo_blobs::fs::FsBlobs;
use amargo_blobs::s3::S3Blobs;
use amargo_blobs::Blobs;
use amargo_domain::config::{Config, ConfigSeverity, StorageBackend};
use amargo_gateway::api;
use amargo_gateway::bootstrap;
use amargo_gateway::cache::Cache;
use amargo_gateway::cli::{Cli, Command, ConfigCommand};
use amargo_gateway::runtime::eviction::Evictor;
use amargo_gateway::state::AppState;
use amargo_gateway::upstream::UpstreamClient;
use amargo_meta::MetaStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = amargo_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = amargo_gateway::cli::load_config(&cli.config)?;
            if !amargo_gateway::cli::config::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = amargo_gateway::cli::load_config(&cli.config)?;
            amargo_gateway::cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("amargo {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,amargo_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the proxy with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("amargo starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Metadata store ───────────────────────────────────────────────
    let meta = Arc::new(
        MetaStore::open(&config.database.path)
            .await
            .context("opening metadata store")?,
    );
    tracing::info!(path = %config.database.path.display(), "metadata store ready");

    // ── Object store ─────────────────────────────────────────────────
    let blobs: Arc<dyn Blobs> = match config.storage.backend {
        StorageBackend::Fs => {
            let store = FsBlobs::new(&config.storage.fs.root).context("initializing fs blob store")?;
            tracing::info!(root = %config.storage.fs.root.display(), "fs blob store ready");
            Arc::new(store)
        }
        StorageBackend::S3 => {
            let store = S3Blobs::from_config(&config.storage.s3).context("initializing S3 blob store")?;
            tracing::info!(
                endpoint = %config.storage.s3.endpoint,
                bucket = %config.storage.s3.bucket,
                "S3 blob store ready"
            );
            Arc::new(store)
        }
    };

    // ── Artifact service ─────────────────────────────────────────────
    let artifacts = Arc::new(Artifacts::new(meta.clone(), blobs.clone()));
    tracing::info!("artifact service ready");

    // ── Upstream client ──────────────────────────────────────────────
    let upstream = Arc::new(UpstreamClient::new(&config.upstream).context("building upstream client")?);
    tracing::info!(
        request_timeout_secs = config.upstream.request_timeout_secs,
        "upstream client ready"
    );

    // ── Cache engine ─────────────────────────────────────────────────
    let cache = Arc::new(Cache::new(meta.clone(), artifacts.clone(), &config.upstream));
    tracing::info!("cache engine ready");

    // ── Repository sync from declarative config ──────────────────────
    bootstrap::sync_repositories(&meta, &config)
        .await
        .context("syncing repositories from config")?;
    tracing::info!(
        repositories = config.repositories.len(),
        groups = config.groups.len(),
        "repository sync complete"
    );

    let state = AppState {
        config: config.clone(),
        meta: meta.clone(),
        blobs: blobs.clone(),
        artifacts,
        cache,
        upstream,
    };

    // ── Eviction loop ────────────────────────────────────────────────
    {
        let evictor = Evictor::new(meta, blobs, config.eviction.batch_size);
        let interval_secs = config.eviction.interval_secs.max(1);
        let on_startup = config.eviction.on_startup;
        tokio::spawn(async move {
            if on_startup {
                evictor.run_pass().await;
            }
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            // The first tick fires immediately; skip it so startup and the
            // interval do not double up.
            interval.tick().await;
            loop {
                interval.tick().await;
                evictor.run_pass().await;
            }
        });
        tracing::info!(interval_secs, "eviction loop started");
    }

    // ── Concurrency limit (backpressure protection) ──────────────────
    let max_concurrent = std::env::var("AMARGO_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(config.server.max_concurrent_requests);
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Router ───────────────────────────────────────────────────────
    let app = api::router()
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "amargo listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}
