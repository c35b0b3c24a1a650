#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tsbridge::config;
use tsbridge::http::server::run_http_server;
use tsbridge::http::state::HttpServerState;
use tsbridge::ingest::IngestPipeline;
use tsbridge::storage::{PostgresStore, SeriesStore};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    config::load_configuration().context("Failed to load configuration")?;
    let config = config::get().context("Failed to get configuration")?;

    // Resolving the memory target is part of startup validation: an
    // unresolvable percentage is fatal here, not at ingest time.
    let pipeline_config = config
        .pipeline_config()
        .context("Invalid pipeline configuration")?;

    info!(
        connection = %config.storage_connection_string,
        "connecting to storage backend"
    );
    let storage: Arc<dyn SeriesStore> = Arc::new(
        PostgresStore::connect(
            &config.storage_connection_string,
            config.storage_max_connections,
            config.storage_acquire_timeout(),
        )
        .await
        .context("Failed to connect to storage backend")?,
    );

    storage
        .create_or_migrate()
        .await
        .context("Failed to create or migrate database schema")?;
    info!("storage backend initialized");

    let pipeline = IngestPipeline::new(storage.clone(), pipeline_config);

    // Exit the program if a panic occurs
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let address = SocketAddr::from((config.endpoint, config.port));
    info!(%address, "starting HTTP server");

    let result = run_http_server(
        HttpServerState {
            pipeline: pipeline.clone(),
            storage,
        },
        address,
    )
    .await;

    pipeline.shutdown().await;

    match result {
        Ok(()) => {
            info!("HTTP server stopped gracefully");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
