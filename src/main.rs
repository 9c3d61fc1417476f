// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tempstash_config::server::ServiceConfig;
use tempstash_error::{Error, ResultExt};
use tempstash_service::catalog::CatalogService;
use tempstash_service::files_server::{make_router, AppState};
use tempstash_service::ingest::IngestPipeline;
use tempstash_service::reaper::Reaper;
use tempstash_service::url_fetcher::UrlFetcher;
use tempstash_store::store_factory::{blob_store_factory, metadata_store_factory};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for an in-flight cleanup run to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// JSON config file. When omitted the configuration is read from the
    /// environment (MAX_FILE_SIZE_MB, ALLOWED_MIME_TYPES, MAX_TTL_MIN,
    /// CLEANUP_INTERVAL_MINS, DOWNLOAD_BASE_URL, BASE_PATH, ...).
    #[clap(long)]
    config: Option<String>,
}

async fn inner_main(config: ServiceConfig) -> Result<(), Error> {
    let config = Arc::new(config);

    let blob_store = blob_store_factory(&config.blob_store)
        .await
        .err_tip(|| "Failed to build blob store")?;
    let metadata_store = metadata_store_factory(&config.metadata_store, &blob_store)
        .err_tip(|| "Failed to build metadata store")?;

    let catalog = Arc::new(CatalogService::new(
        blob_store.clone(),
        metadata_store.clone(),
    ));
    let ingest = Arc::new(IngestPipeline::new(
        blob_store.clone(),
        metadata_store.clone(),
        config.limits.clone(),
    ));
    let url_fetcher = Arc::new(UrlFetcher::new(
        &config.url_fetch,
        config.limits.max_file_size,
    )?);
    let reaper = Reaper::new(
        catalog.clone(),
        metadata_store,
        blob_store,
        config.cleanup.clone(),
    );

    let periodic_cleanup = reaper.spawn_periodic();
    if periodic_cleanup.is_none() {
        event!(Level::INFO, "Periodic cleanup is disabled");
    }

    let router = make_router(AppState {
        catalog,
        ingest,
        reaper: reaper.clone(),
        url_fetcher,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .err_tip(|| format!("Failed to bind {}", config.listen_address))?;
    event!(
        Level::INFO,
        address = %config.listen_address,
        max_file_size = config.limits.max_file_size,
        "tempstash listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .err_tip(|| "Server error")?;

    // Let an in-flight cleanup run observe shutdown and drain before the
    // stores go away.
    reaper.shutdown(SHUTDOWN_DRAIN_TIMEOUT).await;
    drop(periodic_cleanup);
    event!(Level::INFO, "Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_config(args: &Args) -> Result<ServiceConfig, Error> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .err_tip(|| format!("Failed to read config file {path}"))?;
            serde_json::from_str(&raw).map_err(|e| {
                tempstash_error::make_input_err!("Failed to parse config file {path}: {e}")
            })
        }
        None => ServiceConfig::from_env(),
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .err_tip(|| "Failed to build tokio runtime")?
        .block_on(inner_main(config))
}
