mod api;
mod bluetooth;
mod config;
mod error;
mod models;
mod session;
mod storage;
mod utils;

use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use bluetooth::scanner::BluerRadio;
use bluetooth::transport::Radio;
use config::CollectorConfig;
use session::supervisor::Supervisor;
use storage::RecordStore;

/// Discover the configured devices and ingest from them until shutdown
async fn ingest(
    config: &CollectorConfig,
    store: Arc<RecordStore>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let radio: Arc<dyn Radio> = Arc::new(BluerRadio::new().await?);

    let supervisor = Supervisor::new(
        radio,
        store,
        config.devices.clone(),
        config.session_settings(),
        shutdown,
    );

    let started = supervisor.run(config.scan_duration).await;
    info!("Ingestion finished, {} session(s) ran", started);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match CollectorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    config.log_summary();

    let store = Arc::new(RecordStore::open(&config.data_dir, config.labels()).await?);
    info!("Writing device logs to {}", store.data_dir().display());
    info!("Writing activity labels to {}", store.annotation_log_path().display());

    // Handle Ctrl+C gracefully
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Program terminated by user. Exiting gracefully.");
            shutdown.cancel();
        });
    }

    let listener = TcpListener::bind(&config.http_bind).await?;
    let server = tokio::spawn(api::serve(
        listener,
        Arc::clone(&store),
        shutdown.clone(),
    ));

    if let Err(e) = ingest(&config, store, shutdown.clone()).await {
        error!("Ingestion stopped: {}", e);
    }

    // Keep answering HTTP requests (annotations) until the user stops us
    if !shutdown.is_cancelled() {
        info!("Query surface still running, press Ctrl+C to exit");
    }
    shutdown.cancelled().await;

    match server.await {
        Ok(Ok(())) => info!("HTTP server stopped"),
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    Ok(())
}
