//! Query surface: the latest snapshot and activity annotations over HTTP.
//!
//! - `GET /data` - latest reading per device
//! - `POST /activity` - append an activity label

mod handlers;
mod routes;

use axum::Router;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::storage::RecordStore;

pub fn build_router(store: Arc<RecordStore>) -> Router {
    routes::api_routes()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(store)
}

/// Serve the query surface until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    store: Arc<RecordStore>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server: http://{}", addr);
    }

    axum::serve(listener, build_router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
