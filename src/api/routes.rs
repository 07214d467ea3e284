//! Route definitions for the query surface.

use crate::api::handlers;
use crate::storage::RecordStore;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn api_routes() -> Router<Arc<RecordStore>> {
    Router::new()
        .route("/data", get(handlers::data))
        .route("/activity", post(handlers::activity))
}
