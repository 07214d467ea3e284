//! HTTP request handlers for the snapshot and annotation endpoints.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::{error, info};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::AnnotationError;
use crate::models::group_snapshot;
use crate::storage::RecordStore;

/// Error body returned with a 400
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub status: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.body_text())
    }
}

impl From<AnnotationError> for ApiError {
    fn from(err: AnnotationError) -> Self {
        if let AnnotationError::Storage(e) = &err {
            error!("Failed to store activity annotation: {}", e);
        }
        Self::new(err.to_string())
    }
}

/// GET /data - latest reading per device, keyed by device label
pub async fn data(State(store): State<Arc<RecordStore>>) -> Response {
    let snapshot = store.read_snapshot();
    (StatusCode::OK, Json(group_snapshot(&snapshot, store.labels()))).into_response()
}

/// POST /activity - record an activity label for the current session
pub async fn activity(
    State(store): State<Arc<RecordStore>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let annotation = store.append_annotation(&body).await?;

    info!(
        "Activity '{}' from {} {} to {} {}",
        annotation.activity_label,
        annotation.activity_start_date,
        annotation.activity_start_time,
        annotation.activity_end_date,
        annotation.activity_end_time
    );

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "updated_activity": annotation,
        })),
    )
        .into_response())
}
