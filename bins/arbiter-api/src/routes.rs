// Route table for the Arbiter API

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

/// Largest accepted request body: 10 MiB of stdin plus 1 MiB of source,
/// with room for base64 expansion.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/languages", get(handlers::languages))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_export))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
