// Route definitions for the Codepad API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::root))
        .route("/run", post(handlers::run_code))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}
