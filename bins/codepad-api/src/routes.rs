use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/run", post(handlers::submit_job))
        .route("/api/result", get(handlers::get_result_by_query))
        .route("/api/result/:job_id", get(handlers::get_result))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics))
}
