//! Health check endpoint

use axum::{routing::get, Router};

use crate::state::AppState;

/// Always healthy while the process serves requests, whatever the backends say
pub async fn health_check() -> &'static str {
    "OK"
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
