//! HTTP routes

pub mod debug;
pub mod health;
pub mod webpub;

use std::time::Duration;

use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Upper bound on handling a single request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .merge(health::router())
        .nest("/webpub", webpub::router(state.clone()));

    if state.config().server.debug {
        router = router.merge(debug::router());
    }

    router
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
