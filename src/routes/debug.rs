//! Diagnostics, mounted only when `WEBPUB_DEBUG` is set

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::state::AppState;

const INDEX: &str = "\
/debug/pprof/

Profiles:
  cmdline  command line of the running process
  cache    publication cache occupancy and counters
";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub schemes: Vec<&'static str>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/pprof/cache", get(cache))
}

async fn index() -> &'static str {
    INDEX
}

/// Arguments separated by NUL bytes
async fn cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\0")
}

async fn cache(State(state): State<AppState>) -> Json<CacheReport> {
    Json(CacheReport {
        stats: state.publications().stats(),
        schemes: state.backends().enabled_schemes().iter().map(|s| s.as_str()).collect(),
        started_at: state.started_at(),
        uptime_secs: (Utc::now() - state.started_at()).num_seconds(),
    })
}
