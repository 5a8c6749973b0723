//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use record_store::RecordDatabase;
use replication_cache::UpdaterState;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Whether by-id reads are currently served from the cache.
    pub replication: &'static str,
}

/// GET /health: returns system health status.
///
/// A disconnected updater is not unhealthy: reads fall back to the database.
pub async fn check<D: RecordDatabase + 'static>(
    State(state): State<Arc<AppState<D>>>,
) -> Json<HealthResponse> {
    let status = state.store.cache_status();
    let replication = match (status.enabled, status.updater_state) {
        (false, _) => "disabled",
        (true, Some(UpdaterState::Connected)) => "connected",
        (true, _) => "degraded",
    };
    Json(HealthResponse {
        status: "ok",
        replication,
    })
}
