//! Replication cache administration endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use record_store::RecordDatabase;
use replication_cache::CacheStatus;

use crate::AppState;

/// GET /cache/status: returns cache and updater state.
pub async fn status<D: RecordDatabase + 'static>(
    State(state): State<Arc<AppState<D>>>,
) -> Json<CacheStatus> {
    Json(state.store.cache_status())
}

/// POST /cache/invalidate: clears every cached entry.
pub async fn invalidate<D: RecordDatabase + 'static>(
    State(state): State<Arc<AppState<D>>>,
) -> StatusCode {
    state.store.invalidate_cache();
    StatusCode::NO_CONTENT
}
