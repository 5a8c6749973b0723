//! HTTP API server with observability for the record store.
//!
//! Provides by-id read endpoints served through the replication cache,
//! cache administration endpoints, structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use record_store::RecordDatabase;
use replication_cache::CachedRecordStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<D: RecordDatabase> {
    pub store: Arc<CachedRecordStore<D>>,
}

impl<D: RecordDatabase> AppState<D> {
    pub fn new(store: Arc<CachedRecordStore<D>>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<D: RecordDatabase + 'static>(
    state: Arc<AppState<D>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<D>))
        .route("/records", get(routes::records::list::<D>))
        .route("/records/{id}", get(routes::records::get::<D>))
        .route("/cache/status", get(routes::cache::status::<D>))
        .route("/cache/invalidate", post(routes::cache::invalidate::<D>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
