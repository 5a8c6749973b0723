//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use record_store::{InMemoryTypeRegistry, PostgresRecordDatabase};
use replication_cache::{CachedRecordStore, ReplicationUpdaterFactory, StoreSettings};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Connect to the database and apply migrations
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    let database = PostgresRecordDatabase::new(pool.clone());
    database
        .run_migrations()
        .await
        .expect("failed to run migrations");

    // 4. Create the store; a failing change feed only disables the cache
    let store = CachedRecordStore::new(Arc::new(database), Arc::new(InMemoryTypeRegistry::new()))
        .with_updater_factory(Arc::new(ReplicationUpdaterFactory::postgres(pool)));
    store.initialize(&StoreSettings::from_env());
    let store = Arc::new(store);

    // 5. Build the application
    let app = api::create_app(api::AppState::new(store.clone()), metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop the updater before releasing connections
    store.close().await;
    tracing::info!("server shut down gracefully");
}
