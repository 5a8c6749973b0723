//! Replication cache tests against PostgreSQL.
//!
//! These tests use a shared PostgreSQL container.
//! Run with:
//!
//! ```bash
//! cargo test -p replication-cache --test postgres_replication -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use record_store::{
    InMemoryTypeRegistry, ObjectType, PostgresRecordDatabase, Query, RecordId, TypeId,
};
use replication_cache::{
    CacheError, CachedRecordStore, ChangeFeed, PgNotifyFeed, ReplicationUpdaterFactory,
    StoreSettings, UpdaterState,
};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const WAIT: Duration = Duration::from_secs(10);

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_records_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE records")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

async fn upsert(pool: &PgPool, id: RecordId, type_id: TypeId, name: &str) {
    let data = json!({"name": name, "_type": type_id.to_string()}).to_string();
    sqlx::query(
        "INSERT INTO records (id, type_id, data) VALUES ($1, $2, $3)
         ON CONFLICT (id) DO UPDATE SET type_id = EXCLUDED.type_id, data = EXCLUDED.data",
    )
    .bind(id.as_uuid())
    .bind(type_id.as_uuid())
    .bind(data.into_bytes())
    .execute(pool)
    .await
    .unwrap();
}

async fn delete(pool: &PgPool, id: RecordId) {
    sqlx::query("DELETE FROM records WHERE id = $1")
        .bind(id.as_uuid())
        .execute(pool)
        .await
        .unwrap();
}

async fn setup(pool: &PgPool) -> (CachedRecordStore<PostgresRecordDatabase>, TypeId) {
    let registry = Arc::new(InMemoryTypeRegistry::new());
    let dog = registry.register(ObjectType::new(TypeId::random(), "Dog")).id;

    let store = CachedRecordStore::new(
        Arc::new(PostgresRecordDatabase::new(pool.clone())),
        registry,
    )
    .with_updater_factory(Arc::new(ReplicationUpdaterFactory::postgres(pool.clone())));
    store.initialize(&StoreSettings::enabled());

    let updater = store.updater().unwrap();
    tokio::time::timeout(WAIT, async {
        while !updater.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("updater never connected");

    (store, dog)
}

/// Polls until the cached entry for `id` satisfies `check`.
async fn wait_for_cache(
    store: &CachedRecordStore<PostgresRecordDatabase>,
    id: RecordId,
    check: impl Fn(Option<&serde_json::Value>) -> bool,
) {
    let cache = store.cache().unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            let name = cache.get(&id).map(|e| e.values.get("name").cloned());
            if check(name.flatten().as_ref()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache never converged");
}

#[tokio::test]
async fn committed_writes_reach_the_cache() {
    let pool = get_test_pool().await;
    let (store, dog) = setup(&pool).await;

    let id = RecordId::new();
    upsert(&pool, id, dog, "Rex").await;
    wait_for_cache(&store, id, |name| name == Some(&json!("Rex"))).await;

    upsert(&pool, id, dog, "Max").await;
    wait_for_cache(&store, id, |name| name == Some(&json!("Max"))).await;

    let record = store.read_first(&Query::for_ids([id])).await.unwrap().unwrap();
    assert_eq!(record.get("name"), Some(&json!("Max")));

    delete(&pool, id).await;
    let cache = store.cache().unwrap();
    tokio::time::timeout(WAIT, async {
        while cache.contains(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("delete never applied");
    assert!(store.read_first(&Query::for_ids([id])).await.unwrap().is_none());

    store.close().await;
}

#[tokio::test]
async fn miss_is_filled_from_postgres() {
    let pool = get_test_pool().await;
    let (store, dog) = setup(&pool).await;

    let rex = RecordId::new();
    let fido = RecordId::new();
    upsert(&pool, rex, dog, "Rex").await;
    upsert(&pool, fido, dog, "Fido").await;
    store.invalidate_cache();

    let records = store
        .read_all(&Query::from_class("Dog").where_predicate(record_store::Predicate::id_in([
            rex,
            fido,
            RecordId::new(),
        ])))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);

    let cache = store.cache().unwrap();
    assert!(cache.contains(&rex));
    assert!(cache.contains(&fido));

    store.close().await;
}

#[tokio::test]
async fn invalid_channel_fails_open() {
    let pool = get_test_pool().await;
    let feed = PgNotifyFeed::new(pool.clone(), "not a channel");
    assert!(feed.validate().is_err());

    let store = CachedRecordStore::new(
        Arc::new(PostgresRecordDatabase::new(pool.clone())),
        Arc::new(InMemoryTypeRegistry::new()),
    )
    .with_updater_factory(Arc::new(ReplicationUpdaterFactory::postgres(pool.clone())));

    let mut settings = StoreSettings::enabled();
    settings.replication_channel = "not a channel".to_string();
    store.initialize(&settings);
    assert!(!store.cache_status().enabled);

    let id = RecordId::new();
    upsert(&pool, id, TypeId::random(), "Rex").await;
    let records = store.read_all(&Query::for_ids([id])).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn unannounced_channel_is_rejected() {
    let pool = get_test_pool().await;

    let feed = PgNotifyFeed::new(pool.clone(), "other_changes");
    assert!(feed.validate().is_ok());
    assert!(matches!(
        feed.subscribe().await,
        Err(CacheError::Configuration(_))
    ));
    assert!(
        PgNotifyFeed::new(pool.clone(), replication_cache::pg_feed::DEFAULT_CHANNEL)
            .check_channel_announced()
            .await
            .is_ok()
    );

    let store = CachedRecordStore::new(
        Arc::new(PostgresRecordDatabase::new(pool.clone())),
        Arc::new(InMemoryTypeRegistry::new()),
    )
    .with_updater_factory(Arc::new(ReplicationUpdaterFactory::postgres(pool.clone())));

    let mut settings = StoreSettings::enabled();
    settings.replication_channel = "other_changes".to_string();
    store.initialize(&settings);

    let updater = store.updater().unwrap();
    tokio::time::timeout(WAIT, async {
        while updater.state() != UpdaterState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("updater never gave up");

    // Writes stay visible because reads bypass the cache.
    let id = RecordId::new();
    let dog = TypeId::random();
    upsert(&pool, id, dog, "Rex").await;
    store.read_all(&Query::for_ids([id])).await.unwrap();
    upsert(&pool, id, dog, "Max").await;
    let record = store.read_first(&Query::for_ids([id])).await.unwrap().unwrap();
    assert_eq!(record.get("name"), Some(&json!("Max")));

    store.close().await;
}
