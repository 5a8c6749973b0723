//! Batched database fallback for cache misses.

use common::RecordId;
use record_store::record::decode_row;
use record_store::store::fetch_rows_statement;
use record_store::{
    ObjectReconstructor, Query, RecordDatabase, RecordView, TypeRegistry, materialize,
};

use crate::entry_cache::EntryCache;
use crate::{CacheError, Result};

/// Loads missing records with one statement and writes them through to the
/// cache.
pub struct FallbackFetcher<'a, D: ?Sized, R: ?Sized> {
    pub database: &'a D,
    pub cache: &'a EntryCache,
    pub registry: &'a dyn TypeRegistry,
    pub reconstructor: &'a R,
}

impl<D, R> FallbackFetcher<'_, D, R>
where
    D: RecordDatabase + ?Sized,
    R: ObjectReconstructor + ?Sized,
{
    /// Fetches `missing` in one batch.
    ///
    /// Rows without a decodable id, payload or type are skipped. Rows with a
    /// concrete type are cached whether or not the query admits them.
    /// A database error fails the whole batch and nothing is returned.
    #[tracing::instrument(skip_all, fields(missing = missing.len()))]
    pub async fn fetch(&self, missing: &[RecordId], query: &Query) -> Result<Vec<R::Object>> {
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        metrics::counter!("replication_cache_fallback_queries").increment(1);

        let rows = self
            .database
            .fetch_rows(missing)
            .await
            .map_err(|source| CacheError::QueryExecution {
                statement: fetch_rows_statement(missing),
                query: format!("{query:?}"),
                source,
            })?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            let row_id = row.id;
            let decoded = match decode_row(row) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!(id = ?row_id, error = %e, "skipping undecodable row");
                    continue;
                }
            };

            let id = decoded.id;
            let object = if decoded.type_id.is_zero() {
                materialize(
                    self.registry,
                    self.reconstructor,
                    RecordView::from(&decoded),
                    query,
                )
            } else {
                let entry = self.cache.put(id, decoded.into());
                materialize(self.registry, self.reconstructor, entry.view(id), query)
            };
            objects.extend(object);
        }

        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TypeId;
    use record_store::memory::row;
    use record_store::store::FETCH_ROWS_SQL;
    use record_store::{
        InMemoryRecordDatabase, InMemoryTypeRegistry, ObjectType, RawRow, RecordReconstructor,
    };
    use serde_json::json;

    struct Fixture {
        db: InMemoryRecordDatabase,
        cache: EntryCache,
        registry: InMemoryTypeRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: InMemoryRecordDatabase::new(),
                cache: EntryCache::new(100),
                registry: InMemoryTypeRegistry::new(),
            }
        }

        fn fetcher(&self) -> FallbackFetcher<'_, InMemoryRecordDatabase, RecordReconstructor> {
            FallbackFetcher {
                database: &self.db,
                cache: &self.cache,
                registry: &self.registry,
                reconstructor: &RecordReconstructor,
            }
        }
    }

    #[tokio::test]
    async fn fetches_in_one_statement_and_populates_cache() {
        let fx = Fixture::new();
        let dog = fx
            .registry
            .register(ObjectType::new(TypeId::random(), "Dog"));
        let rex = RecordId::new();
        let fido = RecordId::new();
        fx.db.put_row(row(rex, dog.id, json!({"name": "Rex"}))).await;
        fx.db.put_row(row(fido, dog.id, json!({"name": "Fido"}))).await;

        let records = fx
            .fetcher()
            .fetch(&[rex, fido, RecordId::new()], &Query::new())
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(fx.db.fetch_calls(), 1);
        assert!(fx.cache.contains(&rex));
        assert!(fx.cache.contains(&fido));
    }

    #[tokio::test]
    async fn empty_miss_set_skips_database() {
        let fx = Fixture::new();
        let records = fx.fetcher().fetch(&[], &Query::new()).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(fx.db.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn untyped_rows_are_returned_but_not_cached() {
        let fx = Fixture::new();
        let id = RecordId::new();
        fx.db
            .put_row(RawRow::new(id, TypeId::zero(), br#"{"name":"Loose"}"#.to_vec()))
            .await;

        let records = fx.fetcher().fetch(&[id], &Query::new()).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("name"), Some(&json!("Loose")));
        assert!(!fx.cache.contains(&id));
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped() {
        let fx = Fixture::new();
        let broken = RecordId::new();
        let bad_type = RecordId::new();
        let good = RecordId::new();
        fx.db
            .put_row(RawRow::new(broken, TypeId::random(), b"not json".to_vec()))
            .await;
        fx.db
            .put_row(RawRow::new(
                bad_type,
                TypeId::random(),
                br#"{"_type":"not-a-uuid"}"#.to_vec(),
            ))
            .await;
        fx.db.put_row(row(good, TypeId::random(), json!({}))).await;

        let records = fx
            .fetcher()
            .fetch(&[broken, bad_type, good], &Query::new())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, good);
        assert!(!fx.cache.contains(&broken));
        assert!(!fx.cache.contains(&bad_type));
    }

    #[tokio::test]
    async fn filtered_rows_are_still_cached() {
        let fx = Fixture::new();
        let dog = fx
            .registry
            .register(ObjectType::new(TypeId::random(), "Dog"));
        let rex = RecordId::new();
        fx.db.put_row(row(rex, dog.id, json!({"name": "Rex"}))).await;

        let records = fx
            .fetcher()
            .fetch(&[rex], &Query::from_class("Cat"))
            .await
            .unwrap();

        assert!(records.is_empty());
        assert!(fx.cache.contains(&rex));
    }

    #[tokio::test]
    async fn database_error_carries_statement_and_query() {
        let fx = Fixture::new();
        let id = RecordId::new();
        fx.db.put_row(row(id, TypeId::random(), json!({}))).await;
        fx.db.set_failing(true);

        let err = fx
            .fetcher()
            .fetch(&[id], &Query::from_class("Dog"))
            .await
            .unwrap_err();

        match err {
            CacheError::QueryExecution {
                statement, query, ..
            } => {
                assert!(statement.starts_with(FETCH_ROWS_SQL));
                assert!(statement.contains(&id.to_string()));
                assert!(query.contains("Dog"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.cache.is_empty());
    }
}
