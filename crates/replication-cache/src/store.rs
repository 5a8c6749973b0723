//! Read orchestration over the replication cache and the database.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::RecordId;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use record_store::record::decode_row;
use record_store::{
    ObjectReconstructor, Predicate, Query, RawRow, RecordDatabase, RecordReconstructor,
    RecordView, TypeRegistry, materialize,
};
use serde::Serialize;

use crate::entry_cache::{CacheStats, EntryCache};
use crate::feed::FeedPosition;
use crate::fetcher::FallbackFetcher;
use crate::gate::CacheGate;
use crate::settings::StoreSettings;
use crate::singleton::SingletonRegistry;
use crate::updater::{Updater, UpdaterFactory, UpdaterState};
use crate::Result;

/// Replication state swapped as a unit by `initialize` and `close`.
#[derive(Clone, Default)]
struct Replication {
    enabled: bool,
    cache: Option<Arc<EntryCache>>,
    updater: Option<Arc<dyn Updater>>,
}

impl Replication {
    /// Returns the cache if it may serve this query.
    fn eligible_cache(&self, query: &Query) -> Option<Arc<EntryCache>> {
        if CacheGate::new(self.enabled, self.updater.as_deref()).check(query) {
            self.cache.clone()
        } else {
            None
        }
    }
}

/// Snapshot of the replication cache for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub updater_state: Option<UpdaterState>,
    pub connected_since: Option<DateTime<Utc>>,
    pub processed_position: Option<FeedPosition>,
    pub entries: usize,
    pub capacity: usize,
    pub stats: CacheStats,
}

/// Record store whose by-id reads are served from a replication cache
/// whenever it is safe to do so.
///
/// Reads that cannot use the cache go to the [`RecordDatabase`] unchanged.
/// Class and group restrictions are applied the same way on both paths.
pub struct CachedRecordStore<D, R = RecordReconstructor> {
    database: Arc<D>,
    registry: Arc<dyn TypeRegistry>,
    reconstructor: R,
    updater_factory: Option<Arc<dyn UpdaterFactory>>,
    singletons: SingletonRegistry,
    replication: RwLock<Replication>,
}

impl<D: RecordDatabase> CachedRecordStore<D> {
    /// Creates a store producing [`record_store::Record`]s. Caching stays off
    /// until [`initialize`](Self::initialize) enables it.
    pub fn new(database: Arc<D>, registry: Arc<dyn TypeRegistry>) -> Self {
        Self {
            database,
            registry,
            reconstructor: RecordReconstructor,
            updater_factory: None,
            singletons: SingletonRegistry::new(),
            replication: RwLock::new(Replication::default()),
        }
    }
}

impl<D, R> CachedRecordStore<D, R>
where
    D: RecordDatabase,
    R: ObjectReconstructor,
{
    /// Replaces the object reconstructor.
    pub fn with_reconstructor<R2: ObjectReconstructor>(
        self,
        reconstructor: R2,
    ) -> CachedRecordStore<D, R2> {
        CachedRecordStore {
            database: self.database,
            registry: self.registry,
            reconstructor,
            updater_factory: self.updater_factory,
            singletons: self.singletons,
            replication: self.replication,
        }
    }

    /// Sets the factory used to build change-feed updaters.
    pub fn with_updater_factory(mut self, factory: Arc<dyn UpdaterFactory>) -> Self {
        self.updater_factory = Some(factory);
        self
    }

    pub fn database(&self) -> &Arc<D> {
        &self.database
    }

    pub fn singletons(&self) -> &SingletonRegistry {
        &self.singletons
    }

    /// Returns the current updater, if any.
    pub fn updater(&self) -> Option<Arc<dyn Updater>> {
        self.replication.read().updater.clone()
    }

    /// Returns the current cache, if any.
    pub fn cache(&self) -> Option<Arc<EntryCache>> {
        self.replication.read().cache.clone()
    }

    /// Applies settings.
    ///
    /// When caching is enabled and no updater is running, a new cache and a
    /// new updater bound to it are created and started. If that fails the
    /// store keeps serving reads from the database and the failure is only
    /// logged.
    #[tracing::instrument(skip_all, fields(enabled = settings.enable_replication_cache))]
    pub fn initialize(&self, settings: &StoreSettings) {
        let mut replication = self.replication.write();
        replication.enabled = settings.enable_replication_cache;

        if !replication.enabled
            || replication.updater.as_ref().is_some_and(|u| u.is_running())
        {
            return;
        }

        let Some(factory) = &self.updater_factory else {
            tracing::warn!("no change feed configured, replication cache disabled");
            replication.enabled = false;
            return;
        };

        let cache = Arc::new(EntryCache::new(settings.replication_cache_size));
        let started = factory
            .create(Arc::clone(&cache), settings)
            .and_then(|updater| updater.start().map(|()| updater));

        match started {
            Ok(updater) => {
                tracing::info!(
                    capacity = cache.capacity(),
                    "replication cache enabled"
                );
                replication.cache = Some(cache);
                replication.updater = Some(updater);
            }
            Err(e) => {
                tracing::warn!(error = %e, "can't start replication updater, cache disabled");
                replication.enabled = false;
                replication.cache = None;
                replication.updater = None;
            }
        }
    }

    /// Reads every record matching the query.
    ///
    /// Results served from the cache are not in any particular order.
    #[tracing::instrument(skip_all)]
    pub async fn read_all(&self, query: &Query) -> Result<Vec<R::Object>> {
        let replication = self.replication.read().clone();
        if let Some(cache) = replication.eligible_cache(query)
            && let Some(ids) = query.find_id_only_values()
        {
            return self.read_cached(&cache, &ids, query).await;
        }

        self.read_uncached(query).await
    }

    /// Reads the first record matching the query.
    ///
    /// An unsorted query whose predicate is an OR is answered child by
    /// child, in order, stopping at the first child with a result.
    ///
    /// When the ids are derived from the predicate, a cache read that finds
    /// nothing returns `None` without querying the database, since those ids
    /// are the only candidates.
    pub fn read_first<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Option<R::Object>>> {
        async move {
            if query.sorters.is_empty()
                && let Some(Predicate::Or(children)) = &query.predicate
            {
                for child in children {
                    let mut child_query = query.clone();
                    child_query.predicate = Some(child.clone());
                    if let Some(found) = self.read_first(&child_query).await? {
                        return Ok(Some(found));
                    }
                }
                return Ok(None);
            }

            let replication = self.replication.read().clone();
            if let Some(cache) = replication.eligible_cache(query) {
                if let Some(id) = self.singleton_id(query) {
                    let found = self.read_cached(&cache, &[id], query).await?;
                    if let Some(object) = found.into_iter().next() {
                        return Ok(Some(object));
                    }
                    if let Some(class_name) = query.object_class.as_deref() {
                        self.singletons.clear_instance(class_name);
                    }
                } else if let Some(ids) = query.find_id_only_values() {
                    let found = self.read_cached(&cache, &ids, query).await?;
                    return Ok(found.into_iter().next());
                }
            }

            self.read_first_uncached(query).await
        }
        .boxed()
    }

    /// Clears every cached entry.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = self.cache() {
            cache.invalidate_all();
            tracing::info!("replication cache invalidated");
        }
    }

    pub fn cache_status(&self) -> CacheStatus {
        let replication = self.replication.read().clone();
        let updater = replication.updater.as_deref();
        let cache = replication.cache.as_deref();

        CacheStatus {
            enabled: replication.enabled,
            updater_state: updater.map(|u| u.state()),
            connected_since: updater.and_then(|u| u.connected_since()),
            processed_position: updater.and_then(|u| u.processed_position()),
            entries: cache.map_or(0, EntryCache::len),
            capacity: cache.map_or(0, EntryCache::capacity),
            stats: cache.map(EntryCache::stats).unwrap_or_default(),
        }
    }

    /// Stops the updater, then releases the database connections.
    #[tracing::instrument(skip_all)]
    pub async fn close(&self) {
        let updater = {
            let mut replication = self.replication.write();
            replication.enabled = false;
            replication.cache = None;
            replication.updater.take()
        };
        if let Some(updater) = updater {
            updater.stop().await;
        }
        self.database.close().await;
    }

    /// Id of the known instance of a singleton class, for predicate-free
    /// queries on that class.
    fn singleton_id(&self, query: &Query) -> Option<RecordId> {
        if query.predicate.is_some() {
            return None;
        }
        let class_name = query.object_class.as_deref()?;
        if !self.singletons.is_singleton(class_name) {
            return None;
        }
        self.singletons.instance_id(class_name)
    }

    async fn read_cached(
        &self,
        cache: &EntryCache,
        ids: &[RecordId],
        query: &Query,
    ) -> Result<Vec<R::Object>> {
        let mut objects = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();

        for id in ids {
            match cache.get(id) {
                Some(entry) => {
                    metrics::counter!("replication_cache_hits").increment(1);
                    objects.extend(materialize(
                        self.registry.as_ref(),
                        &self.reconstructor,
                        entry.view(*id),
                        query,
                    ));
                }
                None => {
                    metrics::counter!("replication_cache_misses").increment(1);
                    missing.push(*id);
                }
            }
        }

        if !missing.is_empty() {
            let fetcher = FallbackFetcher {
                database: self.database.as_ref(),
                cache,
                registry: self.registry.as_ref(),
                reconstructor: &self.reconstructor,
            };
            objects.extend(fetcher.fetch(&missing, query).await?);
        }

        Ok(objects)
    }

    /// First match from the database. A predicate-free read of a singleton
    /// class remembers the instance it found.
    async fn read_first_uncached(&self, query: &Query) -> Result<Option<R::Object>> {
        for row in self.database.select(query).await? {
            let id = row.id;
            if let Some(object) = self.materialize_row(row, query) {
                if let Some(id) = id {
                    self.remember_singleton(query, id);
                }
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    fn remember_singleton(&self, query: &Query, id: RecordId) {
        if query.predicate.is_some() {
            return;
        }
        if let Some(class_name) = query.object_class.as_deref()
            && self.singletons.is_singleton(class_name)
        {
            self.singletons.set_instance(class_name, id);
        }
    }

    async fn read_uncached(&self, query: &Query) -> Result<Vec<R::Object>> {
        let rows = self.database.select(query).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| self.materialize_row(row, query))
            .collect())
    }

    fn materialize_row(&self, row: RawRow, query: &Query) -> Option<R::Object> {
        let id = row.id;
        match decode_row(row) {
            Ok(decoded) => materialize(
                self.registry.as_ref(),
                &self.reconstructor,
                RecordView::from(&decoded),
                query,
            ),
            Err(e) => {
                tracing::debug!(id = ?id, error = %e, "skipping undecodable row");
                None
            }
        }
    }
}
