//! Per-query decision whether the replication cache may serve a read.

use record_store::Query;
use record_store::query::DISABLE_REPLICATION_CACHE_OPTION;

use crate::updater::Updater;

/// Decides whether the cache is a safe source for a query.
///
/// Built fresh for every read: updater connectivity may change between
/// calls, so the outcome is never remembered.
#[derive(Clone, Copy)]
pub struct CacheGate<'a> {
    enabled: bool,
    updater: Option<&'a dyn Updater>,
}

impl<'a> CacheGate<'a> {
    pub fn new(enabled: bool, updater: Option<&'a dyn Updater>) -> Self {
        Self { enabled, updater }
    }

    /// Returns true if the query may be served from the cache.
    pub fn check(&self, query: &Query) -> bool {
        self.enabled
            && query.cache
            && !query.option_flag(DISABLE_REPLICATION_CACHE_OPTION)
            && self.updater.is_some_and(|u| u.is_connected())
    }
}
