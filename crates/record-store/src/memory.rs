use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::query::{SortOrder, Sorter, compare_values};
use crate::record::{Attributes, decode_payload};
use crate::{
    Query, RawRow, RecordId, RecordStoreError, Result, TypeId, record::type_id_of,
    store::RecordDatabase,
};

/// In-memory record database for testing.
///
/// Provides the same interface as the PostgreSQL implementation and counts
/// the statements it serves, so callers can assert whether the database
/// was touched.
#[derive(Clone, Default)]
pub struct InMemoryRecordDatabase {
    rows: Arc<RwLock<HashMap<RecordId, RawRow>>>,
    order: Arc<RwLock<Vec<RecordId>>>,
    fetch_calls: Arc<AtomicU64>,
    select_calls: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl InMemoryRecordDatabase {
    /// Creates a new empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a row.
    pub async fn put_row(&self, row: RawRow) {
        let Some(id) = row.id else {
            return;
        };
        let mut rows = self.rows.write().await;
        if rows.insert(id, row).is_none() {
            self.order.write().await.push(id);
        }
    }

    /// Removes a row.
    pub async fn delete_row(&self, id: RecordId) {
        if self.rows.write().await.remove(&id).is_some() {
            self.order.write().await.retain(|other| *other != id);
        }
    }

    /// Returns the number of stored rows.
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Number of batched by-id statements executed.
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of predicate selects executed.
    pub fn select_calls(&self) -> u64 {
        self.select_calls.load(Ordering::SeqCst)
    }

    /// Makes every subsequent statement fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RecordStoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordDatabase for InMemoryRecordDatabase {
    async fn fetch_rows(&self, ids: &[RecordId]) -> Result<Vec<RawRow>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;

        let rows = self.rows.read().await;
        let mut seen = Vec::with_capacity(ids.len());
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if seen.contains(id) {
                continue;
            }
            seen.push(*id);
            if let Some(row) = rows.get(id) {
                result.push(row.clone());
            }
        }
        Ok(result)
    }

    async fn select(&self, query: &Query) -> Result<Vec<RawRow>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;

        let rows = self.rows.read().await;
        let order = self.order.read().await;

        let mut matched = Vec::new();
        for id in order.iter() {
            let Some(row) = rows.get(id) else {
                continue;
            };
            // Rows whose payload does not decode never match a predicate.
            let Ok(values) = decode_payload(&row.data) else {
                continue;
            };
            let type_id = match type_id_of(&values) {
                Ok(t) if !t.is_zero() => t,
                _ => row.type_id,
            };
            let keep = query
                .predicate
                .as_ref()
                .is_none_or(|p| p.matches(*id, type_id, &values));
            if keep {
                matched.push((row.clone(), values));
            }
        }

        if !query.sorters.is_empty() {
            matched.sort_by(|(_, a), (_, b)| compare_by_sorters(a, b, &query.sorters));
        }

        Ok(matched.into_iter().map(|(row, _)| row).collect())
    }

    async fn close(&self) {}
}

fn compare_by_sorters(a: &Attributes, b: &Attributes, sorters: &[Sorter]) -> CmpOrdering {
    for sorter in sorters {
        // Missing values sort last.
        let ordering = match (a.get(&sorter.key), b.get(&sorter.key)) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(CmpOrdering::Equal),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        };
        let ordering = match sorter.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    CmpOrdering::Equal
}

/// Builds a row for tests and fixtures.
pub fn row(id: RecordId, type_id: TypeId, values: serde_json::Value) -> RawRow {
    match values {
        serde_json::Value::Object(map) => RawRow::from_attributes(id, type_id, map),
        other => RawRow::new(id, type_id, other.to_string().into_bytes()),
    }
}
