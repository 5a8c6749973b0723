use async_trait::async_trait;

use crate::{Query, RawRow, RecordId, Result};

/// Name of the table holding all records.
pub const RECORD_TABLE: &str = "records";

/// Batched by-id statement; `$1` binds a `UUID[]`.
pub const FETCH_ROWS_SQL: &str = "SELECT type_id, data, id FROM records WHERE id = ANY($1)";

/// Renders the batched by-id statement with its bound ids, for diagnostics.
pub fn fetch_rows_statement(ids: &[RecordId]) -> String {
    let ids = ids
        .iter()
        .map(RecordId::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("{FETCH_ROWS_SQL} -- $1 = '{{{ids}}}'")
}

/// Read access to the table of records.
///
/// This is the non-cached path: every call goes to the backing database.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RecordDatabase: Send + Sync {
    /// Loads the rows for the given ids in a single statement.
    ///
    /// Ids with no stored row are silently absent from the result.
    async fn fetch_rows(&self, ids: &[RecordId]) -> Result<Vec<RawRow>>;

    /// Returns the rows matching the query's predicate, in the query's sort
    /// order.
    ///
    /// Class and group restrictions are not applied here; they depend on
    /// type resolution, which callers perform on the returned rows.
    async fn select(&self, query: &Query) -> Result<Vec<RawRow>>;

    /// Releases the underlying connections.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_lists_every_id() {
        let a = RecordId::new();
        let b = RecordId::new();
        let sql = fetch_rows_statement(&[a, b]);

        assert!(sql.starts_with(FETCH_ROWS_SQL));
        assert!(sql.ends_with(&format!("$1 = '{{{a},{b}}}'")));
    }
}
