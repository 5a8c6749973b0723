use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use uuid::Uuid;

use crate::query::{Comparison, Operator, SortOrder};
use crate::record::{ID_KEY, TYPE_KEY};
use crate::store::{FETCH_ROWS_SQL, RECORD_TABLE};
use crate::{
    Predicate, Query, RawRow, RecordId, RecordStoreError, Result, TypeId, store::RecordDatabase,
};

/// Payload column decoded as JSONB for predicate evaluation.
const DATA_JSON: &str = "convert_from(data, 'UTF8')::jsonb";

/// PostgreSQL-backed record database.
#[derive(Clone)]
pub struct PostgresRecordDatabase {
    pool: PgPool,
}

impl PostgresRecordDatabase {
    /// Creates a new PostgreSQL record database.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_raw(row: PgRow) -> Result<RawRow> {
        let id: Option<Uuid> = row.try_get("id")?;
        let type_id: Option<Uuid> = row.try_get("type_id")?;

        Ok(RawRow {
            id: id.map(RecordId::from_uuid),
            type_id: type_id.map(TypeId::from_uuid).unwrap_or_default(),
            data: row.try_get("data")?,
        })
    }
}

#[async_trait]
impl RecordDatabase for PostgresRecordDatabase {
    async fn fetch_rows(&self, ids: &[RecordId]) -> Result<Vec<RawRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = ids.iter().map(RecordId::as_uuid).collect();
        let rows = sqlx::query(FETCH_ROWS_SQL)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;

        tracing::debug!(requested = ids.len(), found = rows.len(), "fetched record rows");
        rows.into_iter().map(Self::row_to_raw).collect()
    }

    async fn select(&self, query: &Query) -> Result<Vec<RawRow>> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT type_id, data, id FROM {RECORD_TABLE}"));

        if let Some(predicate) = &query.predicate {
            builder.push(" WHERE ");
            push_predicate(&mut builder, predicate)?;
        }

        if !query.sorters.is_empty() {
            builder.push(" ORDER BY ");
            for (i, sorter) in query.sorters.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push(format!("({DATA_JSON} -> "));
                builder.push_bind(sorter.key.clone());
                builder.push(")");
                builder.push(match sorter.order {
                    SortOrder::Ascending => " ASC NULLS LAST",
                    SortOrder::Descending => " DESC NULLS LAST",
                });
            }
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        tracing::debug!(rows = rows.len(), "selected record rows");
        rows.into_iter().map(Self::row_to_raw).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn push_predicate(builder: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) -> Result<()> {
    match predicate {
        Predicate::Comparison(c) => push_comparison(builder, c),
        Predicate::And(children) => push_compound(builder, children, " AND ", "TRUE"),
        Predicate::Or(children) => push_compound(builder, children, " OR ", "FALSE"),
        Predicate::Not(inner) => {
            builder.push("NOT (");
            push_predicate(builder, inner)?;
            builder.push(")");
            Ok(())
        }
    }
}

fn push_compound(
    builder: &mut QueryBuilder<'_, Postgres>,
    children: &[Predicate],
    separator: &str,
    empty: &str,
) -> Result<()> {
    if children.is_empty() {
        builder.push(empty);
        return Ok(());
    }

    builder.push("(");
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        push_predicate(builder, child)?;
    }
    builder.push(")");
    Ok(())
}

fn push_comparison(
    builder: &mut QueryBuilder<'_, Postgres>,
    comparison: &Comparison,
) -> Result<()> {
    match comparison.key.as_str() {
        ID_KEY | TYPE_KEY => push_uuid_comparison(builder, comparison),
        _ => push_attribute_comparison(builder, comparison),
    }
}

fn push_uuid_comparison(
    builder: &mut QueryBuilder<'_, Postgres>,
    comparison: &Comparison,
) -> Result<()> {
    let column = if comparison.key == ID_KEY { "id" } else { "type_id" };
    let values: Vec<Uuid> = comparison
        .values
        .iter()
        .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
        .collect();

    match comparison.operator {
        Operator::Equals => {
            builder.push(format!("{column} = ANY("));
            builder.push_bind(values);
            builder.push(")");
        }
        Operator::NotEquals => {
            builder.push(format!("NOT ({column} = ANY("));
            builder.push_bind(values);
            builder.push("))");
        }
        Operator::Missing => {
            builder.push(format!("{column} IS NULL"));
        }
        other => {
            return Err(RecordStoreError::UnsupportedPredicate(format!(
                "{other:?} on {}",
                comparison.key
            )));
        }
    }
    Ok(())
}

fn push_attribute_comparison(
    builder: &mut QueryBuilder<'_, Postgres>,
    comparison: &Comparison,
) -> Result<()> {
    let key = comparison.key.clone();

    match comparison.operator {
        Operator::Missing => {
            builder.push(format!("COALESCE(jsonb_typeof({DATA_JSON} -> "));
            builder.push_bind(key);
            builder.push("), 'null') = 'null'");
        }
        Operator::Equals | Operator::NotEquals => {
            let values = Value::Array(comparison.values.clone());
            if comparison.operator == Operator::NotEquals {
                builder.push("NOT ");
            }
            builder.push(format!("COALESCE(({DATA_JSON} -> "));
            builder.push_bind(key);
            builder.push(") = ANY(SELECT jsonb_array_elements(");
            builder.push_bind(values);
            builder.push(")), FALSE)");
        }
        operator => {
            let sql_operator = match operator {
                Operator::LessThan => "<",
                Operator::LessThanOrEquals => "<=",
                Operator::GreaterThan => ">",
                _ => ">=",
            };
            let [value] = comparison.values.as_slice() else {
                return Err(RecordStoreError::UnsupportedPredicate(format!(
                    "{operator:?} on {} needs exactly one value",
                    comparison.key
                )));
            };
            builder.push(format!("({DATA_JSON} -> "));
            builder.push_bind(key);
            builder.push(format!(") {sql_operator} "));
            builder.push_bind(value.clone());
        }
    }
    Ok(())
}
