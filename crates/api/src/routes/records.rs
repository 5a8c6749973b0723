//! By-id record read endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query as QueryParams, State};
use common::RecordId;
use record_store::query::{DISABLE_REPLICATION_CACHE_OPTION, RETURN_ORIGINAL_DATA_OPTION};
use record_store::{Attributes, Query, Record, RecordDatabase};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

/// Restrictions and options shared by the read endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ReadParams {
    /// Comma-separated record ids (list endpoint only).
    pub ids: Option<String>,
    pub class: Option<String>,
    pub group: Option<String>,
    /// Bypass the replication cache.
    #[serde(default)]
    pub fresh: bool,
    /// Include the stored payload as `original_data`.
    #[serde(default)]
    pub original: bool,
}

impl ReadParams {
    fn to_query(&self, ids: Vec<RecordId>) -> Query {
        let mut query = Query::for_ids(ids);
        if let Some(class) = &self.class {
            query = query.object_class(class);
        }
        if let Some(group) = &self.group {
            query = query.group(group);
        }
        if self.fresh {
            query = query.option(DISABLE_REPLICATION_CACHE_OPTION, true);
        }
        if self.original {
            query = query.option(RETURN_ORIGINAL_DATA_OPTION, true);
        }
        query
    }
}

// -- Response types --

#[derive(Serialize)]
pub struct RecordResponse {
    pub id: String,
    pub type_id: String,
    pub values: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_data: Option<String>,
}

impl From<Record> for RecordResponse {
    fn from(record: Record) -> Self {
        Self {
            id: record.id.to_string(),
            type_id: record.type_id.to_string(),
            values: record.values,
            original_data: record
                .original_data
                .map(|data| String::from_utf8_lossy(&data).into_owned()),
        }
    }
}

// -- Handlers --

/// GET /records/{id}: reads one record.
pub async fn get<D: RecordDatabase + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
    QueryParams(params): QueryParams<ReadParams>,
) -> Result<Json<RecordResponse>, ApiError> {
    let record_id = parse_record_id(&id)?;
    let query = params.to_query(vec![record_id]);

    let record = state
        .store
        .read_first(&query)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Record {id} not found")))?;

    Ok(Json(record.into()))
}

/// GET /records?ids=...: reads several records.
pub async fn list<D: RecordDatabase + 'static>(
    State(state): State<Arc<AppState<D>>>,
    QueryParams(params): QueryParams<ReadParams>,
) -> Result<Json<Vec<RecordResponse>>, ApiError> {
    let ids = params
        .ids
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing ids parameter".to_string()))?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_record_id)
        .collect::<Result<Vec<_>, _>>()?;

    let records = state.store.read_all(&params.to_query(ids)).await?;
    Ok(Json(records.into_iter().map(RecordResponse::from).collect()))
}

fn parse_record_id(id: &str) -> Result<RecordId, ApiError> {
    RecordId::parse(id).ok_or_else(|| ApiError::BadRequest(format!("Invalid ID format: {id}")))
}
