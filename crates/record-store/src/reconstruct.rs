//! Building caller-owned objects from stored record data.

use std::sync::Arc;

use crate::object_type::{ObjectType, TypeRegistry, admits};
use crate::query::RETURN_ORIGINAL_DATA_OPTION;
use crate::record::{Attributes, DecodedRow, Record};
use crate::{Query, RecordId, TypeId};

/// Borrowed view of one record's stored state.
///
/// The view may point into shared cache memory; reconstructors must copy
/// whatever they keep.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub id: RecordId,
    pub type_id: TypeId,
    pub payload: &'a Arc<[u8]>,
    pub values: &'a Attributes,
}

impl<'a> From<&'a DecodedRow> for RecordView<'a> {
    fn from(row: &'a DecodedRow) -> Self {
        Self {
            id: row.id,
            type_id: row.type_id,
            payload: &row.payload,
            values: &row.values,
        }
    }
}

/// Builds typed objects from record state.
pub trait ObjectReconstructor: Send + Sync {
    /// The object type handed to callers.
    type Object: Send;

    /// Builds an object, or returns `None` to drop the record from results.
    fn reconstruct(
        &self,
        view: RecordView<'_>,
        object_type: Option<&ObjectType>,
        query: &Query,
    ) -> Option<Self::Object>;
}

/// Default reconstructor producing [`Record`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordReconstructor;

impl ObjectReconstructor for RecordReconstructor {
    type Object = Record;

    fn reconstruct(
        &self,
        view: RecordView<'_>,
        _object_type: Option<&ObjectType>,
        query: &Query,
    ) -> Option<Record> {
        let original_data = query
            .option_flag(RETURN_ORIGINAL_DATA_OPTION)
            .then(|| Arc::clone(view.payload));

        Some(Record {
            id: view.id,
            type_id: view.type_id,
            values: view.values.clone(),
            original_data,
        })
    }
}

/// Resolves the record's type, applies the query's class and group
/// restrictions and reconstructs the object.
pub fn materialize<R>(
    registry: &dyn TypeRegistry,
    reconstructor: &R,
    view: RecordView<'_>,
    query: &Query,
) -> Option<R::Object>
where
    R: ObjectReconstructor + ?Sized,
{
    let object_type = if view.type_id.is_zero() {
        None
    } else {
        registry.resolve(view.type_id)
    };

    if !admits(query, object_type.as_deref()) {
        return None;
    }

    reconstructor.reconstruct(view, object_type.as_deref(), query)
}
