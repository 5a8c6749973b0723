use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{RecordId, TypeId};

/// Reserved attribute key holding a record's identifier.
pub const ID_KEY: &str = "_id";

/// Reserved attribute key holding a record's type marker.
pub const TYPE_KEY: &str = "_type";

/// Decoded attribute mapping of a record.
pub type Attributes = Map<String, Value>;

/// One row as returned by `SELECT type_id, data, id FROM records`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// Record identifier, `None` when the stored value could not be decoded.
    pub id: Option<RecordId>,

    /// Type marker column.
    pub type_id: TypeId,

    /// Serialized payload (UTF-8 JSON object).
    pub data: Vec<u8>,
}

impl RawRow {
    /// Creates a row from an id, type and payload.
    pub fn new(id: RecordId, type_id: TypeId, data: Vec<u8>) -> Self {
        Self {
            id: Some(id),
            type_id,
            data,
        }
    }

    /// Creates a row by serializing an attribute mapping, stamping the
    /// reserved `_type` key with the given type.
    pub fn from_attributes(id: RecordId, type_id: TypeId, mut values: Attributes) -> Self {
        values.insert(TYPE_KEY.to_string(), Value::String(type_id.to_string()));
        let data = Value::Object(values).to_string().into_bytes();
        Self::new(id, type_id, data)
    }
}

/// Why a row could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("row has no decodable id")]
    MissingId,

    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("invalid type marker: {0}")]
    InvalidTypeId(String),
}

/// A row whose payload has been decoded.
#[derive(Debug, Clone)]
pub struct DecodedRow {
    pub id: RecordId,
    pub type_id: TypeId,
    pub payload: Arc<[u8]>,
    pub values: Attributes,
}

/// Decodes a serialized payload into an attribute mapping.
pub fn decode_payload(data: &[u8]) -> Result<Attributes, DecodeError> {
    match serde_json::from_slice::<Value>(data)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// Reads the type marker from the reserved `_type` attribute.
///
/// A missing or null attribute yields the zero marker.
pub fn type_id_of(values: &Attributes) -> Result<TypeId, DecodeError> {
    match values.get(TYPE_KEY) {
        None | Some(Value::Null) => Ok(TypeId::zero()),
        Some(Value::String(s)) => Uuid::parse_str(s)
            .map(TypeId::from_uuid)
            .map_err(|_| DecodeError::InvalidTypeId(s.clone())),
        Some(other) => Err(DecodeError::InvalidTypeId(other.to_string())),
    }
}

/// Decodes a raw row, taking the type marker from the payload only.
///
/// The `type_id` column is ignored; a payload without `_type` decodes with
/// the zero marker.
pub fn decode_row(row: RawRow) -> Result<DecodedRow, DecodeError> {
    let id = row.id.ok_or(DecodeError::MissingId)?;
    let values = decode_payload(&row.data)?;
    let type_id = type_id_of(&values)?;

    Ok(DecodedRow {
        id,
        type_id,
        payload: Arc::from(row.data),
        values,
    })
}

/// A record materialized for a caller.
///
/// Built fresh on every read; `values` is owned by the caller and may be
/// mutated freely.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub type_id: TypeId,
    pub values: Attributes,

    /// Raw payload the record was built from, present only when the query
    /// asked for original data.
    pub original_data: Option<Arc<[u8]>>,
}

impl Record {
    /// Returns an attribute value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_payload_requires_object() {
        assert!(decode_payload(br#"{"name": "Rex"}"#).is_ok());
        assert!(matches!(
            decode_payload(b"[1, 2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            decode_payload(b"{not json"),
            Err(DecodeError::Payload(_))
        ));
    }

    #[test]
    fn type_id_of_missing_is_zero() {
        let values = Attributes::new();
        assert!(type_id_of(&values).unwrap().is_zero());
    }

    #[test]
    fn type_id_of_rejects_non_uuid() {
        let mut values = Attributes::new();
        values.insert(TYPE_KEY.to_string(), json!("dog"));
        assert!(matches!(
            type_id_of(&values),
            Err(DecodeError::InvalidTypeId(_))
        ));
    }

    #[test]
    fn from_attributes_stamps_type() {
        let type_id = TypeId::random();
        let row = RawRow::from_attributes(RecordId::new(), type_id, Attributes::new());
        let values = decode_payload(&row.data).unwrap();
        assert_eq!(type_id_of(&values).unwrap(), type_id);
    }

    #[test]
    fn decode_row_ignores_column_type() {
        let id = RecordId::new();
        let row = RawRow::new(id, TypeId::random(), br#"{"name": "Rex"}"#.to_vec());

        let decoded = decode_row(row).unwrap();
        assert_eq!(decoded.id, id);
        assert!(decoded.type_id.is_zero());
        assert_eq!(decoded.values["name"], json!("Rex"));
    }

    #[test]
    fn decode_row_takes_payload_type() {
        let payload_type = TypeId::random();
        let data = json!({"_type": payload_type.to_string()}).to_string();
        let row = RawRow::new(RecordId::new(), TypeId::random(), data.into_bytes());

        assert_eq!(decode_row(row).unwrap().type_id, payload_type);
    }

    #[test]
    fn decode_row_without_id_fails() {
        let row = RawRow {
            id: None,
            type_id: TypeId::zero(),
            data: b"{}".to_vec(),
        };
        assert!(matches!(decode_row(row), Err(DecodeError::MissingId)));
    }
}
