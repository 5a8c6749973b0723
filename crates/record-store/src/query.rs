use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::record::{Attributes, ID_KEY, TYPE_KEY};
use crate::{RecordId, TypeId};

/// Query option that forces a read to bypass the replication cache.
pub const DISABLE_REPLICATION_CACHE_OPTION: &str = "sql.disableReplicationCache";

/// Query option that attaches the raw payload to each returned record.
pub const RETURN_ORIGINAL_DATA_OPTION: &str = "dari.returnOriginalData";

/// Comparison operator of a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Matches if the attribute equals any of the values.
    Equals,
    /// Matches if the attribute equals none of the values.
    NotEquals,
    LessThan,
    LessThanOrEquals,
    GreaterThan,
    GreaterThanOrEquals,
    /// Matches if the attribute is absent or null.
    Missing,
}

/// A leaf comparison against one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<Value>,
}

/// Predicate tree of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comparison(Comparison),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Builds a leaf comparison.
    pub fn compare(key: impl Into<String>, operator: Operator, values: Vec<Value>) -> Self {
        Self::Comparison(Comparison {
            key: key.into(),
            operator,
            values,
        })
    }

    /// `key = value`.
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Operator::Equals, vec![value.into()])
    }

    /// `_id = id`.
    pub fn id(id: RecordId) -> Self {
        Self::id_in([id])
    }

    /// `_id` is one of the given ids.
    pub fn id_in(ids: impl IntoIterator<Item = RecordId>) -> Self {
        let values = ids
            .into_iter()
            .map(|id| Value::String(id.to_string()))
            .collect();
        Self::compare(ID_KEY, Operator::Equals, values)
    }

    /// Logical AND of the given predicates.
    pub fn and(children: impl IntoIterator<Item = Predicate>) -> Self {
        Self::And(children.into_iter().collect())
    }

    /// Logical OR of the given predicates.
    pub fn or(children: impl IntoIterator<Item = Predicate>) -> Self {
        Self::Or(children.into_iter().collect())
    }

    /// Logical negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    /// Returns the id set this predicate is equivalent to, if it can be
    /// proven to be a pure `_id ∈ S` restriction.
    pub fn id_only_values(&self) -> Option<Vec<RecordId>> {
        match self {
            Predicate::Comparison(c) if c.key == ID_KEY && c.operator == Operator::Equals => {
                let mut ids = Vec::with_capacity(c.values.len());
                for id in c.values.iter().filter_map(value_to_record_id) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Some(ids)
            }
            Predicate::Or(children) if !children.is_empty() => {
                let mut ids: Vec<RecordId> = Vec::new();
                for child in children {
                    for id in child.id_only_values()? {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                Some(ids)
            }
            Predicate::And(children) if !children.is_empty() => {
                let mut sets = children.iter().map(Predicate::id_only_values);
                let mut ids = sets.next()??;
                for set in sets {
                    let set = set?;
                    ids.retain(|id| set.contains(id));
                }
                Some(ids)
            }
            _ => None,
        }
    }

    /// Evaluates this predicate against a record.
    ///
    /// `_id` and `_type` compare against the record's identifier and type
    /// marker; every other key compares against a top-level attribute.
    pub fn matches(&self, id: RecordId, type_id: TypeId, values: &Attributes) -> bool {
        match self {
            Predicate::Comparison(c) => {
                let field = match c.key.as_str() {
                    ID_KEY => Some(Value::String(id.to_string())),
                    TYPE_KEY => Some(Value::String(type_id.to_string())),
                    key => values.get(key).filter(|v| !v.is_null()).cloned(),
                };
                c.matches(field.as_ref())
            }
            Predicate::And(children) => children.iter().all(|p| p.matches(id, type_id, values)),
            Predicate::Or(children) => children.iter().any(|p| p.matches(id, type_id, values)),
            Predicate::Not(inner) => !inner.matches(id, type_id, values),
        }
    }
}

impl Comparison {
    fn matches(&self, field: Option<&Value>) -> bool {
        let Some(field) = field else {
            return matches!(self.operator, Operator::Missing | Operator::NotEquals);
        };

        match self.operator {
            Operator::Missing => false,
            Operator::Equals => self.values.iter().any(|v| values_equal(field, v)),
            Operator::NotEquals => !self.values.iter().any(|v| values_equal(field, v)),
            Operator::LessThan => self.any_ordering(field, |o| o == Ordering::Less),
            Operator::LessThanOrEquals => self.any_ordering(field, |o| o != Ordering::Greater),
            Operator::GreaterThan => self.any_ordering(field, |o| o == Ordering::Greater),
            Operator::GreaterThanOrEquals => self.any_ordering(field, |o| o != Ordering::Less),
        }
    }

    fn any_ordering(&self, field: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
        self.values
            .iter()
            .filter_map(|v| compare_values(field, v))
            .any(accept)
    }
}

fn value_to_record_id(value: &Value) -> Option<RecordId> {
    value.as_str().and_then(RecordId::parse)
}

// Ids compare case-insensitively through their parsed form.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(l), Value::String(r)) => match (RecordId::parse(l), RecordId::parse(r)) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

/// Orders two JSON scalars of the same kind.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sort order on one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Sorter {
    pub key: String,
    pub order: SortOrder,
}

/// Describes a read against the record store.
///
/// Carries an object-class restriction, an optional group restriction, a
/// predicate tree, sorters, named options, and whether the replication
/// cache may serve it at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Restrict to records whose type is assignable to this class.
    pub object_class: Option<String>,

    /// Restrict to records whose type belongs to this group.
    pub group: Option<String>,

    pub predicate: Option<Predicate>,

    pub sorters: Vec<Sorter>,

    pub options: HashMap<String, Value>,

    /// Whether caches may be used for this query.
    pub cache: bool,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            object_class: None,
            group: None,
            predicate: None,
            sorters: Vec::new(),
            options: HashMap::new(),
            cache: true,
        }
    }
}

impl Query {
    /// Creates an unrestricted query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query restricted to an object class.
    pub fn from_class(class_name: impl Into<String>) -> Self {
        Self {
            object_class: Some(class_name.into()),
            ..Default::default()
        }
    }

    /// Creates a query restricted to a group.
    pub fn from_group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Default::default()
        }
    }

    /// Creates a query for records with the given ids.
    pub fn for_ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self::new().where_predicate(Predicate::id_in(ids))
    }

    /// Restricts by object class.
    pub fn object_class(mut self, class_name: impl Into<String>) -> Self {
        self.object_class = Some(class_name.into());
        self
    }

    /// Restricts by group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Replaces the predicate.
    pub fn where_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// ANDs a predicate with the existing one.
    pub fn and_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            None => predicate,
            Some(Predicate::And(mut children)) => {
                children.push(predicate);
                Predicate::And(children)
            }
            Some(existing) => Predicate::And(vec![existing, predicate]),
        });
        self
    }

    /// Sorts ascending by an attribute.
    pub fn sort_ascending(mut self, key: impl Into<String>) -> Self {
        self.sorters.push(Sorter {
            key: key.into(),
            order: SortOrder::Ascending,
        });
        self
    }

    /// Sorts descending by an attribute.
    pub fn sort_descending(mut self, key: impl Into<String>) -> Self {
        self.sorters.push(Sorter {
            key: key.into(),
            order: SortOrder::Descending,
        });
        self
    }

    /// Sets a named option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Forbids caches from serving this query.
    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Returns true if the option is set to `true` or `"true"`.
    pub fn option_flag(&self, key: &str) -> bool {
        match self.options.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Returns the finite id set this query is restricted to, if any.
    pub fn find_id_only_values(&self) -> Option<Vec<RecordId>> {
        self.predicate.as_ref()?.id_only_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_comparison_is_id_only() {
        let a = RecordId::new();
        let b = RecordId::new();
        let query = Query::for_ids([a, b, a]);
        assert_eq!(query.find_id_only_values(), Some(vec![a, b]));
    }

    #[test]
    fn non_uuid_id_values_are_dropped() {
        let query = Query::new().where_predicate(Predicate::compare(
            ID_KEY,
            Operator::Equals,
            vec![json!("nope"), json!(42)],
        ));
        assert_eq!(query.find_id_only_values(), Some(vec![]));
    }

    #[test]
    fn or_of_ids_is_union() {
        let a = RecordId::new();
        let b = RecordId::new();
        let query = Query::new().where_predicate(Predicate::or([
            Predicate::id(a),
            Predicate::id_in([a, b]),
        ]));
        assert_eq!(query.find_id_only_values(), Some(vec![a, b]));
    }

    #[test]
    fn or_with_attribute_is_not_id_only() {
        let query = Query::new().where_predicate(Predicate::or([
            Predicate::id(RecordId::new()),
            Predicate::equals("name", "Rex"),
        ]));
        assert_eq!(query.find_id_only_values(), None);
    }

    #[test]
    fn and_of_ids_is_intersection() {
        let a = RecordId::new();
        let b = RecordId::new();
        let query = Query::new().where_predicate(Predicate::and([
            Predicate::id_in([a, b]),
            Predicate::id(b),
        ]));
        assert_eq!(query.find_id_only_values(), Some(vec![b]));
    }

    #[test]
    fn and_with_attribute_is_not_id_only() {
        let query =
            Query::for_ids([RecordId::new()]).and_predicate(Predicate::equals("name", "Rex"));
        assert_eq!(query.find_id_only_values(), None);
    }

    #[test]
    fn no_predicate_is_not_id_only() {
        assert_eq!(Query::from_class("Dog").find_id_only_values(), None);
    }

    #[test]
    fn predicate_matches_attributes() {
        let id = RecordId::new();
        let mut values = Attributes::new();
        values.insert("name".to_string(), json!("Rex"));
        values.insert("age".to_string(), json!(4));

        let type_id = TypeId::random();
        assert!(Predicate::equals("name", "Rex").matches(id, type_id, &values));
        assert!(!Predicate::equals("name", "Tom").matches(id, type_id, &values));
        assert!(
            Predicate::compare("age", Operator::GreaterThan, vec![json!(3)])
                .matches(id, type_id, &values)
        );
        assert!(
            Predicate::compare("owner", Operator::Missing, vec![]).matches(id, type_id, &values)
        );
        assert!(Predicate::id(id).matches(id, type_id, &values));
        assert!(Predicate::not(Predicate::id(id)).matches(RecordId::new(), type_id, &values));
    }

    #[test]
    fn option_flag_accepts_bool_and_string() {
        let query = Query::new()
            .option(DISABLE_REPLICATION_CACHE_OPTION, true)
            .option(RETURN_ORIGINAL_DATA_OPTION, "TRUE");
        assert!(query.option_flag(DISABLE_REPLICATION_CACHE_OPTION));
        assert!(query.option_flag(RETURN_ORIGINAL_DATA_OPTION));
        assert!(!query.option_flag("missing"));
    }

    #[test]
    fn query_defaults_allow_cache() {
        assert!(Query::new().cache);
        assert!(!Query::new().no_cache().cache);
    }

    #[test]
    fn and_predicate_flattens() {
        let query = Query::new()
            .and_predicate(Predicate::equals("a", 1))
            .and_predicate(Predicate::equals("b", 2))
            .and_predicate(Predicate::equals("c", 3));
        match query.predicate {
            Some(Predicate::And(children)) => assert_eq!(children.len(), 3),
            other => panic!("expected AND, got {other:?}"),
        }
    }
}
