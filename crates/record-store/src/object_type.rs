//! Object type descriptors and type resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Query, TypeId};

/// Describes the declared type of a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectType {
    pub id: TypeId,

    /// Name of the class records of this type materialize as.
    pub class_name: String,

    /// Classes (supertypes, interfaces) this type is also assignable to.
    pub assignable_to: Vec<String>,

    pub groups: HashSet<String>,
}

impl ObjectType {
    /// Creates a type with no supertypes and no groups.
    pub fn new(id: TypeId, class_name: impl Into<String>) -> Self {
        Self {
            id,
            class_name: class_name.into(),
            assignable_to: Vec::new(),
            groups: HashSet::new(),
        }
    }

    /// Adds a supertype.
    pub fn extends(mut self, class_name: impl Into<String>) -> Self {
        self.assignable_to.push(class_name.into());
        self
    }

    /// Adds a group membership.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// Returns true if records of this type may be used as `class_name`.
    pub fn is_assignable_to(&self, class_name: &str) -> bool {
        self.class_name == class_name || self.assignable_to.iter().any(|c| c == class_name)
    }

    /// Returns true if the query's class and group restrictions admit this type.
    pub fn admitted_by(&self, query: &Query) -> bool {
        if let Some(class_name) = query.object_class.as_deref()
            && !self.is_assignable_to(class_name)
        {
            return false;
        }
        if let Some(group) = query.group.as_deref()
            && !self.groups.contains(group)
        {
            return false;
        }
        true
    }
}

/// Resolves type markers to type descriptors.
pub trait TypeRegistry: Send + Sync {
    /// Returns the descriptor for a type marker, or `None` if it is unknown.
    fn resolve(&self, type_id: TypeId) -> Option<Arc<ObjectType>>;
}

/// Returns true if a record of the given (possibly unknown) type passes the
/// query's class and group restrictions.
///
/// Unknown types are never filtered out.
pub fn admits(query: &Query, object_type: Option<&ObjectType>) -> bool {
    object_type.is_none_or(|t| t.admitted_by(query))
}

/// Type registry backed by an in-process map.
#[derive(Clone, Default)]
pub struct InMemoryTypeRegistry {
    types: Arc<RwLock<HashMap<TypeId, Arc<ObjectType>>>>,
}

impl InMemoryTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a type descriptor.
    pub fn register(&self, object_type: ObjectType) -> Arc<ObjectType> {
        let object_type = Arc::new(object_type);
        self.types
            .write()
            .insert(object_type.id, Arc::clone(&object_type));
        object_type
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Returns true if no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl TypeRegistry for InMemoryTypeRegistry {
    fn resolve(&self, type_id: TypeId) -> Option<Arc<ObjectType>> {
        self.types.read().get(&type_id).cloned()
    }
}
