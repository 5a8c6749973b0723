//! Registry of singleton classes and their instance ids.

use std::collections::HashMap;

use common::RecordId;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Entry {
    instance: Option<RecordId>,
}

/// Maps classes that have exactly one permitted instance to that
/// instance's id.
///
/// A predicate-free read of a singleton class can then be answered by id.
#[derive(Debug, Default)]
pub struct SingletonRegistry {
    classes: RwLock<HashMap<String, Entry>>,
}

impl SingletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a class as a singleton, without a known instance yet.
    pub fn mark_singleton(&self, class_name: impl Into<String>) {
        self.classes.write().entry(class_name.into()).or_default();
    }

    /// Records the instance of a singleton class, marking it if needed.
    pub fn set_instance(&self, class_name: impl Into<String>, id: RecordId) {
        self.classes
            .write()
            .entry(class_name.into())
            .or_default()
            .instance = Some(id);
    }

    /// Forgets the instance of a singleton class. The class stays marked.
    pub fn clear_instance(&self, class_name: &str) {
        if let Some(entry) = self.classes.write().get_mut(class_name) {
            entry.instance = None;
        }
    }

    pub fn is_singleton(&self, class_name: &str) -> bool {
        self.classes.read().contains_key(class_name)
    }

    /// Returns the instance id of a singleton class, if known.
    pub fn instance_id(&self, class_name: &str) -> Option<RecordId> {
        self.classes.read().get(class_name)?.instance
    }
}
