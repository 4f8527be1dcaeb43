//! Named in-process resources of a segment.
//!
//! Dumping a real-time segment does not serialize its dynamic trees. The live
//! structure is registered here under a well-known name instead, and readers of
//! the dumped segment look it up again. Entries are only meaningful inside the
//! process that registered them.

use std::any::Any;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;

use crate::error::{Result, SegpatchError};

/// Suffix of a field's dynamic tree resource.
pub const DYNAMIC_INDEX_RESOURCE_SUFFIX: &str = "_@_dynamic_index.trees";

/// Resource name of `field`'s dynamic trees.
pub fn dynamic_resource_name(field: &str) -> String {
    format!("{field}{DYNAMIC_INDEX_RESOURCE_SUFFIX}")
}

/// Registry of shared resources keyed by name.
#[derive(Default)]
pub struct PersistedResources {
    resources: RwLock<AHashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl PersistedResources {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` under `name`. Names are registered once.
    pub fn register<T: Any + Send + Sync>(&self, name: &str, resource: Arc<T>) -> Result<()> {
        let mut resources = self.resources.write();
        if resources.contains_key(name) {
            return Err(SegpatchError::invalid_argument(format!(
                "resource {name} already registered"
            )));
        }
        resources.insert(name.to_string(), resource);
        debug!("registered resource {name}");
        Ok(())
    }

    /// Look up `name` as a `T`.
    ///
    /// A resource registered under `name` with another type is an
    /// inconsistency, not a miss.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Option<Arc<T>>> {
        let Some(resource) = self.resources.read().get(name).cloned() else {
            return Ok(None);
        };
        resource.downcast::<T>().map(Some).map_err(|_| {
            SegpatchError::inconsistent(format!("resource {name} has an unexpected type"))
        })
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.resources.read().contains_key(name)
    }

    /// Drop the resource registered under `name`.
    pub fn remove(&self, name: &str) -> bool {
        self.resources.write().remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PersistedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedResources")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let resources = PersistedResources::new();
        let name = dynamic_resource_name("title");
        assert_eq!(name, "title_@_dynamic_index.trees");

        resources.register(&name, Arc::new(7u32)).unwrap();
        assert!(resources.contains(&name));
        assert_eq!(*resources.get::<u32>(&name).unwrap().unwrap(), 7);
        assert!(resources.get::<u32>("missing").unwrap().is_none());

        assert!(resources.get::<String>(&name).is_err());
        assert!(resources.register(&name, Arc::new(8u32)).is_err());

        assert!(resources.remove(&name));
        assert!(resources.names().is_empty());
    }
}
