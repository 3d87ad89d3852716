//! Workflow-scope resources.

use super::ModuleContext;
use crate::error::{FlowError, Result};
use std::any::Any;
use std::sync::Arc;

/// A read-only, workflow-scope singleton addressable by class name.
///
/// Resources are initialized after the data manager is up and before any
/// stage `init` runs. They may read the file and publish derived tables in
/// `init`, but must not mutate on-disk state during the run loop, so the
/// trait takes `&self` throughout; implementations keep derived data behind
/// `OnceLock` or similar.
pub trait Resource: Send + Sync {
    /// Load or derive data; called once before generator and stage init.
    fn init(&self, source_name: &str) -> Result<()> {
        let _ = source_name;
        Ok(())
    }

    /// Clean up; called once after stages have finished.
    fn finish(&self, source_name: &str) -> Result<()> {
        let _ = source_name;
        Ok(())
    }

    /// Downcast support for typed lookup.
    fn as_any(&self) -> &dyn Any;
}

/// Creates resource instances from configuration.
pub trait ResourceFactory: Send + Sync {
    /// The class name this factory answers to.
    fn classname(&self) -> &str;

    /// Instantiate the singleton from its `params` map.
    fn create(&self, ctx: &ModuleContext, params: &serde_yaml::Value)
        -> Result<Arc<dyn Resource>>;
}

/// Explicit container for resource singletons, owned by the manager.
///
/// Stages receive it by reference and look resources up by class name;
/// there is no process-wide mutable state behind it. Iteration preserves
/// configuration order, which is also init/finish order.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Vec<(String, Arc<dyn Resource>)>,
}

impl ResourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the singleton for `classname`.
    ///
    /// At most one instance per class per workflow; a duplicate is a
    /// configuration error.
    pub fn insert(&mut self, classname: impl Into<String>, resource: Arc<dyn Resource>) -> Result<()> {
        let classname = classname.into();
        if self.get(&classname).is_some() {
            return Err(FlowError::ConfigValue {
                field: format!("resources.{}", classname),
                cause: "resource configured more than once".to_string(),
            });
        }
        self.entries.push((classname, resource));
        Ok(())
    }

    /// Look up a resource by class name.
    pub fn get(&self, classname: &str) -> Option<&Arc<dyn Resource>> {
        self.entries
            .iter()
            .find(|(name, _)| name == classname)
            .map(|(_, r)| r)
    }

    /// Typed lookup by class name.
    pub fn get_as<T: Any>(&self, classname: &str) -> Option<&T> {
        self.get(classname)
            .and_then(|r| r.as_any().downcast_ref::<T>())
    }

    /// Iterate `(classname, resource)` pairs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Resource>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Geometry {
        pitch_mm: f64,
    }

    impl Resource for Geometry {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn typed_lookup() {
        let mut registry = ResourceRegistry::new();
        registry
            .insert("Geometry", Arc::new(Geometry { pitch_mm: 4.4 }))
            .unwrap();
        let geo = registry.get_as::<Geometry>("Geometry").unwrap();
        assert_eq!(geo.pitch_mm, 4.4);
        assert!(registry.get_as::<Geometry>("Other").is_none());
    }

    #[test]
    fn duplicate_class_is_rejected() {
        let mut registry = ResourceRegistry::new();
        registry
            .insert("Geometry", Arc::new(Geometry { pitch_mm: 4.4 }))
            .unwrap();
        let err = registry
            .insert("Geometry", Arc::new(Geometry { pitch_mm: 3.8 }))
            .unwrap_err();
        assert_eq!(err.code(), "E102");
    }
}
