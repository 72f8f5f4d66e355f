use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

use crate::error::CoreError;

/// An ambient resource handed to step operations
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Supplies ambient resources a step operation may need.
///
/// The executor neither creates nor owns them.
pub trait ResourceProvider: Send + Sync {
    /// Look up a resource by name
    fn resource(&self, name: &str) -> Option<Resource>;
}

/// Typed lookup on top of [`ResourceProvider`]
pub fn typed_resource<R: Any + Send + Sync>(
    provider: &dyn ResourceProvider,
    name: &str,
) -> Result<Arc<R>, CoreError> {
    downcast_resource(name, provider.resource(name))
}

/// Downcast the outcome of a lookup for `name`
pub(crate) fn downcast_resource<R: Any + Send + Sync>(
    name: &str,
    resource: Option<Resource>,
) -> Result<Arc<R>, CoreError> {
    let resource = resource
        .ok_or_else(|| CoreError::ComponentError(format!("resource '{}' is not available", name)))?;
    resource.downcast::<R>().map_err(|_| {
        CoreError::ComponentError(format!(
            "resource '{}' is not a {}",
            name,
            std::any::type_name::<R>()
        ))
    })
}

/// Resources registered up front by name
#[derive(Default)]
pub struct StaticResources {
    entries: DashMap<String, Resource>,
}

impl StaticResources {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style registration
    pub fn with<R: Any + Send + Sync>(self, name: impl Into<String>, value: R) -> Self {
        self.insert(name, value);
        self
    }

    /// Register or replace a resource
    pub fn insert<R: Any + Send + Sync>(&self, name: impl Into<String>, value: R) {
        self.entries.insert(name.into(), Arc::new(value));
    }

    /// Register an already shared resource
    pub fn insert_shared(&self, name: impl Into<String>, value: Resource) {
        self.entries.insert(name.into(), value);
    }

    /// Remove a resource
    pub fn remove(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }
}

impl ResourceProvider for StaticResources {
    fn resource(&self, name: &str) -> Option<Resource> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }
}
