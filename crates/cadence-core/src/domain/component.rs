//! Registry of component types and their callable handles.
//!
//! A component type is an ordinary Rust type registered under a name along
//! with its constructor, settable properties, operations and accessors.
//! Registration erases the concrete type into shared closures, so flow
//! loading resolves every name once and execution only makes direct calls.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::step::StepApi;
use crate::error::CoreError;
use crate::types::{FlowValue, Instance, ValueKind};

/// Future returned by the erased handles
pub type HandleFuture<T> = BoxFuture<'static, Result<T, CoreError>>;

/// Builds a fresh instance
pub type FactoryFn = Arc<dyn Fn() -> Result<Instance, CoreError> + Send + Sync>;

/// Applies one bound value to an instance property
pub type SetterFn = Arc<dyn Fn(Instance, FlowValue) -> HandleFuture<()> + Send + Sync>;

/// Runs a step operation against an instance
pub type OperationFn = Arc<dyn Fn(Instance, StepApi) -> HandleFuture<()> + Send + Sync>;

/// Reads a named result from an instance
pub type AccessorFn = Arc<dyn Fn(Instance) -> HandleFuture<FlowValue> + Send + Sync>;

/// A settable property
#[derive(Clone)]
pub struct PropertyHandle {
    /// Accepted value kind
    pub kind: ValueKind,
    /// Setter
    pub setter: SetterFn,
}

/// A named accessor
#[derive(Clone)]
pub struct AccessorHandle {
    /// Kind of the produced value
    pub kind: ValueKind,
    /// Getter
    pub getter: AccessorFn,
}

/// Type-erased description of a registered component type
#[derive(Clone)]
pub struct ComponentDescriptor {
    name: String,
    factory: Option<FactoryFn>,
    properties: HashMap<String, PropertyHandle>,
    operations: HashMap<String, OperationFn>,
    accessors: HashMap<String, AccessorHandle>,
}

impl ComponentDescriptor {
    /// Registered type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Constructor, if the type can be built by the executor
    pub fn factory(&self) -> Option<&FactoryFn> {
        self.factory.as_ref()
    }

    /// Property by name
    pub fn property(&self, name: &str) -> Option<&PropertyHandle> {
        self.properties.get(name)
    }

    /// Operation by name
    pub fn operation(&self, name: &str) -> Option<&OperationFn> {
        self.operations.get(name)
    }

    /// Accessor by name
    pub fn accessor(&self, name: &str) -> Option<&AccessorHandle> {
        self.accessors.get(name)
    }

    /// Sorted operation names
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The kind of value an instance of this type has
    pub fn instance_kind(&self) -> ValueKind {
        ValueKind::Instance(self.name.clone())
    }
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("constructible", &self.factory.is_some())
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("operations", &self.operation_names())
            .field("accessors", &self.accessors.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn wrong_type(type_name: &str, instance: &Instance) -> CoreError {
    CoreError::ConfigurationError(format!(
        "expected an instance of '{}', got '{}'",
        type_name,
        instance.type_name()
    ))
}

/// Typed builder for a component type
pub struct ComponentType<T> {
    descriptor: ComponentDescriptor,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> ComponentType<T> {
    /// Start describing the type registered as `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ComponentDescriptor {
                name: name.into(),
                factory: None,
                properties: HashMap::new(),
                operations: HashMap::new(),
                accessors: HashMap::new(),
            },
            _marker: std::marker::PhantomData,
        }
    }

    /// Constructor used by steps acquiring a `new` instance
    pub fn constructor<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<T, CoreError> + Send + Sync + 'static,
    {
        let type_name: Arc<str> = Arc::from(self.descriptor.name.as_str());
        self.descriptor.factory = Some(Arc::new(move || {
            factory().map(|value| Instance::new(Arc::clone(&type_name), value))
        }));
        self
    }

    /// Constructor from `Default`
    pub fn default_constructor(self) -> Self
    where
        T: Default,
    {
        self.constructor(|| Ok(T::default()))
    }

    /// A settable property accepting values of `kind`
    pub fn property<F>(mut self, name: impl Into<String>, kind: ValueKind, setter: F) -> Self
    where
        F: Fn(&mut T, FlowValue) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        let setter = Arc::new(setter);
        let type_name = self.descriptor.name.clone();
        let erased: SetterFn = Arc::new(move |instance: Instance, value: FlowValue| -> HandleFuture<()> {
            let setter = Arc::clone(&setter);
            let type_name = type_name.clone();
            async move {
                let target = instance
                    .downcast::<T>()
                    .ok_or_else(|| wrong_type(&type_name, &instance))?;
                let mut guard = target.lock().await;
                setter(&mut *guard, value)
            }
            .boxed()
        });
        self.descriptor
            .properties
            .insert(name.into(), PropertyHandle { kind, setter: erased });
        self
    }

    /// An operation a step can invoke
    pub fn operation<F, Fut>(mut self, name: impl Into<String>, operation: F) -> Self
    where
        F: Fn(Arc<Mutex<T>>, StepApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let operation = Arc::new(operation);
        let type_name = self.descriptor.name.clone();
        let erased: OperationFn = Arc::new(move |instance: Instance, api: StepApi| -> HandleFuture<()> {
            let operation = Arc::clone(&operation);
            let type_name = type_name.clone();
            async move {
                let target = instance
                    .downcast::<T>()
                    .ok_or_else(|| wrong_type(&type_name, &instance))?;
                operation(target, api).await
            }
            .boxed()
        });
        self.descriptor.operations.insert(name.into(), erased);
        self
    }

    /// A named accessor producing values of `kind`
    pub fn accessor<F>(mut self, name: impl Into<String>, kind: ValueKind, getter: F) -> Self
    where
        F: Fn(&T) -> FlowValue + Send + Sync + 'static,
    {
        let getter = Arc::new(getter);
        let type_name = self.descriptor.name.clone();
        let erased: AccessorFn = Arc::new(move |instance: Instance| -> HandleFuture<FlowValue> {
            let getter = Arc::clone(&getter);
            let type_name = type_name.clone();
            async move {
                let target = instance
                    .downcast::<T>()
                    .ok_or_else(|| wrong_type(&type_name, &instance))?;
                let guard = target.lock().await;
                Ok(getter(&*guard))
            }
            .boxed()
        });
        self.descriptor
            .accessors
            .insert(name.into(), AccessorHandle { kind, getter: erased });
        self
    }

    /// Finish and return the erased descriptor
    pub fn into_descriptor(self) -> ComponentDescriptor {
        self.descriptor
    }
}

/// Component types by name
#[derive(Clone, Default, Debug)]
pub struct ComponentRegistry {
    types: HashMap<String, Arc<ComponentDescriptor>>,
}

impl ComponentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type, replacing any previous one of that name
    pub fn register<T: Send + 'static>(&mut self, component: ComponentType<T>) -> &mut Self {
        let descriptor = component.into_descriptor();
        tracing::debug!(component = %descriptor.name(), "Registered component type");
        self.types
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
        self
    }

    /// Builder style registration
    pub fn with<T: Send + 'static>(mut self, component: ComponentType<T>) -> Self {
        self.register(component);
        self
    }

    /// Look up a type by name
    pub fn get(&self, name: &str) -> Option<Arc<ComponentDescriptor>> {
        self.types.get(name).cloned()
    }

    /// Whether a type is registered
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Sorted type names
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}
