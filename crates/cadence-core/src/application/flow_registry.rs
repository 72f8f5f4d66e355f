//! Loaded flows and the services their executors share.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::application::flow_executor::FlowExecutor;
use crate::application::metrics::{FlowMetrics, MetricsSnapshot};
use crate::config::EngineConfig;
use crate::domain::component::ComponentRegistry;
use crate::domain::events::{AuditSink, NoopAuditSink, TracingAuditSink};
use crate::domain::flow_definition::{FlowDefinition, FlowDocument};
use crate::domain::resolver::{coverage_shape, FlowResolver, ResolvedFlow};
use crate::domain::resources::{ResourceProvider, StaticResources};
use crate::error::CoreError;

/// Shared by every executor of one registry
pub struct EngineServices {
    /// Engine configuration
    pub config: EngineConfig,
    /// Audit event destination
    pub audit: Arc<dyn AuditSink>,
    /// Ambient resources
    pub resources: Arc<dyn ResourceProvider>,
    /// Bounds asynchronous invocations running at once
    pub workers: Arc<Semaphore>,
    /// Invocation counters
    pub metrics: FlowMetrics,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("config", &self.config)
            .field("available_workers", &self.workers.available_permits())
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Builder for [`FlowRegistry`]
pub struct FlowRegistryBuilder {
    components: ComponentRegistry,
    config: EngineConfig,
    audit: Option<Arc<dyn AuditSink>>,
    resources: Option<Arc<dyn ResourceProvider>>,
}

impl FlowRegistryBuilder {
    /// Use `config` instead of the defaults
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Send audit events to `sink`
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Make `resources` available to operations
    pub fn with_resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Validate the configuration and create the registry
    pub fn build(self) -> Result<Arc<FlowRegistry>, CoreError> {
        self.config.validate()?;
        let audit = self.audit.unwrap_or_else(|| -> Arc<dyn AuditSink> {
            if self.config.audit_enabled {
                Arc::new(TracingAuditSink)
            } else {
                Arc::new(NoopAuditSink)
            }
        });
        let resources = self
            .resources
            .unwrap_or_else(|| -> Arc<dyn ResourceProvider> { Arc::new(StaticResources::new()) });
        let services = EngineServices {
            workers: Arc::new(Semaphore::new(self.config.max_workers)),
            config: self.config,
            audit,
            resources,
            metrics: FlowMetrics::default(),
        };
        debug!(components = ?self.components.type_names(), "Flow registry created");
        Ok(Arc::new(FlowRegistry {
            components: self.components,
            services: Arc::new(services),
            executors: DashMap::new(),
            loading: Mutex::new(()),
        }))
    }
}

/// Holds loaded flows and hands out their executors.
///
/// Flows are resolved when loaded: a flow that loads can only fail at run
/// time because of what its operations do.
pub struct FlowRegistry {
    components: ComponentRegistry,
    services: Arc<EngineServices>,
    executors: DashMap<String, Arc<FlowExecutor>>,
    loading: Mutex<()>,
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.flow_names())
            .field("services", &self.services)
            .finish()
    }
}

impl FlowRegistry {
    /// Start building a registry over `components`
    pub fn builder(components: ComponentRegistry) -> FlowRegistryBuilder {
        FlowRegistryBuilder {
            components,
            config: EngineConfig::default(),
            audit: None,
            resources: None,
        }
    }

    /// Registry with `config` and the default sinks
    pub fn new(components: ComponentRegistry, config: EngineConfig) -> Result<Arc<Self>, CoreError> {
        Self::builder(components).with_config(config).build()
    }

    /// Registered component types
    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Services shared by the executors
    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Current invocation counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.services.metrics.snapshot()
    }

    /// Resolve and add `definitions` as one batch.
    ///
    /// Flows in the batch may reference each other and any flow loaded
    /// before. Nothing is added when any definition fails to resolve.
    pub fn load(self: &Arc<Self>, definitions: Vec<FlowDefinition>) -> Result<Vec<String>, CoreError> {
        let _loading = self.loading.lock();

        let mut batch = HashSet::new();
        for definition in &definitions {
            if self.executors.contains_key(&definition.name) || !batch.insert(definition.name.clone()) {
                return Err(CoreError::ConfigurationError(format!(
                    "flow '{}' is already defined",
                    definition.name
                )));
            }
        }

        let mut flows: HashMap<String, Arc<ResolvedFlow>> = self
            .executors
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value().definition())))
            .collect();
        let known: HashSet<String> = flows.keys().cloned().chain(batch).collect();

        let resolver = FlowResolver::new(&self.components);
        let resolved = definitions
            .iter()
            .map(|definition| resolver.resolve(definition, &known).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        for flow in &resolved {
            flows.insert(flow.name.clone(), Arc::clone(flow));
        }

        let mut names = Vec::with_capacity(resolved.len());
        for flow in resolved {
            let shape = coverage_shape(&flow, &flows);
            let executor = FlowExecutor::new(
                Arc::clone(&flow),
                shape,
                Arc::clone(&self.services),
                Arc::downgrade(self),
            );
            names.push(flow.name.clone());
            self.executors.insert(flow.name.clone(), Arc::new(executor));
        }

        info!(flows = ?names, "Loaded flows");
        Ok(names)
    }

    /// Load every flow of a parsed document
    pub fn load_document(self: &Arc<Self>, document: FlowDocument) -> Result<Vec<String>, CoreError> {
        self.load(document.flows)
    }

    /// Parse and load a YAML flow document
    pub fn load_yaml(self: &Arc<Self>, yaml: &str) -> Result<Vec<String>, CoreError> {
        self.load_document(FlowDocument::from_yaml_str(yaml)?)
    }

    /// Read and load a flow document; `.json` files are parsed as JSON,
    /// anything else as YAML
    pub fn load_file(self: &Arc<Self>, path: &Path) -> Result<Vec<String>, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let document = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => FlowDocument::from_json_str(&text)?,
            _ => FlowDocument::from_yaml_str(&text)?,
        };
        debug!(path = %path.display(), "Loading flow document");
        self.load_document(document)
    }

    /// Executor of a loaded flow
    pub fn executor(&self, name: &str) -> Result<Arc<FlowExecutor>, CoreError> {
        self.executors
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::ConfigurationError(format!("unknown flow '{}'", name)))
    }

    /// Whether `name` is loaded
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Names of the loaded flows, sorted
    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove a flow. Fails while another loaded flow declares it as nested.
    pub fn unload(&self, name: &str) -> Result<bool, CoreError> {
        let _loading = self.loading.lock();
        let dependents: Vec<String> = self
            .executors
            .iter()
            .filter(|entry| entry.key() != name)
            .filter(|entry| entry.value().definition().sub_flows().any(|f| f == name))
            .map(|entry| entry.key().clone())
            .collect();
        if !dependents.is_empty() {
            return Err(CoreError::ConfigurationError(format!(
                "flow '{}' is still used by {}",
                name,
                dependents.join(", ")
            )));
        }
        let removed = self.executors.remove(name).is_some();
        if removed {
            info!(flow = %name, "Unloaded flow");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::component::ComponentType;
    use crate::domain::flow_definition::StepDefinition;
    use crate::types::{FlowValue, ValueKind};
    use serde_json::json;

    #[derive(Default)]
    struct Echo {
        value: serde_json::Value,
    }

    fn registry() -> Arc<FlowRegistry> {
        let components = ComponentRegistry::new().with(
            ComponentType::<Echo>::new("Echo")
                .default_constructor()
                .property("value", ValueKind::Data, |echo, value| {
                    echo.value = value.as_data().cloned().unwrap_or_default();
                    Ok(())
                })
                .operation("noop", |_echo, _api| async move { Ok(()) })
                .accessor("value", ValueKind::Data, |echo| FlowValue::data(echo.value.clone())),
        );
        FlowRegistry::builder(components)
            .with_audit_sink(Arc::new(NoopAuditSink))
            .build()
            .unwrap()
    }

    fn echo(flow: &str, value: serde_json::Value) -> FlowDefinition {
        FlowDefinition::new(flow).step(
            StepDefinition::new("A", "Echo", "noop")
                .literal("value", value)
                .keep("value"),
        )
    }

    #[test]
    fn test_load_and_lookup() {
        let registry = registry();
        let names = registry.load(vec![echo("B", json!(1)), echo("A", json!(2))]).unwrap();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(registry.flow_names(), vec!["A", "B"]);
        assert!(registry.executor("A").is_ok());
        assert!(registry.executor("C").unwrap_err().is_configuration());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let registry = registry();
        assert!(registry.load(vec![echo("A", json!(1)), echo("A", json!(2))]).is_err());
        assert!(registry.flow_names().is_empty());

        registry.load(vec![echo("A", json!(1))]).unwrap();
        let error = registry.load(vec![echo("A", json!(1))]).unwrap_err();
        assert_eq!(error.to_string(), "Configuration error: flow 'A' is already defined");
    }

    #[test]
    fn test_failed_batch_adds_nothing() {
        let registry = registry();
        let broken = FlowDefinition::new("Broken").step(StepDefinition::new("A", "Echo", "missing"));
        assert!(registry.load(vec![echo("Good", json!(1)), broken]).is_err());
        assert!(!registry.contains("Good"));
    }

    #[test]
    fn test_batch_may_reference_itself_and_earlier_loads() {
        let registry = registry();
        registry.load(vec![echo("Leaf", json!(1))]).unwrap();
        let parent = FlowDefinition::new("Parent")
            .step(StepDefinition::new("A", "Echo", "noop").invokes("Leaf").invokes("Sibling"));
        registry.load(vec![parent, echo("Sibling", json!(2))]).unwrap();

        let coverage = registry.executor("Parent").unwrap().coverage();
        assert_eq!(coverage.total_count(), 6);

        assert!(registry.unload("Leaf").unwrap_err().is_configuration());
        assert!(registry.unload("Parent").unwrap());
        assert!(registry.unload("Leaf").unwrap());
        assert!(!registry.unload("Leaf").unwrap());
    }

    #[test]
    fn test_zero_workers_rejected_at_build() {
        let config = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        assert!(FlowRegistry::new(ComponentRegistry::new(), config).is_err());
    }
}
