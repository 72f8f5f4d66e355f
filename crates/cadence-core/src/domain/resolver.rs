//! Load-time resolution of flow definitions against a component registry.
//!
//! Every name a definition mentions is looked up here, exactly once. A
//! flow that resolves cleanly can no longer fail for configuration reasons
//! during execution, apart from values whose kind is only known at runtime.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::domain::component::{
    AccessorFn, ComponentDescriptor, ComponentRegistry, FactoryFn, OperationFn, SetterFn,
};
use crate::domain::coverage::CoverageShape;
use crate::domain::flow_definition::{
    BindingSource, FlowDefinition, InstanceSource, ResultAccessor, StepDefinition,
};
use crate::error::CoreError;
use crate::types::{FlowValue, ValueKind};

/// Resolved instance acquisition
#[derive(Clone)]
pub enum Acquisition {
    /// Construct with the registered factory
    New(FactoryFn),
    /// Reuse the flow input
    FromInput,
    /// Reuse an earlier step's result or instance
    FromStep(String),
}

/// Resolved binding value source
#[derive(Debug, Clone)]
pub enum BoundValue {
    /// Literal data
    Literal(FlowValue),
    /// The flow input
    FlowInput,
    /// An earlier step's result or instance
    Step(String),
}

/// One resolved property binding
#[derive(Clone)]
pub struct ResolvedBinding {
    /// Property name
    pub property: String,
    /// Resolved setter
    pub setter: SetterFn,
    /// Value source
    pub value: BoundValue,
}

/// Resolved result accessor
#[derive(Clone)]
pub enum ResolvedAccessor {
    /// No result kept
    None,
    /// The instance itself
    Instance,
    /// A named accessor
    Accessor {
        /// Accessor name
        name: String,
        /// Resolved getter
        getter: AccessorFn,
    },
}

/// A step with every reference resolved to a callable handle
#[derive(Clone)]
pub struct ResolvedStep {
    /// Step name
    pub name: String,
    /// Component type
    pub component: Arc<ComponentDescriptor>,
    /// Operation name
    pub operation_name: String,
    /// Resolved operation
    pub operation: OperationFn,
    /// Instance acquisition
    pub acquisition: Acquisition,
    /// Bindings in application order
    pub bindings: Vec<ResolvedBinding>,
    /// Result accessor
    pub accessor: ResolvedAccessor,
    /// Flows this step may invoke
    pub sub_flows: Vec<String>,
}

impl fmt::Debug for ResolvedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let acquisition = match &self.acquisition {
            Acquisition::New(_) => "new".to_string(),
            Acquisition::FromInput => "from_input".to_string(),
            Acquisition::FromStep(step) => format!("from_step({})", step),
        };
        let accessor = match &self.accessor {
            ResolvedAccessor::None => "none",
            ResolvedAccessor::Instance => "self",
            ResolvedAccessor::Accessor { name, .. } => name.as_str(),
        };
        f.debug_struct("ResolvedStep")
            .field("name", &self.name)
            .field("component", &self.component.name())
            .field("operation", &self.operation_name)
            .field("acquisition", &acquisition)
            .field(
                "bindings",
                &self.bindings.iter().map(|b| &b.property).collect::<Vec<_>>(),
            )
            .field("accessor", &accessor)
            .field("sub_flows", &self.sub_flows)
            .finish()
    }
}

/// A flow ready to execute
#[derive(Debug, Clone)]
pub struct ResolvedFlow {
    /// Flow name
    pub name: String,
    /// Expected input kind
    pub input: ValueKind,
    /// Steps in execution order
    pub steps: Vec<ResolvedStep>,
}

impl ResolvedFlow {
    /// Names of every flow the steps may invoke
    pub fn sub_flows(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|step| step.sub_flows.iter().map(String::as_str))
    }
}

/// Resolves flow definitions against a component registry
pub struct FlowResolver<'a> {
    components: &'a ComponentRegistry,
}

impl<'a> FlowResolver<'a> {
    /// Resolver over `components`
    pub fn new(components: &'a ComponentRegistry) -> Self {
        Self { components }
    }

    /// Resolve one flow. `known_flows` are the names nested flow references
    /// may point at.
    pub fn resolve(
        &self,
        definition: &FlowDefinition,
        known_flows: &HashSet<String>,
    ) -> Result<ResolvedFlow, CoreError> {
        definition.validate()?;

        // Kind each earlier step makes available to later references
        let mut produced: HashMap<&str, ValueKind> = HashMap::new();
        let mut steps = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let resolved = self.resolve_step(definition, step, &produced, known_flows)?;
            produced.insert(step.name.as_str(), produced_kind(&resolved));
            steps.push(resolved);
        }

        Ok(ResolvedFlow {
            name: definition.name.clone(),
            input: definition.input.clone(),
            steps,
        })
    }

    fn resolve_step(
        &self,
        flow: &FlowDefinition,
        step: &StepDefinition,
        produced: &HashMap<&str, ValueKind>,
        known_flows: &HashSet<String>,
    ) -> Result<ResolvedStep, CoreError> {
        let fail = |message: String| {
            CoreError::ConfigurationError(format!(
                "flow '{}', step '{}': {}",
                flow.name, step.name, message
            ))
        };

        let component = self
            .components
            .get(&step.component)
            .ok_or_else(|| fail(format!("unknown component type '{}'", step.component)))?;

        let operation = component.operation(&step.operation).cloned().ok_or_else(|| {
            fail(format!(
                "component '{}' has no operation '{}' (available: {})",
                step.component,
                step.operation,
                component.operation_names().join(", ")
            ))
        })?;

        let instance_kind = component.instance_kind();
        let acquisition = match &step.instance {
            InstanceSource::New => {
                let factory = component.factory().cloned().ok_or_else(|| {
                    fail(format!("component '{}' cannot be constructed", step.component))
                })?;
                Acquisition::New(factory)
            }
            InstanceSource::FromInput => {
                if !instance_kind.accepts(&flow.input) {
                    return Err(fail(format!(
                        "flow input is {}, operation needs {}",
                        flow.input, instance_kind
                    )));
                }
                Acquisition::FromInput
            }
            InstanceSource::FromStep(source) => {
                let offered = lookup_produced(produced, source).map_err(&fail)?;
                if !instance_kind.accepts(offered) {
                    return Err(fail(format!(
                        "step '{}' produces {}, operation needs {}",
                        source, offered, instance_kind
                    )));
                }
                Acquisition::FromStep(source.clone())
            }
        };

        let mut bindings = Vec::with_capacity(step.bindings.len());
        for binding in &step.bindings {
            let property = component.property(&binding.property).ok_or_else(|| {
                fail(format!(
                    "component '{}' has no property '{}'",
                    step.component, binding.property
                ))
            })?;
            let (offered, value) = match &binding.source {
                BindingSource::Literal(literal) => {
                    (ValueKind::Data, BoundValue::Literal(FlowValue::data(literal.clone())))
                }
                BindingSource::FlowInput => (flow.input.clone(), BoundValue::FlowInput),
                BindingSource::Step(source) => (
                    lookup_produced(produced, source).map_err(&fail)?.clone(),
                    BoundValue::Step(source.clone()),
                ),
            };
            if !property.kind.accepts(&offered) {
                return Err(fail(format!(
                    "property '{}' expects {}, bound value is {}",
                    binding.property, property.kind, offered
                )));
            }
            bindings.push(ResolvedBinding {
                property: binding.property.clone(),
                setter: property.setter.clone(),
                value,
            });
        }

        let accessor = match &step.result {
            ResultAccessor::None => ResolvedAccessor::None,
            ResultAccessor::Instance => ResolvedAccessor::Instance,
            ResultAccessor::Accessor(name) => {
                let handle = component.accessor(name).ok_or_else(|| {
                    fail(format!(
                        "component '{}' has no accessor '{}'",
                        step.component, name
                    ))
                })?;
                ResolvedAccessor::Accessor {
                    name: name.clone(),
                    getter: handle.getter.clone(),
                }
            }
        };

        for sub_flow in &step.sub_flows {
            if !known_flows.contains(sub_flow) {
                return Err(fail(format!("unknown nested flow '{}'", sub_flow)));
            }
        }

        Ok(ResolvedStep {
            name: step.name.clone(),
            component,
            operation_name: step.operation.clone(),
            operation,
            acquisition,
            bindings,
            accessor,
            sub_flows: step.sub_flows.clone(),
        })
    }
}

fn lookup_produced<'k>(
    produced: &'k HashMap<&str, ValueKind>,
    step: &str,
) -> Result<&'k ValueKind, String> {
    produced
        .get(step)
        .ok_or_else(|| format!("step '{}' does not run earlier in this flow", step))
}

/// What a later step sees when referencing this one
fn produced_kind(step: &ResolvedStep) -> ValueKind {
    match &step.accessor {
        ResolvedAccessor::None | ResolvedAccessor::Instance => step.component.instance_kind(),
        ResolvedAccessor::Accessor { name, .. } => step
            .component
            .accessor(name)
            .map(|handle| handle.kind.clone())
            .unwrap_or_default(),
    }
}

/// Coverage shape of `flow`: the flow, its steps, and below each step the
/// shapes of the flows it declares. A flow already on the current path is
/// not expanded again.
pub fn coverage_shape(
    flow: &ResolvedFlow,
    flows: &HashMap<String, Arc<ResolvedFlow>>,
) -> CoverageShape {
    let mut path = vec![flow.name.clone()];
    shape_with_path(flow, flows, &mut path)
}

fn shape_with_path(
    flow: &ResolvedFlow,
    flows: &HashMap<String, Arc<ResolvedFlow>>,
    path: &mut Vec<String>,
) -> CoverageShape {
    let steps = flow
        .steps
        .iter()
        .map(|step| {
            let mut nested = Vec::new();
            for name in &step.sub_flows {
                if path.contains(name) {
                    continue;
                }
                if let Some(sub_flow) = flows.get(name) {
                    path.push(name.clone());
                    nested.push(shape_with_path(sub_flow, flows, path));
                    path.pop();
                }
            }
            CoverageShape::step(step.name.clone(), nested)
        })
        .collect();
    CoverageShape::flow(flow.name.clone(), steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::component::ComponentType;
    use crate::domain::coverage::CoverageKind;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        total: i64,
    }

    #[derive(Default)]
    struct Sink;

    fn registry() -> ComponentRegistry {
        ComponentRegistry::new()
            .with(
                ComponentType::<Counter>::new("Counter")
                    .default_constructor()
                    .property("total", ValueKind::Data, |c, v| {
                        c.total = v.as_data().and_then(|d| d.as_i64()).unwrap_or(0);
                        Ok(())
                    })
                    .property("peer", ValueKind::Instance("Counter".into()), |_, _| Ok(()))
                    .operation("increment", |counter, _api| async move {
                        counter.lock().await.total += 1;
                        Ok(())
                    })
                    .accessor("total", ValueKind::Data, |c| FlowValue::from(json!(c.total))),
            )
            .with(
                ComponentType::<Sink>::new("Sink")
                    .operation("drain", |_sink, _api| async move { Ok(()) }),
            )
    }

    fn resolve(flow: FlowDefinition) -> Result<ResolvedFlow, CoreError> {
        let known: HashSet<String> = ["Sub".to_string()].into_iter().collect();
        FlowResolver::new(&registry()).resolve(&flow, &known)
    }

    fn step(name: &str) -> StepDefinition {
        StepDefinition::new(name, "Counter", "increment")
    }

    #[test]
    fn test_resolves_valid_flow() {
        let flow = resolve(
            FlowDefinition::new("F")
                .step(step("A").literal("total", json!(3)))
                .step(step("B").from_step("A").keep_instance())
                .step(step("C").bind("peer", BindingSource::Step("B".into())).keep("total"))
                .step(step("D").invokes("Sub")),
        )
        .unwrap();
        assert_eq!(flow.steps.len(), 4);
        assert!(matches!(flow.steps[1].acquisition, Acquisition::FromStep(ref s) if s == "A"));
        assert_eq!(flow.sub_flows().collect::<Vec<_>>(), vec!["Sub"]);
    }

    fn error_of(flow: FlowDefinition) -> String {
        let error = resolve(flow).unwrap_err();
        assert!(error.is_configuration(), "unexpected error kind: {error}");
        error.to_string()
    }

    #[test]
    fn test_unknown_names_fail_at_load() {
        assert!(error_of(FlowDefinition::new("F").step(StepDefinition::new("A", "Ghost", "x")))
            .contains("unknown component type 'Ghost'"));
        assert!(error_of(FlowDefinition::new("F").step(StepDefinition::new("A", "Counter", "x")))
            .contains("has no operation 'x'"));
        assert!(error_of(FlowDefinition::new("F").step(step("A").literal("nope", json!(1))))
            .contains("has no property 'nope'"));
        assert!(error_of(FlowDefinition::new("F").step(step("A").keep("nope")))
            .contains("has no accessor 'nope'"));
        assert!(error_of(FlowDefinition::new("F").step(step("A").invokes("Missing")))
            .contains("unknown nested flow 'Missing'"));
    }

    #[test]
    fn test_incompatible_bindings_fail_at_load() {
        let literal_to_instance = FlowDefinition::new("F").step(step("A").literal("peer", json!(1)));
        assert!(error_of(literal_to_instance).contains("property 'peer' expects instance<Counter>"));

        let data_result_as_instance = FlowDefinition::new("F")
            .step(step("A").keep("total"))
            .step(step("B").from_step("A"));
        assert!(error_of(data_result_as_instance).contains("step 'A' produces data"));

        let data_input = FlowDefinition::new("F")
            .with_input(ValueKind::Data)
            .step(step("A").from_input());
        assert!(error_of(data_input).contains("flow input is data"));
    }

    #[test]
    fn test_instance_type_must_match() {
        let flow = FlowDefinition::new("F")
            .step(step("A"))
            .step(StepDefinition::new("B", "Sink", "drain").from_step("A"));
        assert!(error_of(flow).contains("operation needs instance<Sink>"));
    }

    #[test]
    fn test_sink_without_constructor() {
        let flow = FlowDefinition::new("F").step(StepDefinition::new("A", "Sink", "drain"));
        assert!(error_of(flow).contains("cannot be constructed"));
    }

    #[test]
    fn test_coverage_shape_nests_and_stops_at_recursion() {
        let sub = Arc::new(resolve(FlowDefinition::new("Sub").step(step("S1").invokes("Sub"))).unwrap());
        let main = resolve(FlowDefinition::new("F").step(step("A").invokes("Sub"))).unwrap();
        let flows: HashMap<String, Arc<ResolvedFlow>> =
            [("Sub".to_string(), sub)].into_iter().collect();

        let shape = coverage_shape(&main, &flows);
        assert_eq!(shape.children.len(), 1);
        let nested = &shape.children[0].children[0];
        assert_eq!(nested.kind, CoverageKind::Flow);
        assert_eq!(nested.name, "Sub");
        assert!(nested.children[0].children.is_empty());
    }
}
