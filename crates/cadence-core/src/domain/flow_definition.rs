use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::types::ValueKind;

/// Where a step gets the instance its operation runs against
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSource {
    /// Construct a fresh instance
    #[default]
    New,
    /// Reuse the flow input
    FromInput,
    /// Reuse what an earlier step produced
    FromStep(String),
}

/// Where a bound property value comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    /// A literal JSON value
    Literal(serde_json::Value),
    /// The flow input
    FlowInput,
    /// An earlier step's result
    Step(String),
}

/// Binds one settable property of the step's instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterBinding {
    /// Property name
    pub property: String,
    /// Value source
    pub source: BindingSource,
}

/// What a step keeps as its result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultAccessor {
    /// Nothing retrievable
    #[default]
    None,
    /// The instance itself
    #[serde(rename = "self")]
    Instance,
    /// A named accessor of the instance
    Accessor(String),
}

/// One configured operation invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// Unique within the flow
    pub name: String,
    /// Registered component type
    pub component: String,
    /// Operation of the component type
    pub operation: String,
    /// Instance acquisition
    #[serde(default)]
    pub instance: InstanceSource,
    /// Applied in order before the operation runs
    #[serde(default)]
    pub bindings: Vec<ParameterBinding>,
    /// Result accessor
    #[serde(default)]
    pub result: ResultAccessor,
    /// Flows this step may invoke
    #[serde(default)]
    pub sub_flows: Vec<String>,
}

impl StepDefinition {
    /// A step constructing a new instance and keeping no result
    pub fn new(
        name: impl Into<String>,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            operation: operation.into(),
            instance: InstanceSource::New,
            bindings: Vec::new(),
            result: ResultAccessor::None,
            sub_flows: Vec::new(),
        }
    }

    /// Run against the flow input
    pub fn from_input(mut self) -> Self {
        self.instance = InstanceSource::FromInput;
        self
    }

    /// Run against what `step` produced
    pub fn from_step(mut self, step: impl Into<String>) -> Self {
        self.instance = InstanceSource::FromStep(step.into());
        self
    }

    /// Bind a property
    pub fn bind(mut self, property: impl Into<String>, source: BindingSource) -> Self {
        self.bindings.push(ParameterBinding {
            property: property.into(),
            source,
        });
        self
    }

    /// Bind a property to a literal
    pub fn literal(self, property: impl Into<String>, value: serde_json::Value) -> Self {
        self.bind(property, BindingSource::Literal(value))
    }

    /// Keep the instance as the result
    pub fn keep_instance(mut self) -> Self {
        self.result = ResultAccessor::Instance;
        self
    }

    /// Keep a named accessor's value as the result
    pub fn keep(mut self, accessor: impl Into<String>) -> Self {
        self.result = ResultAccessor::Accessor(accessor.into());
        self
    }

    /// Declare a flow this step invokes
    pub fn invokes(mut self, flow: impl Into<String>) -> Self {
        self.sub_flows.push(flow.into());
        self
    }

    /// Steps this step depends on, in binding order
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        if let InstanceSource::FromStep(step) = &self.instance {
            refs.push(step.as_str());
        }
        for binding in &self.bindings {
            if let BindingSource::Step(step) = &binding.source {
                refs.push(step.as_str());
            }
        }
        refs
    }
}

/// A named, ordered sequence of steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    /// Flow name
    pub name: String,
    /// Human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Kind of input the flow expects
    #[serde(default)]
    pub input: ValueKind,
    /// Steps in execution order
    pub steps: Vec<StepDefinition>,
}

impl FlowDefinition {
    /// An empty flow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input: ValueKind::Any,
            steps: Vec::new(),
        }
    }

    /// Declare the expected input kind
    pub fn with_input(mut self, kind: ValueKind) -> Self {
        self.input = kind;
        self
    }

    /// Append a step
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Every nested flow referenced by any step
    pub fn sub_flow_names(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|step| step.sub_flows.iter().map(String::as_str))
    }

    /// Checks that need no component registry: names, uniqueness and
    /// backward-only step references.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ConfigurationError("flow name must not be empty".into()));
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(CoreError::ConfigurationError(format!(
                    "flow '{}': step #{} has an empty name",
                    self.name, index
                )));
            }
            if positions.insert(step.name.as_str(), index).is_some() {
                return Err(CoreError::ConfigurationError(format!(
                    "flow '{}': duplicate step name '{}'",
                    self.name, step.name
                )));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            for reference in step.references() {
                match positions.get(reference) {
                    None => {
                        return Err(CoreError::ConfigurationError(format!(
                            "flow '{}': step '{}' references unknown step '{}'",
                            self.name, step.name, reference
                        )))
                    }
                    Some(&target) if target >= index => {
                        return Err(CoreError::ConfigurationError(format!(
                            "flow '{}': step '{}' references step '{}' which does not run before it",
                            self.name, step.name, reference
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// A file worth of flow definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowDocument {
    /// The flows
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

impl FlowDocument {
    /// Parse a YAML document.
    ///
    /// Enum values with a payload are written as single-key maps
    /// (`from_step: A`, `literal: 2`, `instance: Counter`); unit variants as
    /// plain strings (`flow_input`, `self`).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml);
        Ok(serde_yaml::with::singleton_map_recursive::deserialize(deserializer)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DOCUMENT: &str = r#"
flows:
  - name: F
    input: data
    steps:
      - name: A
        component: Counter
        operation: increment
        bindings:
          - property: step
            source:
              literal: 2
          - property: seed
            source: flow_input
      - name: B
        component: Counter
        operation: increment
        instance:
          from_step: A
        result: self
      - name: C
        component: Counter
        operation: report
        instance: from_input
        bindings:
          - property: other
            source:
              step: B
        result:
          accessor: total
        sub_flows: [G]
"#;

    #[test]
    fn test_parse_yaml_document() {
        let document = FlowDocument::from_yaml_str(DOCUMENT).unwrap();
        let flow = &document.flows[0];
        let expected = FlowDefinition::new("F")
            .with_input(ValueKind::Data)
            .step(
                StepDefinition::new("A", "Counter", "increment")
                    .literal("step", json!(2))
                    .bind("seed", BindingSource::FlowInput),
            )
            .step(
                StepDefinition::new("B", "Counter", "increment")
                    .from_step("A")
                    .keep_instance(),
            )
            .step(
                StepDefinition::new("C", "Counter", "report")
                    .from_input()
                    .bind("other", BindingSource::Step("B".into()))
                    .keep("total")
                    .invokes("G"),
            );
        assert_eq!(flow, &expected);
        assert!(flow.validate().is_ok());
        assert_eq!(flow.sub_flow_names().collect::<Vec<_>>(), vec!["G"]);
    }

    #[test]
    fn test_json_document_round_trip() {
        let document = FlowDocument::from_yaml_str(DOCUMENT).unwrap();
        let json = serde_json::to_string(&document).unwrap();
        assert_eq!(FlowDocument::from_json_str(&json).unwrap(), document);
    }

    #[test]
    fn test_duplicate_step_name() {
        let flow = FlowDefinition::new("F")
            .step(StepDefinition::new("A", "Counter", "increment"))
            .step(StepDefinition::new("A", "Counter", "increment"));
        let error = flow.validate().unwrap_err();
        assert_eq!(
            error,
            CoreError::ConfigurationError("flow 'F': duplicate step name 'A'".into())
        );
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let flow = FlowDefinition::new("F")
            .step(StepDefinition::new("A", "Counter", "increment").from_step("B"))
            .step(StepDefinition::new("B", "Counter", "increment"));
        assert!(flow.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_self_and_unknown_references_are_rejected() {
        let own = FlowDefinition::new("F").step(
            StepDefinition::new("A", "Counter", "increment")
                .bind("step", BindingSource::Step("A".into())),
        );
        assert!(own.validate().is_err());

        let unknown = FlowDefinition::new("F")
            .step(StepDefinition::new("A", "Counter", "increment").from_step("ghost"));
        let message = unknown.validate().unwrap_err().to_string();
        assert!(message.contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_empty_names_are_rejected() {
        assert!(FlowDefinition::new(" ").validate().is_err());
        let flow = FlowDefinition::new("F").step(StepDefinition::new("", "Counter", "increment"));
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_yaml_instance_input_and_map_literal() {
        let document = FlowDocument::from_yaml_str(
            r#"
flows:
  - name: Wrap
    input:
      instance: Counter
    steps:
      - name: Tag
        component: Counter
        operation: increment
        instance: from_input
        bindings:
          - property: labels
            source:
              literal:
                from_step: not-an-enum
                count: 2
        result:
          accessor: total
"#,
        )
        .unwrap();

        let expected = FlowDefinition::new("Wrap")
            .with_input(ValueKind::Instance("Counter".into()))
            .step(
                StepDefinition::new("Tag", "Counter", "increment")
                    .from_input()
                    .literal("labels", json!({"from_step": "not-an-enum", "count": 2}))
                    .keep("total"),
            );
        assert_eq!(document.flows, vec![expected]);
    }

    #[test]
    fn test_yaml_rejects_unknown_source() {
        let error = FlowDocument::from_yaml_str(
            "flows:\n  - name: F\n    steps:\n      - name: A\n        component: C\n        operation: o\n        instance:\n          from_nowhere: A\n",
        )
        .unwrap_err();
        assert!(matches!(error, CoreError::SerializationError(_)));
    }
}
