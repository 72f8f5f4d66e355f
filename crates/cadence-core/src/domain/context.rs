use std::collections::HashMap;

use crate::error::CoreError;
use crate::types::{FlowValue, Instance};

/// Values produced by the steps of one flow invocation, plus its input.
///
/// Steps without a result accessor contribute no value, but the instance
/// they ran against is tracked so that a later `from_step` reference can
/// still reach it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    input: FlowValue,
    values: HashMap<String, FlowValue>,
    instances: HashMap<String, Instance>,
}

impl ExecutionContext {
    /// Seed a context with the flow input
    pub fn new(input: FlowValue) -> Self {
        Self {
            input,
            values: HashMap::new(),
            instances: HashMap::new(),
        }
    }

    /// The flow input
    pub fn input(&self) -> &FlowValue {
        &self.input
    }

    /// Value produced by a step, if any
    pub fn get(&self, step: &str) -> Option<&FlowValue> {
        self.values.get(step)
    }

    /// Whether a step produced a value
    pub fn contains(&self, step: &str) -> bool {
        self.values.contains_key(step)
    }

    /// Store a step result
    pub fn insert(&mut self, step: impl Into<String>, value: FlowValue) {
        self.values.insert(step.into(), value);
    }

    /// Remember the instance a result-less step ran against
    pub fn track_instance(&mut self, step: impl Into<String>, instance: Instance) {
        self.instances.insert(step.into(), instance);
    }

    /// Instance tracked for a result-less step
    pub fn tracked_instance(&self, step: &str) -> Option<&Instance> {
        self.instances.get(step)
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no step stored a result yet
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Names of steps that stored a result
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// All stored results
    pub fn values(&self) -> &HashMap<String, FlowValue> {
        &self.values
    }

    /// What a later step sees when it references `step`: the stored result,
    /// or the raw instance when the step kept no result.
    pub fn resolve_step(&self, step: &str) -> Result<FlowValue, CoreError> {
        if let Some(value) = self.values.get(step) {
            return Ok(value.clone());
        }
        if let Some(instance) = self.instances.get(step) {
            return Ok(FlowValue::Instance(instance.clone()));
        }
        Err(CoreError::ConfigurationError(format!(
            "step '{}' has not produced a value",
            step
        )))
    }

    /// Like [`resolve_step`](Self::resolve_step) but requires an instance
    pub fn resolve_instance(&self, step: &str) -> Result<Instance, CoreError> {
        match self.resolve_step(step)? {
            FlowValue::Instance(instance) => Ok(instance),
            FlowValue::Data(_) => Err(CoreError::ConfigurationError(format!(
                "step '{}' produced data, not an instance",
                step
            ))),
        }
    }
}
