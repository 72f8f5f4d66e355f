//! Components that hold, format and reshape data.

use cadence_core::{ComponentType, CoreError, FlowValue, ValueKind};
use serde_json::{Map, Value as JsonValue};

/// Holds one value and hands it on
#[derive(Debug, Default)]
pub struct Value {
    value: Option<FlowValue>,
}

/// The `Value` component type
pub fn value_component() -> ComponentType<Value> {
    ComponentType::<Value>::new("Value")
        .default_constructor()
        .property("value", ValueKind::Any, |holder, value| {
            holder.value = Some(value);
            Ok(())
        })
        .operation("emit", |_holder, _api| async move { Ok(()) })
        .accessor("value", ValueKind::Any, |holder| {
            holder.value.clone().unwrap_or_else(FlowValue::null)
        })
}

/// Fills `{name}` placeholders from its variables, or from the flow input
/// when no variables were bound
#[derive(Debug, Default)]
pub struct Template {
    template: String,
    vars: Option<Map<String, JsonValue>>,
    text: String,
}

/// The `Template` component type
pub fn template_component() -> ComponentType<Template> {
    ComponentType::<Template>::new("Template")
        .default_constructor()
        .property("template", ValueKind::Data, |template, value| {
            template.template = value
                .as_data()
                .and_then(JsonValue::as_str)
                .ok_or_else(|| CoreError::ComponentError("template must be a string".into()))?
                .to_string();
            Ok(())
        })
        .property("vars", ValueKind::Data, |template, value| {
            let vars = value.as_data().and_then(JsonValue::as_object).ok_or_else(|| {
                CoreError::ComponentError(format!("vars must be an object, got {}", value.summary()))
            })?;
            template.vars = Some(vars.clone());
            Ok(())
        })
        .operation("render", |template, api| async move {
            let mut template = template.lock().await;
            let fallback = api.flow_input().as_data().and_then(JsonValue::as_object).cloned();
            let vars = template.vars.clone().or(fallback).unwrap_or_default();
            template.text = render(&template.template, &vars);
            Ok(())
        })
        .accessor("text", ValueKind::Data, |template| {
            FlowValue::data(JsonValue::String(template.text.clone()))
        })
}

/// Replace every `{key}` with the matching variable; strings are inserted
/// bare, other values as JSON. Unknown keys are left as they are.
pub fn render(template: &str, vars: &Map<String, JsonValue>) -> String {
    let mut text = template.to_string();
    for (key, value) in vars {
        let replacement = match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        text = text.replace(&format!("{{{}}}", key), &replacement);
    }
    text
}

/// Evaluates a JMESPath expression against its data, or the flow input
#[derive(Debug, Default)]
pub struct Select {
    expression: String,
    data: Option<JsonValue>,
    result: JsonValue,
}

/// The `Select` component type
pub fn select_component() -> ComponentType<Select> {
    ComponentType::<Select>::new("Select")
        .default_constructor()
        .property("expression", ValueKind::Data, |select, value| {
            let expression = value
                .as_data()
                .and_then(JsonValue::as_str)
                .ok_or_else(|| CoreError::ComponentError("expression must be a string".into()))?;
            jmespath::compile(expression).map_err(|e| {
                CoreError::ComponentError(format!("Failed to compile JMESPath expression: {}", e))
            })?;
            select.expression = expression.to_string();
            Ok(())
        })
        .property("data", ValueKind::Data, |select, value| {
            select.data = value.as_data().cloned();
            Ok(())
        })
        .operation("search", |select, api| async move {
            let mut select = select.lock().await;
            let data = match &select.data {
                Some(data) => data.clone(),
                None => api.flow_input().as_data().cloned().unwrap_or_default(),
            };
            select.result = search(&select.expression, &data)?;
            Ok(())
        })
        .accessor("result", ValueKind::Data, |select| FlowValue::data(select.result.clone()))
}

/// Evaluate `expression` against `data`
pub fn search(expression: &str, data: &JsonValue) -> Result<JsonValue, CoreError> {
    let compiled = jmespath::compile(expression).map_err(|e| {
        CoreError::ComponentError(format!("Failed to compile JMESPath expression: {}", e))
    })?;
    let found = compiled.search(data.clone()).map_err(|e| {
        CoreError::ComponentError(format!("Failed to evaluate JMESPath expression: {}", e))
    })?;
    Ok(serde_json::to_value(&*found)?)
}
