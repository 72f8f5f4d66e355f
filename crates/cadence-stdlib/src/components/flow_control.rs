//! Components that wait or call other flows.

use cadence_core::{AsyncResult, ComponentType, CoreError, FlowValue, InvocationStatus, ValueKind};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{info, warn};

/// Sleeps for a fixed time; a stop request cuts the wait short
#[derive(Debug, Default)]
pub struct Delay {
    millis: u64,
}

/// The `Delay` component type
pub fn delay_component() -> ComponentType<Delay> {
    ComponentType::<Delay>::new("Delay")
        .default_constructor()
        .property("millis", ValueKind::Data, |delay, value| {
            delay.millis = value.as_data().and_then(JsonValue::as_u64).ok_or_else(|| {
                CoreError::ComponentError(format!(
                    "millis must be a non-negative integer, got {}",
                    value.summary()
                ))
            })?;
            Ok(())
        })
        .operation("wait", |delay, api| async move {
            let millis = delay.lock().await.millis;
            let stop = api.stop_token();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
                _ = stop.cancelled() => Err(api.stopped()),
            }
        })
}

/// Runs another flow, to completion or on the worker pool
#[derive(Debug, Default)]
pub struct SubFlow {
    flow: String,
    input: Option<FlowValue>,
    max_pending: Option<usize>,
    result: Option<FlowValue>,
    invocation: Option<String>,
}

/// The `SubFlow` component type
pub fn sub_flow_component() -> ComponentType<SubFlow> {
    ComponentType::<SubFlow>::new("SubFlow")
        .default_constructor()
        .property("flow", ValueKind::Data, |sub_flow, value| {
            sub_flow.flow = value
                .as_data()
                .and_then(JsonValue::as_str)
                .ok_or_else(|| CoreError::ComponentError("flow must be a string".into()))?
                .to_string();
            Ok(())
        })
        .property("input", ValueKind::Any, |sub_flow, value| {
            sub_flow.input = Some(value);
            Ok(())
        })
        .property("max_pending", ValueKind::Data, |sub_flow, value| {
            let limit = value
                .as_data()
                .and_then(JsonValue::as_u64)
                .and_then(|limit| usize::try_from(limit).ok())
                .ok_or_else(|| {
                    CoreError::ComponentError(format!(
                        "max_pending must be a non-negative integer, got {}",
                        value.summary()
                    ))
                })?;
            sub_flow.max_pending = Some(limit);
            Ok(())
        })
        .operation("invoke", |sub_flow, api| async move {
            let mut sub_flow = sub_flow.lock().await;
            let input = sub_flow.input.clone().unwrap_or_else(FlowValue::null);
            let result = api.invoke_flow(&sub_flow.flow, input).await?;
            sub_flow.result = Some(result);
            Ok(())
        })
        .operation("dispatch", |sub_flow, api| async move {
            let mut sub_flow = sub_flow.lock().await;
            let input = sub_flow.input.clone().unwrap_or_else(FlowValue::null);
            let ticket = api.invoke_flow_async(
                &sub_flow.flow,
                input,
                sub_flow.max_pending,
                Box::new(log_async_result),
            )?;
            sub_flow.invocation = Some(ticket.id().to_string());
            Ok(())
        })
        .accessor("result", ValueKind::Any, |sub_flow| {
            sub_flow.result.clone().unwrap_or_else(FlowValue::null)
        })
        .accessor("invocation", ValueKind::Data, |sub_flow| {
            FlowValue::data(json!(sub_flow.invocation))
        })
}

fn log_async_result(result: AsyncResult) {
    match (result.status(), result.failure()) {
        (_, Some(error)) => warn!(
            flow = %result.flow(),
            invocation = %result.invocation(),
            error = %error,
            "Dispatched flow failed"
        ),
        (InvocationStatus::Stopped, None) => info!(
            flow = %result.flow(),
            invocation = %result.invocation(),
            "Dispatched flow stopped"
        ),
        (_, None) => info!(
            flow = %result.flow(),
            invocation = %result.invocation(),
            output = %result.output().map(FlowValue::summary).unwrap_or_default(),
            "Dispatched flow completed"
        ),
    }
}
