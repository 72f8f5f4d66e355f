use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::async_result::{AsyncCallback, AsyncTicket};
use crate::domain::context::ExecutionContext;
use crate::domain::coverage::CoverageNode;
use crate::domain::events::{AuditSink, StepCompleted, StepFailed, StepStarted};
use crate::domain::monitor::FlowMonitor;
use crate::domain::resolver::{Acquisition, BoundValue, ResolvedAccessor, ResolvedStep};
use crate::domain::resources::{self, Resource};
use crate::error::CoreError;
use crate::types::{AmbientContext, FlowId, FlowValue, Instance, InvocationId, StepId};

/// Runtime API handed to a step operation
pub type StepApi = Arc<dyn StepRuntimeApi>;

/// What an operation can reach while it runs
#[async_trait]
pub trait StepRuntimeApi: Send + Sync {
    /// Flow the step belongs to
    fn flow_name(&self) -> &str;

    /// The running step
    fn step_name(&self) -> &str;

    /// Invocation the step runs in
    fn invocation_id(&self) -> &InvocationId;

    /// The flow input
    fn flow_input(&self) -> &FlowValue;

    /// Ambient caller context
    fn ambient(&self) -> &AmbientContext;

    /// Ambient resource by name
    fn resource(&self, name: &str) -> Option<Resource>;

    /// Fired when a stop is requested; long waits should select on it
    fn stop_token(&self) -> CancellationToken;

    /// The stop signal to return after an interrupted wait
    fn stopped(&self) -> CoreError {
        CoreError::FlowStopped(self.flow_name().to_string())
    }

    /// Run a nested flow to completion under this step
    async fn invoke_flow(&self, flow: &str, input: FlowValue) -> Result<FlowValue, CoreError>;

    /// Dispatch a nested flow asynchronously under this step's monitor
    fn invoke_flow_async(
        &self,
        flow: &str,
        input: FlowValue,
        max_pending: Option<usize>,
        callback: AsyncCallback,
    ) -> Result<AsyncTicket, CoreError>;
}

impl dyn StepRuntimeApi {
    /// Typed resource lookup
    pub fn typed_resource<R: Any + Send + Sync>(&self, name: &str) -> Result<Arc<R>, CoreError> {
        resources::downcast_resource(name, self.resource(name))
    }
}

/// Executes one resolved step inside a flow invocation
pub struct StepExecutor<'a> {
    monitor: &'a FlowMonitor,
    audit: &'a dyn AuditSink,
}

impl<'a> StepExecutor<'a> {
    /// Executor for steps of the invocation controlled by `monitor`
    pub fn new(monitor: &'a FlowMonitor, audit: &'a dyn AuditSink) -> Self {
        Self { monitor, audit }
    }

    /// Run `step`: checkpoints, instance, bindings, operation, result.
    ///
    /// Returns the value stored for the step, if its accessor produces one.
    /// Failures propagate unchanged after the coverage node is left
    /// uncovered and the failure is audited.
    pub async fn execute(
        &self,
        step: &ResolvedStep,
        context: &mut ExecutionContext,
        coverage: &CoverageNode,
        api: StepApi,
    ) -> Result<Option<FlowValue>, CoreError> {
        let _current = self.monitor.enter_step(&step.name);
        self.monitor.check_stop()?;
        self.monitor.check_suspend().await?;

        debug!(
            flow = %self.monitor.flow_name(),
            step = %step.name,
            component = %step.component.name(),
            operation = %step.operation_name,
            "Executing step"
        );
        self.audit.record(Box::new(StepStarted {
            invocation_id: self.monitor.id().clone(),
            flow_id: FlowId(self.monitor.flow_name().to_string()),
            step_id: StepId(step.name.clone()),
            timestamp: Utc::now(),
        }));

        match self.run(step, context, api).await {
            Ok(result) => {
                if let Some(value) = &result {
                    context.insert(step.name.clone(), value.clone());
                }
                coverage.mark_covered();
                self.audit.record(Box::new(StepCompleted {
                    invocation_id: self.monitor.id().clone(),
                    flow_id: FlowId(self.monitor.flow_name().to_string()),
                    step_id: StepId(step.name.clone()),
                    result: result.as_ref().map(FlowValue::summary),
                    timestamp: Utc::now(),
                }));
                Ok(result)
            }
            Err(error) => {
                coverage.set_covered(false);
                if error.is_stop() && self.monitor.is_stop_requested() {
                    self.monitor.confirm_stopped();
                    debug!(
                        flow = %self.monitor.flow_name(),
                        step = %step.name,
                        "Step unwound after stop request"
                    );
                } else {
                    warn!(
                        flow = %self.monitor.flow_name(),
                        step = %step.name,
                        error = %error,
                        "Step failed"
                    );
                    self.audit.record(Box::new(StepFailed {
                        invocation_id: self.monitor.id().clone(),
                        flow_id: FlowId(self.monitor.flow_name().to_string()),
                        step_id: StepId(step.name.clone()),
                        error: error.to_string(),
                        timestamp: Utc::now(),
                    }));
                }
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        step: &ResolvedStep,
        context: &mut ExecutionContext,
        api: StepApi,
    ) -> Result<Option<FlowValue>, CoreError> {
        let instance = acquire_instance(step, context)?;

        for binding in &step.bindings {
            let value = match &binding.value {
                BoundValue::Literal(value) => value.clone(),
                BoundValue::FlowInput => context.input().clone(),
                BoundValue::Step(source) => context.resolve_step(source)?,
            };
            (binding.setter)(instance.clone(), value)
                .await
                .map_err(|error| {
                    CoreError::StepExecutionError(format!(
                        "step '{}': cannot set '{}': {}",
                        step.name, binding.property, error
                    ))
                })?;
        }

        (step.operation)(instance.clone(), api).await?;

        let result = match &step.accessor {
            ResolvedAccessor::None => {
                context.track_instance(step.name.clone(), instance);
                None
            }
            ResolvedAccessor::Instance => Some(FlowValue::Instance(instance)),
            ResolvedAccessor::Accessor { getter, .. } => Some(getter(instance).await?),
        };
        Ok(result)
    }
}

fn acquire_instance(step: &ResolvedStep, context: &ExecutionContext) -> Result<Instance, CoreError> {
    match &step.acquisition {
        Acquisition::New(factory) => factory().map_err(|error| {
            CoreError::ConfigurationError(format!(
                "step '{}': cannot construct '{}': {}",
                step.name,
                step.component.name(),
                error
            ))
        }),
        Acquisition::FromInput => context.input().as_instance().cloned().ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "step '{}': flow input is not an instance of '{}'",
                step.name,
                step.component.name()
            ))
        }),
        Acquisition::FromStep(source) => context.resolve_instance(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::component::{ComponentRegistry, ComponentType};
    use crate::domain::events::NoopAuditSink;
    use crate::domain::flow_definition::{FlowDefinition, StepDefinition};
    use crate::domain::resolver::{FlowResolver, ResolvedFlow};
    use crate::types::ValueKind;
    use serde_json::json;
    use std::collections::HashSet;

    struct BareApi {
        invocation: InvocationId,
        input: FlowValue,
        ambient: AmbientContext,
    }

    #[async_trait]
    impl StepRuntimeApi for BareApi {
        fn flow_name(&self) -> &str {
            "F"
        }

        fn step_name(&self) -> &str {
            "any"
        }

        fn invocation_id(&self) -> &InvocationId {
            &self.invocation
        }

        fn flow_input(&self) -> &FlowValue {
            &self.input
        }

        fn ambient(&self) -> &AmbientContext {
            &self.ambient
        }

        fn resource(&self, _name: &str) -> Option<Resource> {
            None
        }

        fn stop_token(&self) -> CancellationToken {
            CancellationToken::new()
        }

        async fn invoke_flow(&self, flow: &str, _input: FlowValue) -> Result<FlowValue, CoreError> {
            Err(CoreError::ConfigurationError(format!("no flow '{}'", flow)))
        }

        fn invoke_flow_async(
            &self,
            flow: &str,
            _input: FlowValue,
            _max_pending: Option<usize>,
            _callback: AsyncCallback,
        ) -> Result<AsyncTicket, CoreError> {
            Err(CoreError::ConfigurationError(format!("no flow '{}'", flow)))
        }
    }

    fn api() -> StepApi {
        Arc::new(BareApi {
            invocation: InvocationId::from("test"),
            input: FlowValue::null(),
            ambient: AmbientContext::new(),
        })
    }

    #[derive(Default)]
    struct Tally {
        hits: i64,
    }

    fn flow(definition: FlowDefinition) -> ResolvedFlow {
        let components = ComponentRegistry::new().with(
            ComponentType::<Tally>::new("Tally")
                .default_constructor()
                .operation("hit", |tally, _api| async move {
                    tally.lock().await.hits += 1;
                    Ok(())
                })
                .operation("explode", |_tally, _api| async move {
                    Err(CoreError::ComponentError("boom".into()))
                })
                .accessor("hits", ValueKind::Data, |t| FlowValue::from(json!(t.hits))),
        );
        FlowResolver::new(&components)
            .resolve(&definition, &HashSet::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_result_less_step_is_reachable_as_instance() {
        let flow = flow(
            FlowDefinition::new("F")
                .step(StepDefinition::new("A", "Tally", "hit"))
                .step(StepDefinition::new("B", "Tally", "hit").from_step("A").keep("hits")),
        );
        let monitor = FlowMonitor::new("F");
        let executor = StepExecutor::new(&monitor, &NoopAuditSink);
        let mut context = ExecutionContext::new(FlowValue::null());
        let node = CoverageNode::build(&crate::domain::coverage::CoverageShape::step("A", vec![]));

        let first = executor
            .execute(&flow.steps[0], &mut context, &node, api())
            .await
            .unwrap();
        assert!(first.is_none());
        assert!(context.get("A").is_none());
        assert!(node.is_covered());

        let second = executor
            .execute(&flow.steps[1], &mut context, &node, api())
            .await
            .unwrap();
        assert_eq!(second, Some(FlowValue::from(json!(2))));
        assert_eq!(context.get("B"), Some(&FlowValue::from(json!(2))));
        assert!(monitor.current_step().is_none());
    }

    #[tokio::test]
    async fn test_failure_leaves_step_uncovered() {
        let flow = flow(FlowDefinition::new("G").step(StepDefinition::new("X", "Tally", "explode")));
        let monitor = FlowMonitor::new("G");
        let executor = StepExecutor::new(&monitor, &NoopAuditSink);
        let mut context = ExecutionContext::new(FlowValue::null());
        let node = CoverageNode::build(&crate::domain::coverage::CoverageShape::step("X", vec![]));
        node.mark_covered();

        let error = executor
            .execute(&flow.steps[0], &mut context, &node, api())
            .await
            .unwrap_err();
        assert_eq!(error, CoreError::ComponentError("boom".into()));
        assert!(!node.is_covered());
        assert!(context.is_empty());
        assert!(monitor.current_step().is_none());
        assert!(!monitor.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_wins_before_any_work() {
        let flow = flow(FlowDefinition::new("F").step(StepDefinition::new("A", "Tally", "hit").keep_instance()));
        let monitor = FlowMonitor::new("F");
        monitor.suspend();
        monitor.stop();
        let executor = StepExecutor::new(&monitor, &NoopAuditSink);
        let mut context = ExecutionContext::new(FlowValue::null());
        let node = CoverageNode::build(&crate::domain::coverage::CoverageShape::step("A", vec![]));

        let error = executor
            .execute(&flow.steps[0], &mut context, &node, api())
            .await
            .unwrap_err();
        assert!(error.is_stop());
        assert!(monitor.is_stopped());
        assert!(context.is_empty());
        assert!(!node.is_covered());
    }
}
