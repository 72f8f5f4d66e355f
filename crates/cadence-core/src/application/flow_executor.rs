//! Drives the steps of one flow, synchronously or on the worker pool.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::application::flow_registry::{EngineServices, FlowRegistry};
use crate::domain::async_result::{AsyncCallback, AsyncResult, AsyncTicket, PendingAsync};
use crate::domain::context::ExecutionContext;
use crate::domain::coverage::{CoverageNode, CoverageShape};
use crate::domain::events::{FlowCompleted, FlowFailed, FlowStarted, FlowStopped};
use crate::domain::monitor::FlowMonitor;
use crate::domain::outcome::{FlowOutcome, InvocationStatus};
use crate::domain::resolver::ResolvedFlow;
use crate::domain::resources::Resource;
use crate::domain::step::{StepApi, StepExecutor, StepRuntimeApi};
use crate::error::CoreError;
use crate::types::{AmbientContext, FlowId, FlowValue, InvocationId};

/// Runs once an asynchronous invocation has settled, delivered or not
pub type SettleHook = Box<dyn FnOnce() + Send + 'static>;

/// Where an asynchronous invocation is attached
pub(crate) struct AsyncTarget {
    /// Monitor of the new invocation
    pub monitor: Arc<FlowMonitor>,
    /// Monitor whose cancel discards the result; only the ticket can when absent
    pub registrar: Option<Arc<FlowMonitor>>,
    /// Coverage tree to record into; a fresh one when absent
    pub coverage: Option<Arc<CoverageNode>>,
    /// Called after settling
    pub on_settled: Option<SettleHook>,
}

impl AsyncTarget {
    pub(crate) fn detached(monitor: Arc<FlowMonitor>) -> Self {
        Self {
            monitor,
            registrar: None,
            coverage: None,
            on_settled: None,
        }
    }
}

/// Ends the monitor even when the invocation future is dropped
struct EndOnDrop<'a>(&'a FlowMonitor);

impl Drop for EndOnDrop<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Gives back the admission slot and forgets the pending handle however
/// settling ends
struct Settlement<'a> {
    pending: &'a AtomicUsize,
    registrar: Option<Arc<FlowMonitor>>,
    handle: Arc<PendingAsync>,
    on_settled: Option<SettleHook>,
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        if let Some(registrar) = &self.registrar {
            registrar.remove_pending(self.handle.id());
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if let Some(hook) = self.on_settled.take() {
            hook();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match panic.downcast_ref::<&str>() {
        Some(message) => (*message).to_string(),
        None => panic
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// Executor for one loaded flow
pub struct FlowExecutor {
    flow: Arc<ResolvedFlow>,
    shape: CoverageShape,
    coverage: Arc<CoverageNode>,
    services: Arc<EngineServices>,
    registry: Weak<FlowRegistry>,
    pending: AtomicUsize,
}

impl std::fmt::Debug for FlowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowExecutor")
            .field("flow", &self.flow.name)
            .field("steps", &self.flow.steps.len())
            .field("pending", &self.pending_async())
            .finish()
    }
}

impl FlowExecutor {
    pub(crate) fn new(
        flow: Arc<ResolvedFlow>,
        shape: CoverageShape,
        services: Arc<EngineServices>,
        registry: Weak<FlowRegistry>,
    ) -> Self {
        let coverage = CoverageNode::build(&shape);
        Self {
            flow,
            shape,
            coverage,
            services,
            registry,
            pending: AtomicUsize::new(0),
        }
    }

    /// Flow name
    pub fn name(&self) -> &str {
        &self.flow.name
    }

    /// The resolved flow
    pub fn definition(&self) -> &Arc<ResolvedFlow> {
        &self.flow
    }

    /// Coverage accumulated over every invocation since the last reset
    pub fn coverage(&self) -> Arc<CoverageNode> {
        Arc::clone(&self.coverage)
    }

    /// Clear the accumulated coverage
    pub fn reset_coverage(&self) {
        self.coverage.reset();
    }

    /// A fresh, uncovered tree for one invocation
    pub fn fresh_coverage(&self) -> Arc<CoverageNode> {
        CoverageNode::build(&self.shape)
    }

    /// Asynchronous invocations accepted and not yet settled
    pub fn pending_async(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Run the flow to completion with a fresh monitor
    pub async fn invoke(
        &self,
        input: FlowValue,
        ambient: AmbientContext,
    ) -> Result<FlowOutcome, CoreError> {
        self.invoke_monitored(input, ambient, FlowMonitor::new(self.name()))
            .await
    }

    /// Run the flow to completion under a monitor the caller keeps
    pub async fn invoke_monitored(
        &self,
        input: FlowValue,
        ambient: AmbientContext,
        monitor: Arc<FlowMonitor>,
    ) -> Result<FlowOutcome, CoreError> {
        self.run(input, ambient, monitor, self.fresh_coverage())
            .await
    }

    /// Submit the flow to the worker pool and return immediately.
    ///
    /// At most `max_pending` (or the configured default) invocations of this
    /// flow may be outstanding; beyond that the submission is rejected.
    /// Must be called from within a tokio runtime.
    pub fn invoke_async(
        self: &Arc<Self>,
        input: FlowValue,
        ambient: AmbientContext,
        callback: AsyncCallback,
        max_pending: Option<usize>,
    ) -> Result<AsyncTicket, CoreError> {
        let monitor = FlowMonitor::new(self.name());
        self.dispatch(input, ambient, callback, max_pending, AsyncTarget::detached(monitor))
    }

    pub(crate) fn dispatch(
        self: &Arc<Self>,
        input: FlowValue,
        ambient: AmbientContext,
        callback: AsyncCallback,
        max_pending: Option<usize>,
        target: AsyncTarget,
    ) -> Result<AsyncTicket, CoreError> {
        let AsyncTarget {
            monitor,
            registrar,
            coverage,
            on_settled,
        } = target;
        let limit = max_pending.unwrap_or(self.services.config.default_max_pending);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                monitor.end();
                return Err(CoreError::FlowExecutionError(
                    "asynchronous invocation requires a tokio runtime".into(),
                ));
            }
        };

        let admitted = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                (pending < limit).then_some(pending + 1)
            })
            .is_ok();
        if !admitted {
            monitor.end();
            self.services.metrics.record_async_rejected();
            warn!(flow = %self.name(), max_pending = limit, "Async invocation rejected");
            return Err(CoreError::AdmissionRejected(format!(
                "flow '{}' already has {} pending asynchronous invocation(s)",
                self.name(),
                limit
            )));
        }

        let handle = PendingAsync::new(self.name(), &monitor);
        if let Some(registrar) = &registrar {
            registrar.register_pending(Arc::clone(&handle));
        }
        self.services.metrics.record_async_accepted();
        debug!(flow = %self.name(), invocation = %monitor.id(), "Async invocation accepted");

        let executor = Arc::clone(self);
        let task = AsyncTask {
            input,
            ambient,
            callback,
            monitor: Arc::clone(&monitor),
            registrar,
            handle: Arc::clone(&handle),
            coverage: coverage.unwrap_or_else(|| self.fresh_coverage()),
            on_settled,
        };
        runtime.spawn(async move { executor.settle(task).await });

        Ok(AsyncTicket::new(handle, monitor))
    }

    async fn settle(self: Arc<Self>, task: AsyncTask) {
        let AsyncTask {
            input,
            ambient,
            callback,
            monitor,
            registrar,
            handle,
            coverage,
            on_settled,
        } = task;
        let token = monitor.stop_token();
        let settlement = Settlement {
            pending: &self.pending,
            registrar,
            handle: Arc::clone(&handle),
            on_settled,
        };

        let worker = tokio::select! {
            permit = Arc::clone(&self.services.workers).acquire_owned() => permit
                .map(Some)
                .map_err(|_| CoreError::FlowExecutionError("worker pool is closed".into())),
            _ = token.cancelled() => Ok(None),
        };

        let outcome = match worker {
            Ok(Some(_permit)) => {
                let run = self.run(input.clone(), ambient.clone(), Arc::clone(&monitor), coverage);
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(self.panicked(&monitor, panic.as_ref())),
                }
            }
            Ok(None) => Ok(self.stopped_while_queued(&monitor, input.clone(), coverage)),
            Err(error) => {
                monitor.end();
                Err(error)
            }
        };

        let result = match outcome {
            Ok(outcome) => AsyncResult::finished(
                outcome.invocation,
                outcome.flow,
                input,
                outcome.status,
                outcome.result,
                ambient,
                outcome.context,
            ),
            Err(error) => {
                AsyncResult::failed(monitor.id().clone(), self.name().to_string(), input, error, ambient)
            }
        };

        // Claim before forgetting the handle so a concurrent cancel either
        // wins outright or finds the result already delivered.
        let deliver = handle.claim_delivery();
        drop(settlement);

        if deliver {
            callback(result);
        } else {
            self.services.metrics.record_async_discarded();
            debug!(
                flow = %self.name(),
                invocation = %monitor.id(),
                "Discarded result of cancelled async invocation"
            );
        }
    }

    fn panicked(&self, monitor: &FlowMonitor, panic: &(dyn Any + Send)) -> CoreError {
        let message = panic_message(panic);
        self.services.metrics.record_failed();
        self.services.audit.record(Box::new(FlowFailed {
            invocation_id: monitor.id().clone(),
            flow_id: FlowId(self.flow.name.clone()),
            error: message.clone(),
            timestamp: Utc::now(),
        }));
        error!(flow = %self.name(), invocation = %monitor.id(), panic = %message, "Async invocation panicked");
        CoreError::FlowExecutionError(format!("flow '{}' panicked: {}", self.name(), message))
    }

    fn stopped_while_queued(
        &self,
        monitor: &FlowMonitor,
        input: FlowValue,
        coverage: Arc<CoverageNode>,
    ) -> FlowOutcome {
        monitor.confirm_stopped();
        monitor.end();
        debug!(flow = %self.name(), invocation = %monitor.id(), "Stopped before a worker was free");
        FlowOutcome {
            flow: self.name().to_string(),
            invocation: monitor.id().clone(),
            status: InvocationStatus::Stopped,
            result: FlowValue::null(),
            context: ExecutionContext::new(input),
            coverage,
        }
    }

    /// One invocation: every step in order under `monitor`, recording into
    /// `coverage`. The monitor is ended on every exit path.
    #[instrument(skip_all, fields(flow = %self.flow.name, invocation = %monitor.id()))]
    pub(crate) async fn run(
        &self,
        input: FlowValue,
        ambient: AmbientContext,
        monitor: Arc<FlowMonitor>,
        coverage: Arc<CoverageNode>,
    ) -> Result<FlowOutcome, CoreError> {
        monitor.begin()?;
        let _end = EndOnDrop(&monitor);
        let services = &self.services;
        services.metrics.record_start();
        services.audit.record(Box::new(FlowStarted {
            invocation_id: monitor.id().clone(),
            flow_id: FlowId(self.flow.name.clone()),
            timestamp: Utc::now(),
        }));
        debug!(steps = self.flow.steps.len(), "Flow invocation started");

        let mut context = ExecutionContext::new(input);
        let result = self
            .run_steps(&mut context, &ambient, &monitor, &coverage)
            .await;

        match result {
            Ok(value) => {
                coverage.mark_covered();
                monitor.end();
                self.coverage.absorb(&coverage);
                services.metrics.record_completed();
                services.audit.record(Box::new(FlowCompleted {
                    invocation_id: monitor.id().clone(),
                    flow_id: FlowId(self.flow.name.clone()),
                    result: value.summary(),
                    timestamp: Utc::now(),
                }));
                info!(
                    covered = coverage.covered_count(),
                    total = coverage.total_count(),
                    "Flow invocation completed"
                );
                Ok(self.outcome(&monitor, InvocationStatus::Completed, value, context, coverage))
            }
            Err(error) if error.is_stop() && monitor.is_stop_requested() => {
                monitor.confirm_stopped();
                monitor.end();
                self.coverage.absorb(&coverage);
                services.metrics.record_stopped();
                services.audit.record(Box::new(FlowStopped {
                    invocation_id: monitor.id().clone(),
                    flow_id: FlowId(self.flow.name.clone()),
                    timestamp: Utc::now(),
                }));
                info!(steps_completed = context.len(), "Flow invocation stopped");
                Ok(self.outcome(&monitor, InvocationStatus::Stopped, FlowValue::null(), context, coverage))
            }
            Err(error) => {
                monitor.end();
                self.coverage.absorb(&coverage);
                services.metrics.record_failed();
                services.audit.record(Box::new(FlowFailed {
                    invocation_id: monitor.id().clone(),
                    flow_id: FlowId(self.flow.name.clone()),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                }));
                warn!(
                    error = %error,
                    steps_completed = context.len(),
                    "Flow invocation failed"
                );
                Err(error)
            }
        }
    }

    async fn run_steps(
        &self,
        context: &mut ExecutionContext,
        ambient: &AmbientContext,
        monitor: &Arc<FlowMonitor>,
        coverage: &Arc<CoverageNode>,
    ) -> Result<FlowValue, CoreError> {
        let executor = StepExecutor::new(monitor, self.services.audit.as_ref());
        let mut last = None;
        for (index, step) in self.flow.steps.iter().enumerate() {
            let node = coverage.child(index).cloned().ok_or_else(|| {
                CoreError::FlowExecutionError(format!(
                    "coverage tree of '{}' does not match its steps",
                    self.flow.name
                ))
            })?;
            let api: StepApi = Arc::new(StepRuntime {
                flow: self.flow.name.clone(),
                step: step.name.clone(),
                input: context.input().clone(),
                ambient: ambient.clone(),
                monitor: Arc::clone(monitor),
                coverage: Arc::clone(&node),
                services: Arc::clone(&self.services),
                registry: self.registry.clone(),
            });
            if let Some(value) = executor.execute(step, context, &node, api).await? {
                last = Some(value);
            }
        }
        Ok(last.unwrap_or_else(FlowValue::null))
    }

    fn outcome(
        &self,
        monitor: &FlowMonitor,
        status: InvocationStatus,
        result: FlowValue,
        context: ExecutionContext,
        coverage: Arc<CoverageNode>,
    ) -> FlowOutcome {
        FlowOutcome {
            flow: self.flow.name.clone(),
            invocation: monitor.id().clone(),
            status,
            result,
            context,
            coverage,
        }
    }
}

struct AsyncTask {
    input: FlowValue,
    ambient: AmbientContext,
    callback: AsyncCallback,
    monitor: Arc<FlowMonitor>,
    registrar: Option<Arc<FlowMonitor>>,
    handle: Arc<PendingAsync>,
    coverage: Arc<CoverageNode>,
    on_settled: Option<SettleHook>,
}

/// The runtime API for one step of one invocation
struct StepRuntime {
    flow: String,
    step: String,
    input: FlowValue,
    ambient: AmbientContext,
    monitor: Arc<FlowMonitor>,
    coverage: Arc<CoverageNode>,
    services: Arc<EngineServices>,
    registry: Weak<FlowRegistry>,
}

impl StepRuntime {
    fn nested_executor(&self, flow: &str) -> Result<Arc<FlowExecutor>, CoreError> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            CoreError::FlowExecutionError("flow registry is no longer available".into())
        })?;
        registry.executor(flow)
    }
}

#[async_trait]
impl StepRuntimeApi for StepRuntime {
    fn flow_name(&self) -> &str {
        &self.flow
    }

    fn step_name(&self) -> &str {
        &self.step
    }

    fn invocation_id(&self) -> &InvocationId {
        self.monitor.id()
    }

    fn flow_input(&self) -> &FlowValue {
        &self.input
    }

    fn ambient(&self) -> &AmbientContext {
        &self.ambient
    }

    fn resource(&self, name: &str) -> Option<Resource> {
        self.services.resources.resource(name)
    }

    fn stop_token(&self) -> CancellationToken {
        self.monitor.stop_token()
    }

    async fn invoke_flow(&self, flow: &str, input: FlowValue) -> Result<FlowValue, CoreError> {
        let executor = self.nested_executor(flow)?;
        let coverage = match self.coverage.nested_flow(flow) {
            Some(node) => Arc::clone(node),
            None => executor.fresh_coverage(),
        };
        let child = FlowMonitor::child_of(&self.monitor, flow);
        let _nested = self.monitor.enter_nested();
        debug!(parent = %self.flow, step = %self.step, nested = %flow, "Invoking nested flow");

        let outcome = executor
            .run(input, self.ambient.clone(), child, coverage)
            .await?;
        match outcome.status {
            InvocationStatus::Completed => Ok(outcome.result),
            InvocationStatus::Stopped | InvocationStatus::Failed => {
                Err(CoreError::FlowStopped(flow.to_string()))
            }
        }
    }

    fn invoke_flow_async(
        &self,
        flow: &str,
        input: FlowValue,
        max_pending: Option<usize>,
        callback: AsyncCallback,
    ) -> Result<AsyncTicket, CoreError> {
        let executor = self.nested_executor(flow)?;
        let child = FlowMonitor::child_of(&self.monitor, flow);
        debug!(parent = %self.flow, step = %self.step, nested = %flow, "Dispatching nested flow");
        executor.dispatch(
            input,
            self.ambient.clone(),
            callback,
            max_pending,
            AsyncTarget {
                monitor: child,
                registrar: Some(Arc::clone(&self.monitor)),
                coverage: None,
                on_settled: None,
            },
        )
    }
}
