use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::domain::context::ExecutionContext;
use crate::domain::monitor::FlowMonitor;
use crate::domain::outcome::InvocationStatus;
use crate::error::CoreError;
use crate::types::{AmbientContext, FlowValue, InvocationId};

/// Consumer of an asynchronous invocation's result
pub type AsyncCallback = Box<dyn FnOnce(AsyncResult) + Send + 'static>;

/// Outcome of one asynchronous invocation, delivered to its callback.
///
/// Built once when the invocation settles and never modified afterwards.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    invocation: InvocationId,
    flow: String,
    input: FlowValue,
    status: InvocationStatus,
    outcome: Result<FlowValue, CoreError>,
    ambient: AmbientContext,
    context: Option<ExecutionContext>,
    completed_at: DateTime<Utc>,
}

impl AsyncResult {
    /// A completed or stopped invocation
    pub fn finished(
        invocation: InvocationId,
        flow: String,
        input: FlowValue,
        status: InvocationStatus,
        output: FlowValue,
        ambient: AmbientContext,
        context: ExecutionContext,
    ) -> Self {
        Self {
            invocation,
            flow,
            input,
            status,
            outcome: Ok(output),
            ambient,
            context: Some(context),
            completed_at: Utc::now(),
        }
    }

    /// A failed invocation
    pub fn failed(
        invocation: InvocationId,
        flow: String,
        input: FlowValue,
        error: CoreError,
        ambient: AmbientContext,
    ) -> Self {
        Self {
            invocation,
            flow,
            input,
            status: InvocationStatus::Failed,
            outcome: Err(error),
            ambient,
            context: None,
            completed_at: Utc::now(),
        }
    }

    /// Identifier of the invocation
    pub fn invocation(&self) -> &InvocationId {
        &self.invocation
    }

    /// Flow name
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// The input the flow was invoked with
    pub fn input(&self) -> &FlowValue {
        &self.input
    }

    /// How the invocation finished
    pub fn status(&self) -> InvocationStatus {
        self.status
    }

    /// Output, absent on failure
    pub fn output(&self) -> Option<&FlowValue> {
        self.outcome.as_ref().ok()
    }

    /// Failure, absent on success
    pub fn failure(&self) -> Option<&CoreError> {
        self.outcome.as_ref().err()
    }

    /// Consume into a plain result
    pub fn into_result(self) -> Result<FlowValue, CoreError> {
        self.outcome
    }

    /// Ambient context captured at submission
    pub fn ambient(&self) -> &AmbientContext {
        &self.ambient
    }

    /// Step values accumulated by the invocation, absent on failure
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    /// When the invocation settled
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

const PENDING: u8 = 0;
const DELIVERED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle for an asynchronous invocation whose result has not been delivered.
///
/// Delivery and cancellation race on a single state word: whichever side
/// moves it away from pending first wins, so a cancelled handle never
/// delivers.
#[derive(Debug)]
pub struct PendingAsync {
    id: InvocationId,
    flow: String,
    state: AtomicU8,
    monitor: Weak<FlowMonitor>,
}

impl PendingAsync {
    /// Handle for the invocation running under `monitor`
    pub fn new(flow: impl Into<String>, monitor: &Arc<FlowMonitor>) -> Arc<Self> {
        Arc::new(Self {
            id: monitor.id().clone(),
            flow: flow.into(),
            state: AtomicU8::new(PENDING),
            monitor: Arc::downgrade(monitor),
        })
    }

    /// Identifier of the invocation
    pub fn id(&self) -> &InvocationId {
        &self.id
    }

    /// Flow name
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// Whether the handle was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether the result was handed to the callback
    pub fn is_delivered(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELIVERED
    }

    /// Cancel the handle and stop the invocation it was dispatched under.
    ///
    /// Returns false when the result was already delivered or the handle
    /// was cancelled before.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            if let Some(monitor) = self.monitor.upgrade() {
                monitor.stop();
            }
        }
        cancelled
    }

    /// Claim the right to deliver the result
    pub fn claim_delivery(&self) -> bool {
        self.state
            .compare_exchange(PENDING, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Returned to the submitter of an asynchronous invocation
#[derive(Debug, Clone)]
pub struct AsyncTicket {
    pending: Arc<PendingAsync>,
    monitor: Arc<FlowMonitor>,
}

impl AsyncTicket {
    pub(crate) fn new(pending: Arc<PendingAsync>, monitor: Arc<FlowMonitor>) -> Self {
        Self { pending, monitor }
    }

    /// Identifier of the invocation
    pub fn id(&self) -> &InvocationId {
        self.pending.id()
    }

    /// Flow name
    pub fn flow(&self) -> &str {
        self.pending.flow()
    }

    /// Control handle of the running invocation
    pub fn monitor(&self) -> &Arc<FlowMonitor> {
        &self.monitor
    }

    /// Cancel this invocation only; its callback will not run
    pub fn cancel(&self) -> bool {
        self.pending.cancel()
    }

    /// Whether the callback has been handed the result
    pub fn is_delivered(&self) -> bool {
        self.pending.is_delivered()
    }

    /// Whether the invocation was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.pending.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_and_failure_are_exclusive() {
        let ok = AsyncResult::finished(
            InvocationId::from("1"),
            "H".into(),
            FlowValue::from(json!(1)),
            InvocationStatus::Completed,
            FlowValue::from(json!(2)),
            AmbientContext::new(),
            ExecutionContext::new(FlowValue::from(json!(1))),
        );
        assert_eq!(ok.output(), Some(&FlowValue::from(json!(2))));
        assert!(ok.failure().is_none());
        assert!(ok.context().is_some());

        let failed = AsyncResult::failed(
            InvocationId::from("2"),
            "H".into(),
            FlowValue::null(),
            CoreError::ComponentError("boom".into()),
            AmbientContext::from([("user".to_string(), json!("ann"))]),
        );
        assert!(failed.output().is_none());
        assert_eq!(failed.status(), InvocationStatus::Failed);
        assert_eq!(failed.ambient()["user"], json!("ann"));
        assert!(failed.context().is_none());
    }

    #[test]
    fn test_cancel_wins_over_later_delivery() {
        let monitor = FlowMonitor::new("H");
        let pending = PendingAsync::new("H", &monitor);
        assert!(pending.cancel());
        assert!(!pending.claim_delivery());
        assert!(!pending.cancel());
        assert!(monitor.is_stop_requested());
    }

    #[test]
    fn test_delivery_wins_over_later_cancel() {
        let monitor = FlowMonitor::new("H");
        let pending = PendingAsync::new("H", &monitor);
        assert!(pending.claim_delivery());
        assert!(!pending.cancel());
        assert!(pending.is_delivered());
        assert!(!monitor.is_stop_requested());
    }
}
