use chrono::{DateTime, Utc};
use std::fmt::Debug;
use tracing::{info, warn};

use crate::types::{FlowId, InvocationId, StepId};

/// Domain event trait for all audit events emitted by the executor
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the invocation this event is associated with
    fn invocation_id(&self) -> &InvocationId;

    /// Returns the flow this event is associated with
    fn flow_id(&self) -> &FlowId;

    /// Returns the step, for step events
    fn step_id(&self) -> Option<&StepId> {
        None
    }

    /// Free form detail (result summary, failure message)
    fn detail(&self) -> Option<&str> {
        None
    }

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Receives audit events. Fire-and-forget: implementations must not block
/// and cannot fail the flow.
pub trait AuditSink: Send + Sync {
    /// Record one event
    fn record(&self, event: Box<dyn DomainEvent>);
}

/// Event: Flow invocation started
#[derive(Debug)]
pub struct FlowStarted {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// The timestamp when the invocation started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowStarted {
    fn event_type(&self) -> &'static str {
        "flow.started"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Flow invocation completed
#[derive(Debug)]
pub struct FlowCompleted {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// Summary of the flow result
    pub result: String,
    /// The timestamp when the invocation completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowCompleted {
    fn event_type(&self) -> &'static str {
        "flow.completed"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn detail(&self) -> Option<&str> {
        Some(&self.result)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Flow invocation unwound after a stop request
#[derive(Debug)]
pub struct FlowStopped {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// The timestamp when the stop was observed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowStopped {
    fn event_type(&self) -> &'static str {
        "flow.stopped"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Flow invocation failed
#[derive(Debug)]
pub struct FlowFailed {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// The error message
    pub error: String,
    /// The timestamp when the invocation failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowFailed {
    fn event_type(&self) -> &'static str {
        "flow.failed"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn detail(&self) -> Option<&str> {
        Some(&self.error)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Step started
#[derive(Debug)]
pub struct StepStarted {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// The step
    pub step_id: StepId,
    /// The timestamp when the step started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepStarted {
    fn event_type(&self) -> &'static str {
        "step.started"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn step_id(&self) -> Option<&StepId> {
        Some(&self.step_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Step completed
#[derive(Debug)]
pub struct StepCompleted {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// The step
    pub step_id: StepId,
    /// Summary of the stored result, if the step keeps one
    pub result: Option<String>,
    /// The timestamp when the step completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepCompleted {
    fn event_type(&self) -> &'static str {
        "step.completed"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn step_id(&self) -> Option<&StepId> {
        Some(&self.step_id)
    }

    fn detail(&self) -> Option<&str> {
        self.result.as_deref()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Step failed
#[derive(Debug)]
pub struct StepFailed {
    /// The invocation
    pub invocation_id: InvocationId,
    /// The flow
    pub flow_id: FlowId,
    /// The step
    pub step_id: StepId,
    /// The error message
    pub error: String,
    /// The timestamp when the step failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepFailed {
    fn event_type(&self) -> &'static str {
        "step.failed"
    }

    fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    fn step_id(&self) -> Option<&StepId> {
        Some(&self.step_id)
    }

    fn detail(&self) -> Option<&str> {
        Some(&self.error)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Writes audit events as structured `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: Box<dyn DomainEvent>) {
        let step = event.step_id().map(|s| s.0.as_str()).unwrap_or("-");
        let detail = event.detail().unwrap_or("");
        if event.event_type().ends_with(".failed") {
            warn!(
                target: "cadence::audit",
                event = event.event_type(),
                invocation = %event.invocation_id(),
                flow = %event.flow_id().0,
                step,
                detail,
                "audit"
            );
        } else {
            info!(
                target: "cadence::audit",
                event = event.event_type(),
                invocation = %event.invocation_id(),
                flow = %event.flow_id().0,
                step,
                detail,
                "audit"
            );
        }
    }
}

/// Discards audit events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: Box<dyn DomainEvent>) {}
}

/// In-memory audit sink for tests
#[cfg(feature = "testing")]
pub mod memory {
    use super::{AuditSink, DomainEvent};
    use parking_lot::Mutex;

    /// One recorded event, flattened
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        /// Event type
        pub event_type: &'static str,
        /// Flow name
        pub flow: String,
        /// Step name, for step events
        pub step: Option<String>,
        /// Detail text
        pub detail: Option<String>,
    }

    /// Keeps every event it receives
    #[derive(Debug, Default)]
    pub struct MemoryAuditSink {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl MemoryAuditSink {
        /// Create an empty sink
        pub fn new() -> Self {
            Self::default()
        }

        /// Everything recorded so far
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().clone()
        }

        /// Event types recorded so far, in order
        pub fn event_types(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|e| e.event_type).collect()
        }

        /// Events about one step
        pub fn for_step(&self, step: &str) -> Vec<RecordedEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.step.as_deref() == Some(step))
                .cloned()
                .collect()
        }

        /// Forget everything recorded
        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl AuditSink for MemoryAuditSink {
        fn record(&self, event: Box<dyn DomainEvent>) {
            self.events.lock().push(RecordedEvent {
                event_type: event.event_type(),
                flow: event.flow_id().0.clone(),
                step: event.step_id().map(|s| s.0.clone()),
                detail: event.detail().map(str::to_string),
            });
        }
    }
}
