//!
//! Cadence Core - flow execution engine
//!
//! Flows are ordered steps, each running one operation of a component
//! instance. This crate resolves flow definitions at load time, executes
//! them synchronously or on a bounded worker pool, and lets callers
//! suspend, resume, stop and cancel invocations through a hierarchy of
//! monitors while recording which steps ran in a coverage tree.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flow models, monitors, coverage, and step execution
pub mod domain;

/// Application services - executors, the flow registry, and the runtime interface
pub mod application;

/// Engine configuration
pub mod config;

/// Core types
pub mod types;

/// Error types
pub mod error;

pub use config::EngineConfig;
pub use error::CoreError;
pub use types::{AmbientContext, DataPacket, FlowId, FlowValue, Instance, InvocationId, StepId, ValueKind};

pub use application::flow_executor::FlowExecutor;
pub use application::flow_registry::{EngineServices, FlowRegistry, FlowRegistryBuilder};
pub use application::metrics::{FlowMetrics, MetricsSnapshot};
pub use application::runtime_interface::RuntimeInterface;

pub use domain::async_result::{AsyncCallback, AsyncResult, AsyncTicket};
pub use domain::component::{ComponentRegistry, ComponentType};
pub use domain::context::ExecutionContext;
pub use domain::coverage::{CoverageNode, CoverageReport};
pub use domain::events::{AuditSink, DomainEvent, NoopAuditSink, TracingAuditSink};
pub use domain::flow_definition::{
    BindingSource, FlowDefinition, FlowDocument, InstanceSource, ResultAccessor, StepDefinition,
};
pub use domain::monitor::{FlowMonitor, MonitorSnapshot, MonitorState};
pub use domain::outcome::{FlowOutcome, InvocationStatus};
pub use domain::resources::{ResourceProvider, StaticResources};
pub use domain::step::{StepApi, StepRuntimeApi};
