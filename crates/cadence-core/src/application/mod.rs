/// Per-flow executor and the step runtime API
pub mod flow_executor;

/// Loaded flows and shared engine services
pub mod flow_registry;

/// Invocation counters
pub mod metrics;

/// Identifier-keyed control surface for external callers
pub mod runtime_interface;
