/// Asynchronous results and their handles
pub mod async_result;

/// Component types and the registry
pub mod component;

/// Per-invocation step values
pub mod context;

/// Coverage trees
pub mod coverage;

/// Audit events and sinks
pub mod events;

/// Flow definition models
pub mod flow_definition;

/// Hierarchical invocation control
pub mod monitor;

/// Synchronous invocation outcomes
pub mod outcome;

/// Load-time resolution
pub mod resolver;

/// Ambient resources
pub mod resources;

/// Step execution
pub mod step;
