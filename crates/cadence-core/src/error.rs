use thiserror::Error;

/// Core error type for the Cadence runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Unresolvable or inconsistent flow configuration, detected at load time
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failure raised by a component operation
    #[error("Component error: {0}")]
    ComponentError(String),

    /// Step execution error
    #[error("Step execution error: {0}")]
    StepExecutionError(String),

    /// Flow execution error
    #[error("Flow execution error: {0}")]
    FlowExecutionError(String),

    /// Stop signal observed at a checkpoint; carries the flow name
    #[error("Flow stopped: {0}")]
    FlowStopped(String),

    /// Control operation referencing an invocation that is not live
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// Asynchronous submission beyond the pending limit
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether this error is the stop signal rather than a failure
    pub fn is_stop(&self) -> bool {
        matches!(self, CoreError::FlowStopped(_))
    }

    /// Whether this error is a load-time configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(self, CoreError::ConfigurationError(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
