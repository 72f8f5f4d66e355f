use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::context::ExecutionContext;
use crate::domain::coverage::CoverageNode;
use crate::types::{FlowValue, InvocationId};

/// How a flow invocation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// All steps ran
    Completed,
    /// A stop request was observed and the flow unwound
    Stopped,
    /// A step or the configuration failed
    Failed,
}

/// Result of a synchronous invocation that did not fail
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    /// Flow name
    pub flow: String,
    /// Identifier of the invocation (its monitor id)
    pub invocation: InvocationId,
    /// `Completed` or `Stopped`
    pub status: InvocationStatus,
    /// Last produced result, or null when none was produced or the flow stopped
    pub result: FlowValue,
    /// Values accumulated by the steps that ran
    pub context: ExecutionContext,
    /// Coverage of this invocation
    pub coverage: Arc<CoverageNode>,
}

impl FlowOutcome {
    /// Whether the flow ran to completion
    pub fn is_completed(&self) -> bool {
        self.status == InvocationStatus::Completed
    }

    /// Whether the flow was stopped
    pub fn is_stopped(&self) -> bool {
        self.status == InvocationStatus::Stopped
    }
}
