//! Identifier-keyed control surface for a transport layer.
//!
//! A caller creates an invocation, then drives and observes it through the
//! identifier alone. Identifiers stay valid from `create_flow` until the
//! invocation ends or is released.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::flow_executor::{AsyncTarget, FlowExecutor};
use crate::application::flow_registry::FlowRegistry;
use crate::domain::async_result::{AsyncCallback, AsyncTicket};
use crate::domain::coverage::CoverageNode;
use crate::domain::monitor::{FlowMonitor, MonitorSnapshot};
use crate::domain::outcome::FlowOutcome;
use crate::error::CoreError;
use crate::types::{AmbientContext, FlowValue, InvocationId};

struct Session {
    executor: Arc<FlowExecutor>,
    monitor: Arc<FlowMonitor>,
    coverage: Arc<CoverageNode>,
    invoked: AtomicBool,
    ticket: Mutex<Option<AsyncTicket>>,
}

impl Session {
    fn claim(&self) -> Result<(), CoreError> {
        if self.invoked.swap(true, Ordering::SeqCst) {
            return Err(CoreError::FlowExecutionError(format!(
                "invocation {} has already been started",
                self.monitor.id()
            )));
        }
        Ok(())
    }
}

type Sessions = Arc<DashMap<InvocationId, Arc<Session>>>;

/// Forgets a session when a synchronous invocation returns or is dropped
struct Forget<'a> {
    sessions: &'a Sessions,
    id: &'a InvocationId,
}

impl Drop for Forget<'_> {
    fn drop(&mut self) {
        self.sessions.remove(self.id);
    }
}

/// Invocation sessions over one flow registry
pub struct RuntimeInterface {
    registry: Arc<FlowRegistry>,
    sessions: Sessions,
}

impl RuntimeInterface {
    /// Interface over the flows of `registry`
    pub fn new(registry: Arc<FlowRegistry>) -> Self {
        Self {
            registry,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    fn session(&self, id: &InvocationId) -> Result<Arc<Session>, CoreError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::UnknownIdentifier(id.to_string()))
    }

    /// Prepare an invocation of `flow` and return its identifier
    pub fn create_flow(&self, flow: &str) -> Result<InvocationId, CoreError> {
        let executor = self.registry.executor(flow)?;
        let monitor = FlowMonitor::new(flow);
        let id = monitor.id().clone();
        let session = Session {
            coverage: executor.fresh_coverage(),
            executor,
            monitor,
            invoked: AtomicBool::new(false),
            ticket: Mutex::new(None),
        };
        self.sessions.insert(id.clone(), Arc::new(session));
        debug!(flow = %flow, invocation = %id, "Created invocation");
        Ok(id)
    }

    /// Run a created invocation to completion
    pub async fn invoke_flow(
        &self,
        id: &InvocationId,
        input: FlowValue,
        ambient: AmbientContext,
    ) -> Result<FlowOutcome, CoreError> {
        let session = self.session(id)?;
        session.claim()?;
        let _forget = Forget {
            sessions: &self.sessions,
            id,
        };
        session
            .executor
            .run(
                input,
                ambient,
                Arc::clone(&session.monitor),
                Arc::clone(&session.coverage),
            )
            .await
    }

    /// Start a created invocation on the worker pool
    pub fn invoke_async_flow(
        &self,
        id: &InvocationId,
        input: FlowValue,
        ambient: AmbientContext,
        max_pending: Option<usize>,
        callback: AsyncCallback,
    ) -> Result<AsyncTicket, CoreError> {
        let session = self.session(id)?;
        session.claim()?;

        let sessions = Arc::clone(&self.sessions);
        let settled_id = id.clone();
        let target = AsyncTarget {
            monitor: Arc::clone(&session.monitor),
            registrar: None,
            coverage: Some(Arc::clone(&session.coverage)),
            on_settled: Some(Box::new(move || {
                sessions.remove(&settled_id);
            })),
        };
        let ticket = session
            .executor
            .dispatch(input, ambient, callback, max_pending, target)
            .map_err(|error| {
                self.sessions.remove(id);
                error
            })?;
        *session.ticket.lock() = Some(ticket.clone());
        Ok(ticket)
    }

    /// Ask the invocation to pause at its next checkpoint
    pub fn suspend_flow(&self, id: &InvocationId) -> Result<(), CoreError> {
        self.session(id)?.monitor.suspend();
        Ok(())
    }

    /// Let a suspended invocation continue
    pub fn resume_flow(&self, id: &InvocationId) -> Result<(), CoreError> {
        self.session(id)?.monitor.resume();
        Ok(())
    }

    /// Ask the invocation to stop at its next checkpoint
    pub fn stop_flow(&self, id: &InvocationId) -> Result<(), CoreError> {
        self.session(id)?.monitor.stop();
        Ok(())
    }

    /// Cancel the invocation and everything it dispatched; undelivered
    /// asynchronous results are dropped
    pub fn cancel(&self, id: &InvocationId) -> Result<(), CoreError> {
        let session = self.session(id)?;
        if let Some(ticket) = session.ticket.lock().as_ref() {
            ticket.cancel();
        }
        session.monitor.cancel();
        info!(invocation = %id, flow = %session.monitor.flow_name(), "Cancelled invocation");
        Ok(())
    }

    /// Coverage recorded by the invocation so far
    pub fn get_coverage(&self, id: &InvocationId) -> Result<Arc<CoverageNode>, CoreError> {
        Ok(Arc::clone(&self.session(id)?.coverage))
    }

    /// Monitor state of the invocation
    pub fn describe(&self, id: &InvocationId) -> Result<MonitorSnapshot, CoreError> {
        Ok(self.session(id)?.monitor.snapshot())
    }

    /// Whether the invocation and its children are parked
    pub fn is_suspended(&self, id: &InvocationId) -> Result<bool, CoreError> {
        Ok(self.session(id)?.monitor.is_suspended())
    }

    /// Whether the invocation and its children observed a stop
    pub fn is_stopped(&self, id: &InvocationId) -> Result<bool, CoreError> {
        Ok(self.session(id)?.monitor.is_stopped())
    }

    /// Identifiers that are currently valid
    pub fn live_invocations(&self) -> Vec<InvocationId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Forget an invocation, stopping it first if it is running
    pub fn release(&self, id: &InvocationId) -> Result<(), CoreError> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| CoreError::UnknownIdentifier(id.to_string()))?;
        if session.monitor.is_started() && !session.monitor.is_ended() {
            session.monitor.stop();
        } else if !session.monitor.is_started() {
            session.monitor.end();
        }
        debug!(invocation = %id, "Released invocation");
        Ok(())
    }
}
