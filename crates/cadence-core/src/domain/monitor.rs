//! Control handles for running flow invocations.
//!
//! Every invocation, nested or asynchronous, owns one [`FlowMonitor`].
//! Monitors form a tree through their children, so a suspend, stop or
//! cancel issued on a parent reaches every invocation below it. The flow's
//! own task observes requests cooperatively at checkpoints; a stop also
//! fires the monitor's cancellation token so that a parked or blocked wait
//! unblocks promptly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::async_result::PendingAsync;
use crate::error::CoreError;
use crate::types::InvocationId;

#[derive(Default)]
struct MonitorLinks {
    children: HashMap<InvocationId, Arc<FlowMonitor>>,
    pending: HashMap<InvocationId, Arc<PendingAsync>>,
}

/// Control handle for one flow invocation
pub struct FlowMonitor {
    id: InvocationId,
    flow_name: String,
    current_step: Mutex<Option<String>>,
    suspend_tx: watch::Sender<bool>,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    parked: AtomicBool,
    ended: AtomicBool,
    nested_calls: AtomicUsize,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    stop_token: Mutex<CancellationToken>,
    parent: Mutex<Weak<FlowMonitor>>,
    links: Mutex<MonitorLinks>,
}

impl std::fmt::Debug for FlowMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowMonitor")
            .field("id", &self.id)
            .field("flow", &self.flow_name)
            .field("state", &self.state())
            .finish()
    }
}

impl FlowMonitor {
    /// A monitor for a new top-level invocation
    pub fn new(flow_name: impl Into<String>) -> Arc<Self> {
        Self::with_id(InvocationId::generate(), flow_name)
    }

    /// A monitor with a caller chosen identifier
    pub fn with_id(id: InvocationId, flow_name: impl Into<String>) -> Arc<Self> {
        let (suspend_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            flow_name: flow_name.into(),
            current_step: Mutex::new(None),
            suspend_tx,
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            nested_calls: AtomicUsize::new(0),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            stop_token: Mutex::new(CancellationToken::new()),
            parent: Mutex::new(Weak::new()),
            links: Mutex::new(MonitorLinks::default()),
        })
    }

    /// A monitor registered as a child of `parent`
    pub fn child_of(parent: &Arc<FlowMonitor>, flow_name: impl Into<String>) -> Arc<Self> {
        let child = Self::new(flow_name);
        child.attach_to(parent);
        child
    }

    /// Register this monitor under `parent`, inheriting pending requests
    pub fn attach_to(self: &Arc<Self>, parent: &Arc<FlowMonitor>) {
        *self.parent.lock() = Arc::downgrade(parent);
        parent.add_child(Arc::clone(self));
    }

    fn add_child(&self, child: Arc<FlowMonitor>) {
        self.links
            .lock()
            .children
            .insert(child.id.clone(), Arc::clone(&child));
        // A request issued while the child was being registered may have
        // missed it during traversal.
        if self.is_stop_requested() {
            child.stop();
        }
        if self.is_suspend_requested() {
            child.suspend();
        }
    }

    fn remove_child(&self, id: &InvocationId) {
        self.links.lock().children.remove(id);
    }

    fn children(&self) -> Vec<Arc<FlowMonitor>> {
        self.links.lock().children.values().cloned().collect()
    }

    /// Identifier of the invocation
    pub fn id(&self) -> &InvocationId {
        &self.id
    }

    /// Name of the flow this monitor controls
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Name of the innermost flow currently executing below this monitor
    pub fn current_flow(&self) -> String {
        self.children()
            .into_iter()
            .find(|child| child.current_step().is_some())
            .map(|child| child.current_flow())
            .unwrap_or_else(|| self.flow_name.clone())
    }

    /// Step currently executing in this flow
    pub fn current_step(&self) -> Option<String> {
        self.current_step.lock().clone()
    }

    /// Mark `step` as current until the returned guard drops
    pub fn enter_step(&self, step: &str) -> StepMarker<'_> {
        *self.current_step.lock() = Some(step.to_string());
        StepMarker { monitor: self }
    }

    /// Count a synchronous nested invocation until the guard drops
    pub(crate) fn enter_nested(&self) -> NestedCall<'_> {
        self.nested_calls.fetch_add(1, Ordering::SeqCst);
        NestedCall { monitor: self }
    }

    /// Number of live child monitors
    pub fn child_count(&self) -> usize {
        self.links.lock().children.len()
    }

    /// Number of undelivered asynchronous invocations registered here
    pub fn pending_count(&self) -> usize {
        self.links.lock().pending.len()
    }

    /// Token fired when a stop is requested
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.lock().clone()
    }

    /// Request suspension here and below. Does not block.
    pub fn suspend(&self) {
        self.suspend_tx.send_replace(true);
        debug!(flow = %self.flow_name, invocation = %self.id, "Suspend requested");
        for child in self.children() {
            child.suspend();
        }
    }

    /// Whether a suspension was requested
    pub fn is_suspend_requested(&self) -> bool {
        *self.suspend_tx.borrow()
    }

    /// True once this flow has parked (or is blocked in a nested flow) and
    /// every child reports suspended.
    pub fn is_suspended(&self) -> bool {
        let parked =
            self.parked.load(Ordering::SeqCst) || self.nested_calls.load(Ordering::SeqCst) > 0;
        parked
            && self.is_suspend_requested()
            && self.children().iter().all(|child| child.is_suspended())
    }

    /// Clear the suspension here and below, waking parked flows. Idempotent.
    pub fn resume(&self) {
        self.suspend_tx.send_replace(false);
        debug!(flow = %self.flow_name, invocation = %self.id, "Resume requested");
        for child in self.children() {
            child.resume();
        }
    }

    /// Request a stop here and below, unblocking any parked wait
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_token.lock().cancel();
        debug!(flow = %self.flow_name, invocation = %self.id, "Stop requested");
        for child in self.children() {
            child.stop();
        }
    }

    /// Whether a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// True once the stop was observed here and by every child
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
            && self.children().iter().all(|child| child.is_stopped())
    }

    /// Cancel every child, then every pending asynchronous invocation
    /// registered here. Cancelled invocations never deliver.
    pub fn cancel(&self) {
        for child in self.children() {
            child.cancel();
        }
        let pending: Vec<Arc<PendingAsync>> =
            self.links.lock().pending.drain().map(|(_, p)| p).collect();
        for handle in pending {
            if handle.cancel() {
                debug!(
                    flow = %self.flow_name,
                    async_flow = %handle.flow(),
                    async_invocation = %handle.id(),
                    "Cancelled pending async invocation"
                );
            }
        }
    }

    /// Track an asynchronous invocation until it is delivered or cancelled
    pub fn register_pending(&self, handle: Arc<PendingAsync>) {
        self.links.lock().pending.insert(handle.id().clone(), handle);
    }

    /// Forget a settled asynchronous invocation
    pub fn remove_pending(&self, id: &InvocationId) {
        self.links.lock().pending.remove(id);
    }

    /// Stop checkpoint: fails with the stop signal when a stop was requested
    pub fn check_stop(&self) -> Result<(), CoreError> {
        if self.is_stop_requested() {
            self.stopped.store(true, Ordering::SeqCst);
            debug!(flow = %self.flow_name, invocation = %self.id, "Stop observed");
            return Err(CoreError::FlowStopped(self.flow_name.clone()));
        }
        Ok(())
    }

    /// Suspend checkpoint: parks while a suspension is requested.
    ///
    /// A stop issued while parked wakes the flow and is reported as the
    /// stop signal.
    pub async fn check_suspend(&self) -> Result<(), CoreError> {
        let mut suspended = self.suspend_tx.subscribe();
        let requested = *suspended.borrow_and_update();
        if !requested {
            return Ok(());
        }

        let token = self.stop_token();
        self.parked.store(true, Ordering::SeqCst);
        debug!(flow = %self.flow_name, invocation = %self.id, "Parked at checkpoint");
        tokio::select! {
            _ = token.cancelled() => {}
            _ = suspended.wait_for(|flag| !*flag) => {}
        }
        self.parked.store(false, Ordering::SeqCst);
        debug!(flow = %self.flow_name, invocation = %self.id, "Left checkpoint");

        self.check_stop()
    }

    /// Mark the stop as observed when a step unwound because of it
    pub(crate) fn confirm_stopped(&self) {
        if self.is_stop_requested() {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Record the start of the invocation
    pub(crate) fn begin(&self) -> Result<(), CoreError> {
        if self.is_ended() {
            return Err(CoreError::FlowExecutionError(format!(
                "invocation {} of '{}' has already ended",
                self.id, self.flow_name
            )));
        }
        let mut started = self.started_at.lock();
        if started.is_some() {
            return Err(CoreError::FlowExecutionError(format!(
                "invocation {} of '{}' is already running",
                self.id, self.flow_name
            )));
        }
        *started = Some(Utc::now());
        Ok(())
    }

    /// Terminal transition: records the end time and detaches from the parent
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.ended_at.lock() = Some(Utc::now());
        *self.current_step.lock() = None;
        self.detach();
    }

    fn detach(&self) {
        let parent = std::mem::take(&mut *self.parent.lock());
        if let Some(parent) = parent.upgrade() {
            parent.remove_child(&self.id);
        }
    }

    /// Whether the invocation has ended
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Whether the invocation has started
    pub fn is_started(&self) -> bool {
        self.started_at.lock().is_some()
    }

    /// Start time
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    /// End time
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.lock()
    }

    /// Reset every flag and detach children and pending handles, for reuse
    pub fn clear(&self) {
        self.detach();
        {
            let mut links = self.links.lock();
            links.children.clear();
            links.pending.clear();
        }
        self.suspend_tx.send_replace(false);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        self.parked.store(false, Ordering::SeqCst);
        self.ended.store(false, Ordering::SeqCst);
        self.nested_calls.store(0, Ordering::SeqCst);
        *self.started_at.lock() = None;
        *self.ended_at.lock() = None;
        *self.current_step.lock() = None;
        *self.stop_token.lock() = CancellationToken::new();
    }

    /// Current lifecycle state
    pub fn state(&self) -> MonitorState {
        if self.is_ended() {
            MonitorState::Ended
        } else if self.stopped.load(Ordering::SeqCst) {
            MonitorState::Stopped
        } else if self.is_suspended() {
            MonitorState::Suspended
        } else if self.is_started() {
            MonitorState::Running
        } else {
            MonitorState::Idle
        }
    }

    /// Point-in-time view of this monitor and its children
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            invocation: self.id.0.clone(),
            flow: self.flow_name.clone(),
            current_flow: self.current_flow(),
            current_step: self.current_step(),
            state: self.state(),
            suspend_requested: self.is_suspend_requested(),
            stop_requested: self.is_stop_requested(),
            started_at: self.started_at(),
            ended_at: self.ended_at(),
            pending_async: self.pending_count(),
            children: self.children().iter().map(|c| c.snapshot()).collect(),
        }
    }
}

/// Clears the current step on drop
#[must_use = "the step stays current only while the marker is alive"]
pub struct StepMarker<'a> {
    monitor: &'a FlowMonitor,
}

impl Drop for StepMarker<'_> {
    fn drop(&mut self) {
        *self.monitor.current_step.lock() = None;
    }
}

/// Decrements the nested invocation count on drop
pub(crate) struct NestedCall<'a> {
    monitor: &'a FlowMonitor,
}

impl Drop for NestedCall<'_> {
    fn drop(&mut self) {
        self.monitor.nested_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Lifecycle state of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// Created, not started
    Idle,
    /// Executing steps
    Running,
    /// Parked at a checkpoint
    Suspended,
    /// Stop observed
    Stopped,
    /// Finished, terminal
    Ended,
}

/// Serializable view of a monitor tree
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// Invocation identifier
    pub invocation: String,
    /// Flow name
    pub flow: String,
    /// Innermost flow currently executing
    pub current_flow: String,
    /// Step currently executing
    pub current_step: Option<String>,
    /// Lifecycle state
    pub state: MonitorState,
    /// Suspend flag
    pub suspend_requested: bool,
    /// Stop flag
    pub stop_requested: bool,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// End time
    pub ended_at: Option<DateTime<Utc>>,
    /// Undelivered async invocations registered here
    pub pending_async: usize,
    /// Child monitors
    pub children: Vec<MonitorSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_checkpoint_confirms() {
        let monitor = FlowMonitor::new("F");
        assert!(monitor.check_stop().is_ok());
        monitor.stop();
        assert!(!monitor.is_stopped());
        assert_eq!(monitor.check_stop(), Err(CoreError::FlowStopped("F".into())));
        assert!(monitor.is_stopped());
        assert!(monitor.stop_token().is_cancelled());
    }

    #[test]
    fn test_requests_propagate_to_children() {
        let root = FlowMonitor::new("F");
        let child = FlowMonitor::child_of(&root, "Sub");
        let grandchild = FlowMonitor::child_of(&child, "Leaf");

        root.suspend();
        assert!(grandchild.is_suspend_requested());
        root.resume();
        assert!(!grandchild.is_suspend_requested());
        root.stop();
        assert!(grandchild.is_stop_requested());
    }

    #[test]
    fn test_late_child_inherits_requests() {
        let root = FlowMonitor::new("F");
        root.suspend();
        root.stop();
        let child = FlowMonitor::child_of(&root, "Sub");
        assert!(child.is_suspend_requested());
        assert!(child.is_stop_requested());
    }

    #[test]
    fn test_end_detaches_from_parent() {
        let root = FlowMonitor::new("F");
        let child = FlowMonitor::child_of(&root, "Sub");
        assert_eq!(root.child_count(), 1);
        child.end();
        assert_eq!(root.child_count(), 0);
        assert!(child.is_ended());
        assert_eq!(child.state(), MonitorState::Ended);
        child.end();
        assert!(child.ended_at().is_some());
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let monitor = FlowMonitor::new("F");
        assert!(monitor.begin().is_ok());
        assert!(monitor.begin().is_err());
        monitor.end();
        assert!(monitor.begin().is_err());
    }

    #[test]
    fn test_step_marker_clears_on_drop() {
        let monitor = FlowMonitor::new("F");
        {
            let _marker = monitor.enter_step("A");
            assert_eq!(monitor.current_step().as_deref(), Some("A"));
        }
        assert!(monitor.current_step().is_none());
    }

    #[test]
    fn test_cancel_severs_pending_handles() {
        let root = FlowMonitor::new("F");
        let worker = FlowMonitor::new("H");
        let handle = PendingAsync::new("H", &worker);
        root.register_pending(Arc::clone(&handle));
        assert_eq!(root.pending_count(), 1);

        root.cancel();
        assert_eq!(root.pending_count(), 0);
        assert!(handle.is_cancelled());
        assert!(worker.is_stop_requested());
        assert!(!root.is_stop_requested());
    }

    #[test]
    fn test_clear_resets_everything() {
        let root = FlowMonitor::new("F");
        let _child = FlowMonitor::child_of(&root, "Sub");
        root.begin().unwrap();
        root.suspend();
        root.stop();
        let _ = root.check_stop();
        root.end();

        root.clear();
        assert_eq!(root.state(), MonitorState::Idle);
        assert!(!root.is_suspend_requested());
        assert!(!root.is_stop_requested());
        assert!(!root.stop_token().is_cancelled());
        assert_eq!(root.child_count(), 0);
        assert!(root.begin().is_ok());
    }

    #[tokio::test]
    async fn test_check_suspend_passes_through_when_not_suspended() {
        let monitor = FlowMonitor::new("F");
        assert!(monitor.check_suspend().await.is_ok());
        assert!(!monitor.is_suspended());
    }

    #[tokio::test]
    async fn test_parked_until_resume() {
        let monitor = FlowMonitor::new("F");
        monitor.suspend();
        assert!(!monitor.is_suspended());

        let parked = Arc::clone(&monitor);
        let task = tokio::spawn(async move { parked.check_suspend().await });

        while !monitor.is_suspended() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(monitor.state(), MonitorState::Suspended);
        monitor.resume();
        monitor.resume();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("resume wakes the parked flow")
            .unwrap();
        assert!(result.is_ok());
        assert!(!monitor.is_suspended());
    }

    #[tokio::test]
    async fn test_stop_unblocks_parked_flow() {
        let monitor = FlowMonitor::new("F");
        monitor.suspend();

        let parked = Arc::clone(&monitor);
        let task = tokio::spawn(async move { parked.check_suspend().await });
        while !monitor.is_suspended() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        monitor.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stop wakes the parked flow")
            .unwrap();
        assert_eq!(result, Err(CoreError::FlowStopped("F".into())));
        assert!(monitor.is_stopped());
    }

    #[test]
    fn test_suspended_requires_children_suspended() {
        let root = FlowMonitor::new("F");
        let child = FlowMonitor::child_of(&root, "Sub");
        root.suspend();
        let _nested = root.enter_nested();
        assert!(!root.is_suspended());
        child.parked.store(true, Ordering::SeqCst);
        assert!(root.is_suspended());
    }

    #[test]
    fn test_snapshot_reflects_tree() {
        let root = FlowMonitor::new("F");
        let child = FlowMonitor::child_of(&root, "Sub");
        let _marker = child.enter_step("S1");
        let snapshot = root.snapshot();
        assert_eq!(snapshot.flow, "F");
        assert_eq!(snapshot.current_flow, "Sub");
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(snapshot.children[0].current_step.as_deref(), Some("S1"));
        assert_eq!(snapshot.state, MonitorState::Idle);
    }
}
