//! Component types and shared resources used by engine tests.

use cadence_core::domain::component::{ComponentRegistry, ComponentType};
use cadence_core::{AsyncResult, AsyncTicket, CoreError, FlowValue, ValueKind};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Resource name of the [`Gate`]
pub const GATE: &str = "gate";
/// Resource name of the [`Journal`]
pub const JOURNAL: &str = "journal";
/// Resource name of the [`Mailbox`]
pub const MAILBOX: &str = "mailbox";

/// Holds `GateWait` steps until opened
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
    entered: AtomicUsize,
}

impl Default for Gate {
    fn default() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open,
            entered: AtomicUsize::new(0),
        }
    }
}

impl Gate {
    /// A closed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every waiter, present and future
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Make later waiters block again
    pub fn close(&self) {
        self.open.send_replace(false);
    }

    /// Number of waits started so far
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }
}

/// Records which steps ran, as `flow.step`
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    /// Everything recorded so far
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }
}

/// Collects results delivered to `Caller.dispatch` callbacks
#[derive(Debug, Default)]
pub struct Mailbox {
    results: Mutex<Vec<AsyncResult>>,
    tickets: Mutex<Vec<AsyncTicket>>,
}

impl Mailbox {
    /// Delivered results
    pub fn results(&self) -> Vec<AsyncResult> {
        self.results.lock().clone()
    }

    /// Number of delivered results
    pub fn delivered(&self) -> usize {
        self.results.lock().len()
    }

    /// Tickets of every dispatched invocation
    pub fn tickets(&self) -> Vec<AsyncTicket> {
        self.tickets.lock().clone()
    }

    /// Store a delivered result
    pub fn deliver(&self, result: AsyncResult) {
        self.results.lock().push(result);
    }
}

/// Adds `step` to its total on every `increment`
#[derive(Debug)]
pub struct Counter {
    total: i64,
    step: i64,
}

impl Default for Counter {
    fn default() -> Self {
        Self { total: 0, step: 1 }
    }
}

/// Fails every `fail` with a component error and panics on every `panic`
#[derive(Debug, Default)]
pub struct Failing {
    message: Option<String>,
}

/// Waits at the shared [`Gate`]; a stop interrupts the wait
#[derive(Debug, Default)]
pub struct GateWait;

/// Writes its position into the shared [`Journal`]
#[derive(Debug, Default)]
pub struct Recorder;

/// Invokes other flows by name
#[derive(Debug, Default)]
pub struct Caller {
    flow: String,
    input: serde_json::Value,
    result: serde_json::Value,
    count: usize,
}

fn text(value: &FlowValue) -> Option<String> {
    value.as_data().and_then(|d| d.as_str()).map(str::to_string)
}

/// Registry with every fixture type
pub fn fixture_components() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry
        .register(
            ComponentType::<Counter>::new("Counter")
                .default_constructor()
                .property("step", ValueKind::Data, |counter, value| {
                    counter.step = value.as_data().and_then(|d| d.as_i64()).ok_or_else(|| {
                        CoreError::ComponentError(format!("step must be an integer, got {}", value.summary()))
                    })?;
                    Ok(())
                })
                .property("start", ValueKind::Data, |counter, value| {
                    counter.total = value.as_data().and_then(|d| d.as_i64()).unwrap_or(0);
                    Ok(())
                })
                .operation("increment", |counter, _api| async move {
                    let mut counter = counter.lock().await;
                    let step = counter.step;
                    counter.total += step;
                    Ok(())
                })
                .accessor("total", ValueKind::Data, |counter| FlowValue::data(json!(counter.total))),
        )
        .register(
            ComponentType::<Failing>::new("Failing")
                .default_constructor()
                .property("message", ValueKind::Data, |failing, value| {
                    failing.message = text(&value);
                    Ok(())
                })
                .operation("fail", |failing, _api| async move {
                    let message = failing.lock().await.message.clone();
                    Err(CoreError::ComponentError(
                        message.unwrap_or_else(|| "fixture failure".to_string()),
                    ))
                })
                .operation("panic", |failing, _api| async move {
                    let message = failing.lock().await.message.clone();
                    let message = message.unwrap_or_else(|| "fixture panic".to_string());
                    if !message.is_empty() {
                        panic!("{}", message);
                    }
                    Ok(())
                }),
        )
        .register(
            ComponentType::<GateWait>::new("GateWait")
                .default_constructor()
                .operation("wait", |_gate_wait, api| async move {
                    let gate = api.typed_resource::<Gate>(GATE)?;
                    let stop = api.stop_token();
                    tokio::select! {
                        _ = gate.pass() => Ok(()),
                        _ = stop.cancelled() => Err(api.stopped()),
                    }
                }),
        )
        .register(
            ComponentType::<Recorder>::new("Recorder")
                .default_constructor()
                .operation("record", |_recorder, api| async move {
                    let journal = api.typed_resource::<Journal>(JOURNAL)?;
                    journal.push(format!("{}.{}", api.flow_name(), api.step_name()));
                    Ok(())
                }),
        )
        .register(
            ComponentType::<Caller>::new("Caller")
                .default_constructor()
                .property("flow", ValueKind::Data, |caller, value| {
                    caller.flow = text(&value).ok_or_else(|| {
                        CoreError::ComponentError("flow must be a string".into())
                    })?;
                    Ok(())
                })
                .property("input", ValueKind::Data, |caller, value| {
                    caller.input = value.as_data().cloned().unwrap_or_default();
                    Ok(())
                })
                .property("count", ValueKind::Data, |caller, value| {
                    caller.count = value.as_data().and_then(|d| d.as_i64()).unwrap_or(1).max(0) as usize;
                    Ok(())
                })
                .operation("invoke", |caller, api| async move {
                    let mut caller = caller.lock().await;
                    let output = api
                        .invoke_flow(&caller.flow, FlowValue::data(caller.input.clone()))
                        .await?;
                    caller.result = output.as_data().cloned().unwrap_or_default();
                    Ok(())
                })
                .operation("dispatch", |caller, api| async move {
                    let caller = caller.lock().await;
                    let mailbox = api.typed_resource::<Mailbox>(MAILBOX)?;
                    for _ in 0..caller.count.max(1) {
                        let sink = Arc::clone(&mailbox);
                        let ticket = api.invoke_flow_async(
                            &caller.flow,
                            FlowValue::data(caller.input.clone()),
                            None,
                            Box::new(move |result| sink.deliver(result)),
                        )?;
                        mailbox.tickets.lock().push(ticket);
                    }
                    Ok(())
                })
                .accessor("result", ValueKind::Data, |caller| FlowValue::data(caller.result.clone())),
        );
    registry
}
