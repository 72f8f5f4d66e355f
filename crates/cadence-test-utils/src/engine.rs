//! A flow registry wired with the fixture components and resources.

use cadence_core::domain::events::memory::MemoryAuditSink;
use cadence_core::{
    AmbientContext, CoreError, EngineConfig, FlowDefinition, FlowOutcome, FlowRegistry,
    FlowValue, StaticResources,
};
use cadence_monitoring::init_test_tracing;
use std::sync::Arc;

use crate::fixtures::{fixture_components, Gate, Journal, Mailbox, GATE, JOURNAL, MAILBOX};

/// Registry plus handles on everything the fixtures share
pub struct TestEngine {
    /// The registry under test
    pub registry: Arc<FlowRegistry>,
    /// Every audit event emitted
    pub audit: Arc<MemoryAuditSink>,
    /// Gate used by `GateWait.wait`
    pub gate: Arc<Gate>,
    /// Journal written by `Recorder.record`
    pub journal: Arc<Journal>,
    /// Results delivered to `Caller.dispatch`
    pub mailbox: Arc<Mailbox>,
}

impl TestEngine {
    /// Engine with the default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with `config`
    ///
    /// # Panics
    ///
    /// When `config` does not validate.
    pub fn with_config(config: EngineConfig) -> Self {
        init_test_tracing();
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = Arc::new(Gate::new());
        let journal = Arc::new(Journal::default());
        let mailbox = Arc::new(Mailbox::default());
        let resources = StaticResources::new();
        resources.insert_shared(GATE, gate.clone());
        resources.insert_shared(JOURNAL, journal.clone());
        resources.insert_shared(MAILBOX, mailbox.clone());

        let registry = FlowRegistry::builder(fixture_components())
            .with_config(config)
            .with_audit_sink(audit.clone())
            .with_resources(Arc::new(resources))
            .build()
            .expect("test engine configuration is valid");
        Self {
            registry,
            audit,
            gate,
            journal,
            mailbox,
        }
    }

    /// Load flows, panicking on failure
    pub fn load(&self, flows: Vec<FlowDefinition>) -> &Self {
        self.registry.load(flows).expect("fixture flows load");
        self
    }

    /// Invoke `flow` with `input` and no ambient context
    pub async fn invoke(&self, flow: &str, input: FlowValue) -> Result<FlowOutcome, CoreError> {
        self.registry
            .executor(flow)?
            .invoke(input, AmbientContext::new())
            .await
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
