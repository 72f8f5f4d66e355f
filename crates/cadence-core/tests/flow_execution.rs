use cadence_core::{
    AmbientContext, BindingSource, CoreError, FlowDefinition, FlowMonitor, FlowValue,
    InvocationStatus, StepDefinition,
};
use cadence_test_utils::assertions::{assert_covered, assert_not_covered};
use cadence_test_utils::TestEngine;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::io::Write;

fn recorder_flow(name: &str, steps: &[&str]) -> FlowDefinition {
    steps.iter().fold(FlowDefinition::new(name), |flow, step| {
        flow.step(StepDefinition::new(*step, "Recorder", "record"))
    })
}

#[tokio::test]
async fn test_coverage_counts_every_step_plus_root() {
    let engine = TestEngine::new();
    engine.load(vec![recorder_flow("Trace", &["A", "B", "C"])]);
    let executor = engine.registry.executor("Trace").unwrap();

    let cumulative = executor.coverage();
    assert_eq!(cumulative.total_count(), 4);
    assert_eq!(cumulative.covered_count(), 0);

    let outcome = engine.invoke("Trace", FlowValue::null()).await.unwrap();
    assert_eq!(outcome.status, InvocationStatus::Completed);
    assert_eq!(outcome.coverage.covered_count(), 4);
    assert_eq!(cumulative.covered_count(), 4);
    assert_eq!(
        engine.journal.entries(),
        vec!["Trace.A".to_string(), "Trace.B".into(), "Trace.C".into()]
    );

    executor.reset_coverage();
    assert_eq!(cumulative.covered_count(), 0);
    assert_eq!(cumulative.total_count(), 4);
    // per-invocation trees are independent of the cumulative one
    assert_eq!(outcome.coverage.covered_count(), 4);
}

#[tokio::test]
async fn test_cumulative_coverage_survives_failures() {
    let engine = TestEngine::new();
    engine.load(vec![FlowDefinition::new("Partial")
        .step(StepDefinition::new("A", "Recorder", "record"))
        .step(StepDefinition::new("B", "Failing", "fail"))]);

    let error = engine.invoke("Partial", FlowValue::null()).await.unwrap_err();
    assert_eq!(error, CoreError::ComponentError("fixture failure".into()));

    let coverage = engine.registry.executor("Partial").unwrap().coverage();
    assert_covered(&coverage, "Partial/A");
    assert_not_covered(&coverage, "Partial/B");
    assert_not_covered(&coverage, "Partial");
}

#[tokio::test]
async fn test_instance_handed_between_steps() {
    let engine = TestEngine::new();
    engine.load(vec![FlowDefinition::new("Handoff")
        .step(StepDefinition::new("A", "Counter", "increment"))
        .step(
            StepDefinition::new("B", "Counter", "increment")
                .from_step("A")
                .keep_instance(),
        )]);

    let outcome = engine.invoke("Handoff", FlowValue::null()).await.unwrap();

    assert_eq!(outcome.context.len(), 1);
    assert!(outcome.context.get("A").is_none());
    let kept = outcome
        .context
        .get("B")
        .and_then(FlowValue::as_instance)
        .expect("B keeps the instance");
    let tracked = outcome.context.tracked_instance("A").expect("A's instance is tracked");
    assert!(kept.ptr_eq(tracked));
    assert_eq!(kept.type_name(), "Counter");

    assert_eq!(outcome.coverage.total_steps(), 2);
    assert_eq!(outcome.coverage.covered_steps(), 2);
    assert_eq!(outcome.coverage.covered_count(), 3);
}

#[tokio::test]
async fn test_accessor_reads_shared_instance() {
    let engine = TestEngine::new();
    engine.load(vec![FlowDefinition::new("Tally")
        .step(StepDefinition::new("A", "Counter", "increment").literal("step", json!(5)))
        .step(
            StepDefinition::new("B", "Counter", "increment")
                .from_step("A")
                .keep("total"),
        )
        .step(
            StepDefinition::new("C", "Counter", "increment")
                .bind("start", BindingSource::Step("B".into()))
                .literal("step", json!(1))
                .keep("total"),
        )]);

    let outcome = engine.invoke("Tally", FlowValue::null()).await.unwrap();
    assert_eq!(outcome.context.get("B"), Some(&FlowValue::data(json!(10))));
    assert_eq!(outcome.result, FlowValue::data(json!(11)));
}

#[tokio::test]
async fn test_failing_step_propagates() {
    let engine = TestEngine::new();
    engine.load(vec![FlowDefinition::new("Broken")
        .step(StepDefinition::new("A", "Failing", "fail").literal("message", json!("kaput")))]);
    let executor = engine.registry.executor("Broken").unwrap();
    let monitor = FlowMonitor::new("Broken");

    let error = executor
        .invoke_monitored(FlowValue::null(), AmbientContext::new(), monitor.clone())
        .await
        .unwrap_err();

    assert_eq!(error, CoreError::ComponentError("kaput".into()));
    assert!(monitor.is_ended());
    assert!(!monitor.is_stopped());

    let coverage = executor.coverage();
    assert_eq!(coverage.total_steps(), 1);
    assert_eq!(coverage.covered_steps(), 0);

    let metrics = engine.registry.metrics();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.completed, 0);
    assert_eq!(
        engine.audit.event_types(),
        vec!["flow.started", "step.started", "step.failed", "flow.failed"]
    );
}

#[tokio::test]
async fn test_forward_reference_rejected_at_load() {
    let engine = TestEngine::new();
    let error = engine
        .registry
        .load(vec![FlowDefinition::new("Backwards")
            .step(StepDefinition::new("A", "Counter", "increment").from_step("B"))
            .step(StepDefinition::new("B", "Counter", "increment").keep_instance())])
        .unwrap_err();

    assert!(error.is_configuration(), "unexpected error: {error}");
    assert!(!engine.registry.contains("Backwards"));
}

#[tokio::test]
async fn test_unknown_operation_rejected_at_load() {
    let engine = TestEngine::new();
    let error = engine
        .registry
        .load(vec![FlowDefinition::new("Typo")
            .step(StepDefinition::new("A", "Counter", "incremnt"))])
        .unwrap_err();
    assert!(error.is_configuration());
}

#[tokio::test]
async fn test_nested_flow_coverage_and_result() {
    let engine = TestEngine::new();
    engine.load(vec![
        FlowDefinition::new("Inner").step(
            StepDefinition::new("Count", "Counter", "increment")
                .literal("start", json!(41))
                .keep("total"),
        ),
        FlowDefinition::new("Outer").step(
            StepDefinition::new("Call", "Caller", "invoke")
                .literal("flow", json!("Inner"))
                .keep("result")
                .invokes("Inner"),
        ),
    ]);

    let outcome = engine.invoke("Outer", FlowValue::null()).await.unwrap();
    assert_eq!(outcome.result, FlowValue::data(json!(42)));
    assert_eq!(outcome.coverage.total_count(), 4);
    assert_covered(&outcome.coverage, "Outer/Call/Inner/Count");

    let inner = engine.registry.executor("Inner").unwrap().coverage();
    assert_eq!(inner.covered_count(), 2);
}

#[tokio::test]
async fn test_audit_trail_of_completed_flow() {
    let engine = TestEngine::new();
    engine.load(vec![recorder_flow("Audited", &["A", "B"])]);
    engine.invoke("Audited", FlowValue::null()).await.unwrap();

    assert_eq!(
        engine.audit.event_types(),
        vec![
            "flow.started",
            "step.started",
            "step.completed",
            "step.started",
            "step.completed",
            "flow.completed",
        ]
    );
    assert_eq!(engine.audit.for_step("B").len(), 2);
    assert!(engine.audit.events().iter().all(|e| e.flow == "Audited"));
}

#[tokio::test]
async fn test_load_flows_from_json_file() {
    let engine = TestEngine::new();
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        "{}",
        json!({
            "flows": [{
                "name": "FromDisk",
                "steps": [{"name": "A", "component": "Recorder", "operation": "record"}]
            }]
        })
    )
    .unwrap();

    let loaded = engine.registry.load_file(file.path()).unwrap();
    assert_eq!(loaded, vec!["FromDisk".to_string()]);
    engine.invoke("FromDisk", FlowValue::null()).await.unwrap();
    assert_eq!(engine.journal.entries(), vec!["FromDisk.A".to_string()]);
}

#[tokio::test]
async fn test_load_flows_from_yaml_file() {
    let engine = TestEngine::new();
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(
        br#"
flows:
  - name: Chained
    steps:
      - name: A
        component: Counter
        operation: increment
        result: self
      - name: B
        component: Counter
        operation: increment
        instance:
          from_step: A
        result:
          accessor: total
"#,
    )
    .unwrap();

    engine.registry.load_file(file.path()).unwrap();
    let outcome = engine.invoke("Chained", FlowValue::null()).await.unwrap();
    assert_eq!(outcome.result, FlowValue::data(json!(2)));
}

#[tokio::test]
async fn test_rejected_property_value_fails_the_step() {
    let engine = TestEngine::new();
    engine.load(vec![FlowDefinition::new("BadStep")
        .step(StepDefinition::new("A", "Counter", "increment").literal("step", json!("five")))]);

    let error = engine.invoke("BadStep", FlowValue::null()).await.unwrap_err();
    assert!(matches!(error, CoreError::StepExecutionError(_)));
    assert!(error.to_string().contains("cannot set 'step'"));
    assert_eq!(engine.audit.for_step("A").len(), 2);
}
