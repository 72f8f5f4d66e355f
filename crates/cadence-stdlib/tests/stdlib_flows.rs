use cadence_core::{
    AmbientContext, CoreError, FlowMonitor, FlowRegistry, FlowValue, InvocationStatus,
    NoopAuditSink,
};
use cadence_test_utils::wait_until;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const FLOWS: &str = r#"
flows:
  - name: Greeting
    input: data
    steps:
      - name: Pick
        component: Select
        operation: search
        bindings:
          - property: expression
            source:
              literal: user
        result:
          accessor: result
      - name: Render
        component: Template
        operation: render
        bindings:
          - property: template
            source:
              literal: "Hello, {name}!"
          - property: vars
            source:
              step: Pick
        result:
          accessor: text

  - name: Outer
    steps:
      - name: Call
        component: SubFlow
        operation: invoke
        bindings:
          - property: flow
            source:
              literal: Greeting
          - property: input
            source: flow_input
        result:
          accessor: result
        sub_flows: [Greeting]
      - name: Stamp
        component: Uuid
        operation: generate
        bindings:
          - property: format
            source:
              literal: simple

  - name: Sleepy
    steps:
      - name: Nap
        component: Delay
        operation: wait
        bindings:
          - property: millis
            source:
              literal: 60000
      - name: After
        component: Value
        operation: emit
        bindings:
          - property: value
            source:
              literal: woke
        result:
          accessor: value
"#;

fn registry() -> Arc<FlowRegistry> {
    let registry = FlowRegistry::builder(cadence_stdlib::components())
        .with_audit_sink(Arc::new(NoopAuditSink))
        .build()
        .unwrap();
    registry.load_yaml(FLOWS).unwrap();
    registry
}

#[tokio::test]
async fn test_select_feeds_template() {
    let registry = registry();
    let outcome = registry
        .executor("Greeting")
        .unwrap()
        .invoke(FlowValue::data(json!({"user": {"name": "Ada"}})), AmbientContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, InvocationStatus::Completed);
    assert_eq!(outcome.result, FlowValue::data(json!("Hello, Ada!")));
    assert_eq!(outcome.context.get("Pick"), Some(&FlowValue::data(json!({"name": "Ada"}))));
}

#[tokio::test]
async fn test_sub_flow_result_and_nested_coverage() {
    let registry = registry();
    let outer = registry.executor("Outer").unwrap();
    let outcome = outer
        .invoke(FlowValue::data(json!({"user": {"name": "Grace"}})), AmbientContext::new())
        .await
        .unwrap();

    // Stamp keeps no result, so the call's result is the last one produced
    assert_eq!(outcome.result, FlowValue::data(json!("Hello, Grace!")));
    assert_eq!(outcome.coverage.total_count(), 6);
    assert_eq!(outcome.coverage.covered_count(), 6);

    let greeting = registry.executor("Greeting").unwrap().coverage();
    assert_eq!(greeting.covered_count(), greeting.total_count());
}

#[tokio::test]
async fn test_stop_interrupts_delay() {
    let registry = registry();
    let executor = registry.executor("Sleepy").unwrap();
    let monitor = FlowMonitor::new("Sleepy");

    let run = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            executor
                .invoke_monitored(FlowValue::null(), AmbientContext::new(), monitor)
                .await
        })
    };
    assert!(
        wait_until(Duration::from_secs(5), || monitor.current_step().as_deref() == Some("Nap")).await
    );
    monitor.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("stop unblocks the delay")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, InvocationStatus::Stopped);
    assert!(outcome.context.get("After").is_none());
    assert!(monitor.is_stopped());
    assert!(monitor.is_ended());
}

#[tokio::test]
async fn test_negative_max_pending_is_rejected() {
    let registry = registry();
    registry
        .load_yaml(
            r#"
flows:
  - name: Eager
    steps:
      - name: Fire
        component: SubFlow
        operation: invoke
        bindings:
          - property: flow
            source:
              literal: Greeting
          - property: max_pending
            source:
              literal: -1
        sub_flows: [Greeting]
"#,
        )
        .unwrap();

    let error = registry
        .executor("Eager")
        .unwrap()
        .invoke(FlowValue::null(), AmbientContext::new())
        .await
        .unwrap_err();
    assert!(matches!(error, CoreError::StepExecutionError(_)));
    assert!(error.to_string().contains("max_pending must be a non-negative integer, got -1"));
}
