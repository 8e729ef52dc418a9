mod common;

use serde_json::json;

use common::drivers::{opcode, opcode_with_opts};
use common::fixtures::{function, Harness};
use stepline::driver::DriverResponse;
use stepline::exec::ExecutorConfig;
use stepline::lifecycle::LifecycleEvent;
use stepline::opcode::Op;
use stepline::state::{MemoizedResult, RunStatus, StateStore};

#[tokio::test]
async fn trigger_edge_is_rewritten_to_the_entry_step() {
    let h = Harness::new(function(1));
    h.driver.respond_final(json!("done"));

    let id = h.schedule_run(stepline::event::TriggerEvent::new("test/run")).await;
    h.run_queue().await;

    let calls = h.driver.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].edge.incoming, "step");

    let md = h.store.metadata(id.run_id).await.unwrap();
    assert_eq!(md.status, RunStatus::Completed);
    assert!(md.started_at.is_some());
    assert!(md.span_id.is_some());

    let events = h.lifecycle_events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::FunctionStarted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::StepStarted { .. })));
}

#[tokio::test]
async fn memoized_steps_are_never_reinvoked() {
    let h = Harness::new(function(1));
    h.driver
        .respond_opcodes(vec![opcode(Op::StepPlanned, "p1")]);
    h.driver.respond_opcodes(vec![{
        let mut op = opcode(Op::Step, "p1");
        op.output = Some(json!(42));
        op
    }]);
    h.driver.respond_opcodes(vec![opcode_with_opts(
        Op::WaitForEvent,
        "w",
        json!({"event": "never", "expires": "1h"}),
    )]);

    h.schedule_run(stepline::event::TriggerEvent::new("test/run")).await;

    assert!(h.fire_next().await, "start edge");
    let planned = h.queue.snapshot()[0].clone();
    assert!(h.fire_next().await, "planned edge");
    assert!(h.fire_next().await, "discovery edge parks on a wait");
    assert_eq!(h.driver.calls().len(), 3);

    // Redelivering the planned edge returns the stored output without
    // another driver invocation.
    let response = h.dispatch(planned).await.unwrap().unwrap();
    assert_eq!(response.output, Some(json!(42)));
    assert!(response.generator.is_empty());
    assert_eq!(h.driver.calls().len(), 3);
}

#[tokio::test]
async fn transport_errors_retry_then_fail_permanently() {
    let h = Harness::new(function(1));
    h.driver.fail_transport("connection refused");
    h.driver.fail_transport("connection refused");

    let id = h.schedule_run(stepline::event::TriggerEvent::new("test/run")).await;
    h.run_queue().await;

    // retries = 1 means two attempts total.
    let calls = h.driver.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].attempt, 1);

    let md = h.store.metadata(id.run_id).await.unwrap();
    assert_eq!(md.status, RunStatus::Failed);

    let published = h.publisher.snapshot();
    assert!(published
        .iter()
        .any(|e| e.name == stepline::event::EVENT_FUNCTION_FINISHED));
    assert!(published
        .iter()
        .any(|e| e.name == stepline::event::EVENT_FUNCTION_FAILED));
}

#[tokio::test]
async fn step_cap_fails_the_run_without_retry() {
    let h = Harness::with_config(function(1), ExecutorConfig::default().with_max_steps(0));
    let id = h.schedule_run(stepline::event::TriggerEvent::new("test/run")).await;
    h.run_queue().await;

    assert!(h.driver.calls().is_empty(), "driver never invoked");
    let md = h.store.metadata(id.run_id).await.unwrap();
    assert_eq!(md.status, RunStatus::Failed);
    let failed = h
        .publisher
        .snapshot()
        .into_iter()
        .find(|e| e.name == stepline::event::EVENT_FUNCTION_FAILED)
        .expect("failure event published");
    assert_eq!(
        failed.data["error"]["message"],
        json!("run exceeded the 0-step cap")
    );
}

#[tokio::test]
async fn concurrent_terminals_complete_exactly_once() {
    let h = Harness::new(function(1));
    h.driver.respond_final(json!("first"));

    h.schedule_run(stepline::event::TriggerEvent::new("test/run")).await;
    let start = h.queue.pop().unwrap();
    let edge = start.item.edge().unwrap().clone();
    h.executor.execute(&start.item, &edge, 0).await.unwrap();

    // A parallel terminal races in with a different output; the duplicate
    // save is accepted and the run is not completed twice.
    let rerun = h
        .executor
        .handle_response(
            &start.item,
            &stepline::queue::Edge {
                outgoing: "step".into(),
                incoming: "step".into(),
                incoming_generator_step: None,
            },
            DriverResponse {
                output: Some(json!("second")),
                request_version: 1,
                ..Default::default()
            },
            2,
        )
        .await
        .unwrap();
    assert!(rerun.is_some());

    let finished: Vec<_> = h
        .publisher
        .snapshot()
        .into_iter()
        .filter(|e| e.name == stepline::event::EVENT_FUNCTION_FINISHED)
        .collect();
    assert_eq!(finished.len(), 1, "exactly one completion event");
    assert_eq!(finished[0].data["result"], json!("first"));
}

#[tokio::test]
async fn metadata_request_version_is_written_through_once() {
    let h = Harness::new(function(1));
    h.driver.respond(DriverResponse {
        generator: vec![{
            let mut op = opcode(Op::Step, "a");
            op.output = Some(json!(1));
            op
        }],
        request_version: 3,
        ..Default::default()
    });
    h.driver.respond_final(json!(null));

    let id = h.schedule_run(stepline::event::TriggerEvent::new("test/run")).await;
    h.run_queue().await;

    let md = h.store.metadata(id.run_id).await.unwrap();
    assert_eq!(md.request_version, 3);
    assert_eq!(
        h.store.load(id.run_id).await.unwrap().stored("a"),
        Some(&MemoizedResult::Data(json!(1)))
    );
}
