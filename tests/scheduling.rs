mod common;

use std::sync::Arc;
use uuid::Uuid;

use common::fixtures::{cancellable_function, function, Harness, MapLoader};
use stepline::batch::{DebounceError, Debouncer};
use stepline::event::{MemoryPublisher, StoredEvent, TriggerEvent};
use stepline::exec::schedule::{BatchScope, ScheduleError};
use stepline::exec::{Executor, ScheduleOutcome, ScheduleRequest};
use stepline::function::{ConcurrencyLimit, DebounceSpec, Function, ThrottleSpec};
use stepline::lifecycle::{LifecycleEvent, SkipReason};
use stepline::queue::{InMemoryQueue, ItemKind, Queue};
use stepline::state::{InMemoryStateStore, StateStore};
use stepline::types::ConcurrencyScope;

#[tokio::test]
async fn duplicate_idempotency_key_yields_already_exists() {
    let h = Harness::new(function(1));
    let mut req = h.request(StoredEvent::new(TriggerEvent::new("test/run")));
    req.idempotency_key = Some("dedupe-me".into());

    let first = h.executor.schedule(req.clone()).await.unwrap();
    assert!(matches!(first, ScheduleOutcome::Scheduled(_)));

    let err = h.executor.schedule(req).await.unwrap_err();
    assert!(matches!(err, ScheduleError::AlreadyExists { .. }));
    assert_eq!(h.queue.len(), 1, "no second start item");
}

#[tokio::test]
async fn rerun_is_not_deduplicated_against_original_trigger() {
    let h = Harness::new(function(1));
    let event = StoredEvent::new(TriggerEvent::new("test/run"));

    let original = h.schedule_stored_run(event.clone()).await;

    // Rerunning from the same trigger must mint a distinct key.
    let mut req = h.request(event);
    req.original_run_id = Some(original.run_id);
    let rerun = h.executor.schedule(req).await.unwrap();
    let ScheduleOutcome::Scheduled(rerun) = rerun else {
        panic!("rerun was not scheduled");
    };
    assert_ne!(rerun.key, original.key);
    assert_eq!(h.queue.len(), 2);
}

#[tokio::test]
async fn paused_function_is_skipped() {
    let mut f = function(1);
    f.paused_at = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
    let h = Harness::new(f);

    let outcome = h.schedule(TriggerEvent::new("test/run")).await;
    assert!(matches!(
        outcome,
        ScheduleOutcome::Skipped(SkipReason::FunctionPaused)
    ));
    assert!(h.queue.is_empty());

    let events = h.lifecycle_events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::FunctionSkipped { .. })));
}

#[tokio::test]
async fn start_item_carries_run_scoped_job_id() {
    let h = Harness::new(function(1));
    let id = h.schedule_run(TriggerEvent::new("test/run")).await;

    let items = h.queue.snapshot();
    assert_eq!(items.len(), 1);
    let item = &items[0].item;
    assert_eq!(item.kind, ItemKind::Start);
    assert_eq!(item.job_id.as_deref(), Some(id.idempotency_key().as_str()));
    assert_eq!(item.max_attempts, 20);
    assert!(item.edge().is_some_and(stepline::queue::Edge::is_source));

    let events = h.lifecycle_events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::FunctionScheduled { .. })));
}

#[tokio::test]
async fn future_event_timestamps_defer_the_run() {
    let h = Harness::new(function(1));
    let future = chrono::Utc::now() + chrono::Duration::hours(2);
    let mut event = TriggerEvent::new("test/run");
    event.ts = future.timestamp_millis();

    h.schedule_run(event).await;
    let items = h.queue.snapshot();
    assert_eq!(items[0].at.timestamp_millis(), future.timestamp_millis());
}

#[tokio::test]
async fn throttle_key_varies_with_the_key_expression() {
    let mut f = function(1);
    f.throttle = Some(ThrottleSpec {
        limit: 10,
        burst: 2,
        period_seconds: 60,
        key: Some("event.data.customer".into()),
    });
    let h = Harness::new(f);

    h.schedule_run(TriggerEvent::new("test/run").with_data("customer", "a".into()))
        .await;
    let mut req = h.request(StoredEvent::new(
        TriggerEvent::new("test/run").with_data("customer", "b".into()),
    ));
    req.idempotency_key = Some("second".into());
    h.executor.schedule(req).await.unwrap();

    let items = h.queue.snapshot();
    let first = items[0].item.throttle.clone().unwrap();
    let second = items[1].item.throttle.clone().unwrap();
    assert_eq!(first.limit, 10);
    assert!(first.key.contains('-'), "keyed throttle carries a suffix");
    assert_ne!(first.key, second.key);
}

#[tokio::test]
async fn custom_concurrency_keys_carry_the_expression_hash() {
    let mut f = function(1);
    f.concurrency = vec![ConcurrencyLimit {
        scope: ConcurrencyScope::Account,
        key: "event.data.customer".into(),
        limit: 5,
    }];
    let h = Harness::new(f);

    let id = h
        .schedule_run(TriggerEvent::new("test/run").with_data("customer", "acme".into()))
        .await;

    assert_eq!(id.custom_concurrency_keys.len(), 1);
    let key = &id.custom_concurrency_keys[0];
    assert_eq!(key.limit, 5);
    assert!(key.key.starts_with(&format!("a:{}", h.account_id)));
    assert!(key.key.ends_with(":acme"));
    assert!(!key.hash.is_empty());
}

#[tokio::test]
async fn cancellation_trigger_materializes_a_guarded_pause() {
    let h = Harness::new(cancellable_function(1, Some("event.data.id == async.data.id")));
    let event = StoredEvent::new(TriggerEvent::new("test/run").with_data("id", 42.into()));
    let internal_id = event.internal_id;
    let id = h.schedule_stored_run(event).await;

    let pauses = h
        .store
        .pauses_for_event(h.workspace_id, "abort")
        .await
        .unwrap();
    assert_eq!(pauses.len(), 1);
    let pause = &pauses[0];
    assert!(pause.cancel);
    assert_eq!(pause.event.as_deref(), Some("abort"));
    assert_eq!(pause.triggering_event_id, Some(internal_id));

    let expression = pause.expression.as_deref().unwrap();
    assert!(
        expression.contains(&format!("async.ts > {}", id.run_id.timestamp_ms())),
        "guard missing from {expression:?}"
    );
    // event.* specialized into a literal at save time.
    assert!(expression.contains("42"));
    assert!(!expression.contains("event.data.id"));

    let data = pause.expression_data.as_ref().unwrap();
    assert_eq!(data["event"]["data"]["id"], serde_json::json!(42));
}

#[tokio::test]
async fn batch_runs_schedule_with_a_batch_scoped_key() {
    let mut f = function(1);
    f.batch = Some(stepline::function::BatchSpec {
        max_size: 2,
        timeout_seconds: 60,
    });
    let h = Harness::new(f);
    let scope = BatchScope {
        account_id: h.account_id,
        workspace_id: h.workspace_id,
        app_id: h.app_id,
        context: Default::default(),
    };

    let first = h
        .executor
        .append_and_schedule_batch(
            Arc::clone(&h.function),
            StoredEvent::new(TriggerEvent::new("test/run")),
            scope.clone(),
        )
        .await
        .unwrap();
    assert!(first.is_none(), "first append only opens the batch");

    let second = h
        .executor
        .append_and_schedule_batch(
            Arc::clone(&h.function),
            StoredEvent::new(TriggerEvent::new("test/run")),
            scope,
        )
        .await
        .unwrap();
    let Some(ScheduleOutcome::Scheduled(id)) = second else {
        panic!("full batch should schedule");
    };
    assert_eq!(id.event_ids.len(), 2);
    let batch_id = id.batch_id.expect("identifier records the batch");
    assert_eq!(id.key, format!("{}-{}", h.function.id, batch_id));
    assert!(h.batcher.flush_at(batch_id).is_some());
}

struct CountingDebouncer(parking_lot::Mutex<usize>);

#[async_trait::async_trait]
impl Debouncer for CountingDebouncer {
    async fn debounce(
        &self,
        _function: &Function,
        _event: StoredEvent,
    ) -> Result<(), DebounceError> {
        *self.0.lock() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn debounced_functions_forward_to_the_debouncer() {
    let mut f = function(1);
    f.debounce = Some(DebounceSpec {
        period_seconds: 10,
        key: None,
    });
    let f = Arc::new(f);

    let loader = Arc::new(MapLoader::default());
    loader.insert(Arc::clone(&f));
    let debouncer = Arc::new(CountingDebouncer(parking_lot::Mutex::new(0)));
    let queue = Arc::new(InMemoryQueue::new());

    let executor = Executor::builder()
        .state_store(Arc::new(InMemoryStateStore::new()))
        .queue(Arc::clone(&queue) as Arc<dyn Queue>)
        .function_loader(loader)
        .publisher(Arc::new(MemoryPublisher::new()))
        .debouncer(Arc::clone(&debouncer) as Arc<dyn Debouncer>)
        .build()
        .unwrap();

    let req = ScheduleRequest::new(
        Arc::clone(&f),
        StoredEvent::new(TriggerEvent::new("test/run")),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    let outcome = executor.schedule(req.clone()).await.unwrap();
    assert!(matches!(outcome, ScheduleOutcome::Debounced));
    assert_eq!(*debouncer.0.lock(), 1);
    assert!(queue.is_empty());

    // The debouncer re-enters with prevent_debounce and gets a real run.
    let mut req = req;
    req.prevent_debounce = true;
    let outcome = executor.schedule(req).await.unwrap();
    assert!(matches!(outcome, ScheduleOutcome::Scheduled(_)));
    assert_eq!(queue.len(), 1);
}
