//! The test harness: an executor wired to in-memory collaborators.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::Once;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stepline::batch::{Batcher, MemoryBatcher};
use stepline::driver::{DriverResponse, RuntimeDriver};
use stepline::event::{EventPublisher, MemoryPublisher, StoredEvent, TriggerEvent};
use stepline::exec::{
    CancelRequest, ExecutorConfig, Executor, PauseMatchResult, ScheduleOutcome, ScheduleRequest,
};
use stepline::function::{
    CancelSpec, Function, FunctionLoader, FunctionLoaderError, StepDefinition, Trigger,
};
use stepline::lifecycle::{LifecycleEvent, LifecycleListener, MemoryLifecycle};
use stepline::queue::{InMemoryQueue, Payload, Queue, ScheduledItem};
use stepline::state::{InMemoryStateStore, StateStore};
use stepline::types::{RunId, RunIdentifier};

use super::drivers::ScriptedDriver;

/// Function loader over a fixed map.
#[derive(Default)]
pub struct MapLoader {
    functions: parking_lot::Mutex<FxHashMap<Uuid, Arc<Function>>>,
}

impl MapLoader {
    pub fn insert(&self, function: Arc<Function>) {
        self.functions.lock().insert(function.id, function);
    }
}

#[async_trait::async_trait]
impl FunctionLoader for MapLoader {
    async fn load(&self, function_id: Uuid) -> Result<Arc<Function>, FunctionLoaderError> {
        self.functions
            .lock()
            .get(&function_id)
            .cloned()
            .ok_or(FunctionLoaderError::NotFound { function_id })
    }
}

/// A function with one entry step on the scripted driver's runtime.
pub fn function(retries: u32) -> Function {
    Function {
        id: Uuid::new_v4(),
        slug: "test-fn".into(),
        version: 1,
        triggers: vec![Trigger {
            event: "test/run".into(),
            expression: None,
        }],
        steps: vec![StepDefinition {
            id: "step".into(),
            name: "step".into(),
            runtime_type: "test".into(),
            retries: Some(retries),
        }],
        throttle: None,
        debounce: None,
        batch: None,
        concurrency: vec![],
        cancel: vec![],
        priority: None,
        paused_at: None,
    }
}

/// A function that cancels on `abort` events matching `if_expr`.
pub fn cancellable_function(retries: u32, if_expr: Option<&str>) -> Function {
    Function {
        cancel: vec![CancelSpec {
            event: "abort".into(),
            r#if: if_expr.map(str::to_string),
            timeout: None,
        }],
        ..function(retries)
    }
}

/// Executor plus handles onto every in-memory collaborator.
pub struct Harness {
    pub executor: Executor,
    pub store: Arc<InMemoryStateStore>,
    pub queue: Arc<InMemoryQueue>,
    pub publisher: Arc<MemoryPublisher>,
    pub lifecycle: MemoryLifecycle,
    pub driver: Arc<ScriptedDriver>,
    pub batcher: Arc<MemoryBatcher>,
    pub loader: Arc<MapLoader>,
    pub function: Arc<Function>,
    pub account_id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
}

static INIT_TRACING: Once = Once::new();

/// Honor `RUST_LOG` in test runs without double-initializing.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(ErrorLayer::default())
            .try_init();
    });
}

impl Harness {
    pub fn new(function: Function) -> Self {
        Self::with_config(function, ExecutorConfig::default())
    }

    pub fn with_config(function: Function, config: ExecutorConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let lifecycle = MemoryLifecycle::new();
        let driver = Arc::new(ScriptedDriver::new());
        let batcher = Arc::new(MemoryBatcher::new());
        let loader = Arc::new(MapLoader::default());
        let function = Arc::new(function);
        loader.insert(Arc::clone(&function));

        let executor = Executor::builder()
            .state_store(Arc::clone(&store) as Arc<dyn StateStore>)
            .queue(Arc::clone(&queue) as Arc<dyn Queue>)
            .driver(Arc::clone(&driver) as Arc<dyn RuntimeDriver>)
            .function_loader(Arc::clone(&loader) as Arc<dyn FunctionLoader>)
            .publisher(Arc::clone(&publisher) as Arc<dyn EventPublisher>)
            .listener(Arc::new(lifecycle.clone()) as Arc<dyn LifecycleListener>)
            .batcher(Arc::clone(&batcher) as Arc<dyn Batcher>)
            .config(config)
            .build()
            .expect("executor builds");

        Self {
            executor,
            store,
            queue,
            publisher,
            lifecycle,
            driver,
            batcher,
            loader,
            function,
            account_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
        }
    }

    pub fn request(&self, event: StoredEvent) -> ScheduleRequest {
        ScheduleRequest::new(
            Arc::clone(&self.function),
            event,
            self.account_id,
            self.workspace_id,
            self.app_id,
        )
    }

    pub async fn schedule(&self, event: TriggerEvent) -> ScheduleOutcome {
        self.executor
            .schedule(self.request(StoredEvent::new(event)))
            .await
            .expect("schedule succeeds")
    }

    /// Schedule and return the new identifier, panicking on other outcomes.
    pub async fn schedule_run(&self, event: TriggerEvent) -> RunIdentifier {
        match self.schedule(event).await {
            ScheduleOutcome::Scheduled(id) => id,
            other => panic!("expected a scheduled run, got {other:?}"),
        }
    }

    /// Schedule from a pre-built stored event, keeping its internal id.
    pub async fn schedule_stored_run(&self, event: StoredEvent) -> RunIdentifier {
        match self
            .executor
            .schedule(self.request(event))
            .await
            .expect("schedule succeeds")
        {
            ScheduleOutcome::Scheduled(id) => id,
            other => panic!("expected a scheduled run, got {other:?}"),
        }
    }

    /// Dispatch one queue item the way the queue substrate would.
    pub async fn dispatch(
        &self,
        scheduled: ScheduledItem,
    ) -> Result<Option<DriverResponse>, stepline::exec::ExecError> {
        match &scheduled.item.payload {
            Payload::Edge { edge } => {
                self.executor.execute(&scheduled.item, edge, 0).await
            }
            Payload::PauseTimeout { .. } => self
                .executor
                .handle_pause_timeout(&scheduled.item)
                .await
                .map(|()| None),
        }
    }

    /// Drain every currently-due item, applying the retry policy the real
    /// queue would. Future-dated items (sleeps, pause timeouts) stay queued.
    /// Returns the number of dispatched items.
    pub async fn run_queue(&self) -> usize {
        let mut dispatched = 0;
        while let Some(scheduled) = self.queue.pop_due(chrono::Utc::now()) {
            dispatched += 1;
            self.dispatch_with_retry(scheduled).await;
            // Backstop against runaway scripts.
            assert!(dispatched < 100, "queue did not drain");
        }
        dispatched
    }

    /// Fire the earliest queued item regardless of its run-at, as if its
    /// time had come. Returns whether anything fired.
    pub async fn fire_next(&self) -> bool {
        match self.queue.pop() {
            Some(scheduled) => {
                self.dispatch_with_retry(scheduled).await;
                true
            }
            None => false,
        }
    }

    async fn dispatch_with_retry(&self, scheduled: ScheduledItem) {
        if let Err(err) = self.dispatch(scheduled.clone()).await {
            use stepline::exec::ExecError;
            match err {
                ExecError::HandledStepError | ExecError::Driver { .. } => {
                    let mut item = scheduled.item.clone();
                    item.attempt += 1;
                    if item.attempt < item.max_attempts {
                        let _ = self.queue.enqueue(item, chrono::Utc::now()).await;
                    }
                }
                ExecError::NeverRetry { .. } => {}
                other => panic!("unexpected dispatch error: {other}"),
            }
        }
    }

    /// Deliver an event: match pauses, then route invoke finishes.
    pub async fn post_event(&self, event: TriggerEvent) -> PauseMatchResult {
        let stored = StoredEvent::new(event);
        let result = self
            .executor
            .handle_pauses(self.workspace_id, &stored)
            .await
            .expect("pause handling succeeds");
        self.executor
            .handle_invoke_finish(self.workspace_id, &stored)
            .await
            .expect("invoke finish routing succeeds");
        result
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<(), stepline::exec::ExecError> {
        self.executor.cancel(run_id, CancelRequest::default()).await
    }

    /// Lifecycle events observed so far, after draining the dispatcher.
    pub async fn lifecycle_events(&self) -> Vec<LifecycleEvent> {
        self.executor.drain_lifecycle().await;
        self.lifecycle.snapshot()
    }
}
