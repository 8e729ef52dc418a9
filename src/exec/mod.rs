//! The execution engine: scheduling, step dispatch, opcode interpretation,
//! pause matching, and terminal transitions.
//!
//! [`Executor`] is the coordinator over the external collaborators — state
//! store, queue, runtime drivers, function loader, event publisher — wired
//! together by [`ExecutorBuilder`]. It is reentrant and safe for concurrent
//! calls across distinct runs; per-run correctness rests on deterministic
//! pause ids, queue job-id idempotency, store-enforced single-shot metadata
//! writes, and pause leasing rather than on any engine-side lock.
//!
//! # Module layout
//!
//! - [`config`] — tuning knobs ([`ExecutorConfig`])
//! - [`schedule`] — turning a schedule request into a new run
//! - [`run`] — step execution and driver-response handling
//! - [`interpreter`] — the opcode dispatch table
//! - [`pauses`] — event matching, resumption, and invoke-finish routing
//! - [`cancel`] — cancellation and the finish handler

pub mod cancel;
pub mod config;
pub mod interpreter;
pub mod pauses;
pub mod run;
pub mod schedule;

pub use cancel::CancelRequest;
pub use config::ExecutorConfig;
pub use pauses::PauseMatchResult;
pub use schedule::{ScheduleOutcome, ScheduleRequest};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;

use crate::batch::{Batcher, Debouncer};
use crate::driver::{DriverRegistry, RegistryError, RuntimeDriver};
use crate::event::{EventPublisher, PublishError};
use crate::expr::aggregate::PauseIndex;
use crate::expr::ExprError;
use crate::function::{FunctionLoader, FunctionLoaderError};
use crate::lifecycle::{LifecycleDispatcher, LifecycleListener};
use crate::opcode::OpcodeError;
use crate::queue::{Queue, QueueError};
use crate::state::{StateError, StateStore};

/// Construct-time configuration failures.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("executor requires a state store")]
    #[diagnostic(code(stepline::exec::missing_state_store))]
    MissingStateStore,

    #[error("executor requires a queue")]
    #[diagnostic(code(stepline::exec::missing_queue))]
    MissingQueue,

    #[error("executor requires a function loader")]
    #[diagnostic(code(stepline::exec::missing_function_loader))]
    MissingFunctionLoader,

    #[error("executor requires an event publisher")]
    #[diagnostic(code(stepline::exec::missing_publisher))]
    MissingPublisher,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Driver(#[from] RegistryError),
}

/// Errors surfaced by engine operations.
///
/// The queue interprets three shapes specially: [`ExecError::HandledStepError`]
/// (retry a handled user step error), [`ExecError::NeverRetry`] (drop the
/// item), and [`ExecError::RetryAt`] (retry no earlier than the given
/// instant). Everything else retries per the item's attempt policy.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    /// Sentinel: a user step error was handled and persisted for retry.
    #[error("handled step error")]
    #[diagnostic(code(stepline::exec::handled_step_error))]
    HandledStepError,

    /// The wrapped failure must not be retried.
    #[error("{source}")]
    #[diagnostic(code(stepline::exec::never_retry))]
    NeverRetry {
        #[source]
        source: Box<ExecError>,
    },

    /// The wrapped failure may be retried, but not before `at`.
    #[error("{source} (retry at {at})")]
    #[diagnostic(code(stepline::exec::retry_at))]
    RetryAt {
        at: DateTime<Utc>,
        #[source]
        source: Box<ExecError>,
    },

    /// Attempting to cancel a run that already reached a terminal state.
    #[error("function already ended")]
    #[diagnostic(code(stepline::exec::function_ended))]
    FunctionEnded,

    /// A retryable driver failure; the queue increments the attempt.
    #[error("driver response error: {message}")]
    #[diagnostic(code(stepline::exec::driver))]
    Driver { message: String },

    #[error("no driver registered for runtime type {runtime:?}")]
    #[diagnostic(
        code(stepline::exec::missing_driver),
        help("Register a driver for this runtime type when building the executor.")
    )]
    MissingDriver { runtime: String },

    /// Static fan-out is rejected; parallelism flows through opcodes.
    #[error("function declares {count} steps; only a single entry step is supported")]
    #[diagnostic(code(stepline::exec::invalid_topology))]
    InvalidTopology { count: usize },

    /// Validation failure recorded as the run's terminal error. Never
    /// returned to the queue: the item is swallowed after the run is
    /// finalized.
    #[error("run exceeded the {max_steps}-step cap")]
    #[diagnostic(code(stepline::exec::step_cap))]
    StepCapExceeded { max_steps: usize },

    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Opcode(#[from] OpcodeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Function(#[from] FunctionLoaderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Publish(#[from] PublishError),
}

impl ExecError {
    /// Wrap an error so the queue never retries it.
    #[must_use]
    pub fn never_retry(source: ExecError) -> Self {
        ExecError::NeverRetry {
            source: Box::new(source),
        }
    }

    /// Wrap an error with an earliest-retry instant.
    #[must_use]
    pub fn retry_at(source: ExecError, at: DateTime<Utc>) -> Self {
        ExecError::RetryAt {
            at,
            source: Box::new(source),
        }
    }
}

/// The engine. See the module docs for the operation map.
pub struct Executor {
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) drivers: DriverRegistry,
    pub(crate) functions: Arc<dyn FunctionLoader>,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) lifecycle: LifecycleDispatcher,
    pub(crate) aggregator: Arc<PauseIndex>,
    pub(crate) batcher: Option<Arc<dyn Batcher>>,
    pub(crate) debouncer: Option<Arc<dyn Debouncer>>,
    pub(crate) config: ExecutorConfig,
}

impl Executor {
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// The aggregate pause index, exposed for inspection in tests.
    #[must_use]
    pub fn aggregator(&self) -> &PauseIndex {
        &self.aggregator
    }

    /// Wait for queued lifecycle notifications to drain. Test hook.
    pub async fn drain_lifecycle(&self) {
        self.lifecycle.drain().await;
    }
}

/// Builder wiring the executor's collaborators.
///
/// The driver registry and listener list are write-once: both freeze when
/// [`build`](Self::build) runs, and duplicate driver registration fails
/// construction.
#[derive(Default)]
pub struct ExecutorBuilder {
    state: Option<Arc<dyn StateStore>>,
    queue: Option<Arc<dyn Queue>>,
    drivers: DriverRegistry,
    driver_error: Option<RegistryError>,
    functions: Option<Arc<dyn FunctionLoader>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    batcher: Option<Arc<dyn Batcher>>,
    debouncer: Option<Arc<dyn Debouncer>>,
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    #[must_use]
    pub fn state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Register a runtime driver. Duplicates are reported at build time.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn RuntimeDriver>) -> Self {
        if self.driver_error.is_none() {
            if let Err(err) = self.drivers.register(driver) {
                self.driver_error = Some(err);
            }
        }
        self
    }

    #[must_use]
    pub fn function_loader(mut self, functions: Arc<dyn FunctionLoader>) -> Self {
        self.functions = Some(functions);
        self
    }

    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn batcher(mut self, batcher: Arc<dyn Batcher>) -> Self {
        self.batcher = Some(batcher);
        self
    }

    #[must_use]
    pub fn debouncer(mut self, debouncer: Arc<dyn Debouncer>) -> Self {
        self.debouncer = Some(debouncer);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Executor, ConfigError> {
        if let Some(err) = self.driver_error {
            return Err(err.into());
        }
        Ok(Executor {
            state: self.state.ok_or(ConfigError::MissingStateStore)?,
            queue: self.queue.ok_or(ConfigError::MissingQueue)?,
            drivers: self.drivers,
            functions: self.functions.ok_or(ConfigError::MissingFunctionLoader)?,
            publisher: self.publisher.ok_or(ConfigError::MissingPublisher)?,
            lifecycle: LifecycleDispatcher::new(self.listeners),
            aggregator: Arc::new(PauseIndex::new()),
            batcher: self.batcher,
            debouncer: self.debouncer,
            config: self.config,
        })
    }
}

/// Mint a fresh span id for trace continuation across persistence.
pub(crate) fn new_span_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}
