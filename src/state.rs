//! Run state and the state store seam.
//!
//! Per-run durable state: metadata (status, trace context, negotiated
//! protocol version), the triggering events, and a map of memoized step
//! results. The engine reads and writes it exclusively through the
//! [`StateStore`] trait; [`InMemoryStateStore`] is the complete in-process
//! implementation used by tests and local development.
//!
//! Two store-enforced guarantees carry most of the engine's idempotency:
//!
//! - `update_metadata` applies `started_at` / `span_id` at most once (first
//!   write wins), so retried first attempts never clobber the recorded start;
//! - `save_response` rejects a second write for the same step id with
//!   [`StateError::DuplicateResponse`], which collapses concurrent terminal
//!   responses into a single completion.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::event::StoredEvent;
use crate::pause::Pause;
use crate::types::{RunId, RunIdentifier};

/// How long a pause lease is held before another consumer may claim it.
const PAUSE_LEASE_SECS: i64 = 30;

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Dropped before start because a concurrency bound was exceeded.
    Overflowed,
}

impl RunStatus {
    /// Terminal states are sticky: once entered, no further transition.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Overflowed
        )
    }
}

/// Mutable per-run metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub identifier: RunIdentifier,
    pub status: RunStatus,
    /// Set once, on the first attempt of the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Root span id of the run, set together with `started_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// SDK protocol version; `-1` until the first driver response declares it.
    pub request_version: i32,
    /// Set when a response carried more than one opcode: parallel fan-out
    /// requires the SDK to plan steps instead of executing in-line.
    #[serde(default)]
    pub disable_immediate_execution: bool,
    #[serde(default)]
    pub debugger: bool,
    /// Serialized trace carrier injected at schedule time.
    #[serde(default)]
    pub context: FxHashMap<String, String>,
}

/// Partial metadata update; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct MetadataUpdate {
    /// Single-shot: applied only if not already set.
    pub started_at: Option<DateTime<Utc>>,
    /// Single-shot: applied only if not already set.
    pub span_id: Option<String>,
    pub request_version: Option<i32>,
    pub disable_immediate_execution: Option<bool>,
}

/// A memoized step result, wrapped in a `data` / `error` discriminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoizedResult {
    Data(Value),
    Error(Value),
}

impl MemoizedResult {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, MemoizedResult::Error(_))
    }

    /// The wrapped value, whichever side it is on.
    #[must_use]
    pub fn value(&self) -> &Value {
        match self {
            MemoizedResult::Data(v) | MemoizedResult::Error(v) => v,
        }
    }
}

/// Full state of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub metadata: RunMetadata,
    pub events: Vec<StoredEvent>,
    /// Memoized step outputs and errors, keyed by step id.
    pub results: FxHashMap<String, MemoizedResult>,
}

impl RunState {
    /// The first (or only) triggering event.
    #[must_use]
    pub fn event(&self) -> Option<&StoredEvent> {
        self.events.first()
    }

    #[must_use]
    pub fn stored(&self, step_id: &str) -> Option<&MemoizedResult> {
        self.results.get(step_id)
    }

    /// Number of memoized steps, used by the step-cap validator.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.results.len()
    }
}

/// Input to [`StateStore::create`].
#[derive(Clone, Debug)]
pub struct RunInput {
    pub identifier: RunIdentifier,
    pub events: Vec<StoredEvent>,
    pub context: FxHashMap<String, String>,
    pub debugger: bool,
}

/// Errors surfaced by the state store.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    /// A run with the same idempotency key already exists. Callers treat
    /// this as "already scheduled".
    #[error("run already exists: {key}")]
    #[diagnostic(code(stepline::state::run_exists))]
    RunExists { key: String },

    #[error("run not found: {run_id}")]
    #[diagnostic(code(stepline::state::run_not_found))]
    RunNotFound { run_id: RunId },

    /// A result for this step id was already saved; the caller's write is a
    /// duplicate and its side-effects must not repeat.
    #[error("duplicate response for step {step_id}")]
    #[diagnostic(code(stepline::state::duplicate_response))]
    DuplicateResponse { step_id: String },

    /// Saving an opcode pause whose deterministic id already exists.
    /// Idempotent success for callers.
    #[error("pause already exists: {pause_id}")]
    #[diagnostic(code(stepline::state::pause_exists))]
    PauseExists { pause_id: Uuid },

    #[error("pause not found: {pause_id}")]
    #[diagnostic(code(stepline::state::pause_not_found))]
    PauseNotFound { pause_id: Uuid },

    /// Another consumer currently holds the pause lease.
    #[error("pause is leased: {pause_id}")]
    #[diagnostic(code(stepline::state::pause_leased))]
    PauseLeased { pause_id: Uuid },

    #[error("state backend error: {message}")]
    #[diagnostic(code(stepline::state::backend))]
    Backend { message: String },
}

/// Durable per-run KV plus the pause index.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Allocate state for a new run. Fails with [`StateError::RunExists`]
    /// when the identifier's idempotency key is already taken.
    async fn create(&self, input: RunInput) -> Result<RunState, StateError>;

    async fn load(&self, run_id: RunId) -> Result<RunState, StateError>;

    async fn exists(&self, run_id: RunId) -> Result<bool, StateError>;

    async fn metadata(&self, run_id: RunId) -> Result<RunMetadata, StateError>;

    /// Apply a partial metadata update. `started_at` and `span_id` are
    /// single-shot: the first write wins and later writes are ignored.
    async fn update_metadata(
        &self,
        run_id: RunId,
        update: MetadataUpdate,
    ) -> Result<(), StateError>;

    /// Memoize a step result. A second save for the same step id fails with
    /// [`StateError::DuplicateResponse`].
    async fn save_response(
        &self,
        run_id: RunId,
        step_id: &str,
        result: MemoizedResult,
    ) -> Result<(), StateError>;

    /// Transition run status. Terminal states are sticky; a transition out
    /// of one is ignored.
    async fn set_status(&self, run_id: RunId, status: RunStatus) -> Result<(), StateError>;

    /// Drop all state for a run. Returns whether anything was deleted.
    async fn delete(&self, run_id: RunId) -> Result<bool, StateError>;

    /// Persist a pause. Fails with [`StateError::PauseExists`] when the id
    /// is already present (idempotent re-issue).
    async fn save_pause(&self, pause: Pause) -> Result<(), StateError>;

    /// Lease a pause for consumption. At most one caller holds the lease at
    /// a time; others see [`StateError::PauseLeased`] until it lapses.
    async fn lease_pause(&self, pause_id: Uuid) -> Result<Pause, StateError>;

    /// Consume a leased pause: write `data` under the pause's `data_key` in
    /// run state (when present) and delete the pause.
    async fn consume_pause(&self, pause_id: Uuid, data: Option<Value>) -> Result<(), StateError>;

    async fn delete_pause(&self, pause_id: Uuid) -> Result<(), StateError>;

    async fn pause_by_id(&self, pause_id: Uuid) -> Result<Pause, StateError>;

    /// All pauses in `workspace` that can match an event named `event`:
    /// those filtered to that name plus those with no name filter.
    async fn pauses_for_event(
        &self,
        workspace_id: Uuid,
        event: &str,
    ) -> Result<Vec<Pause>, StateError>;

    async fn pause_by_invoke_correlation(
        &self,
        workspace_id: Uuid,
        correlation_id: &str,
    ) -> Result<Pause, StateError>;
}

/// Complete in-process [`StateStore`].
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    runs: FxHashMap<RunId, RunState>,
    /// Idempotency index: `identifier.idempotency_key()` -> run id.
    idempotency: FxHashMap<String, RunId>,
    pauses: FxHashMap<Uuid, Pause>,
    leases: FxHashMap<Uuid, DateTime<Utc>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pauses, for tests.
    #[must_use]
    pub fn pause_count(&self) -> usize {
        self.inner.lock().pauses.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(&self, input: RunInput) -> Result<RunState, StateError> {
        let mut inner = self.inner.lock();
        let key = input.identifier.idempotency_key();
        if inner.idempotency.contains_key(&key) {
            return Err(StateError::RunExists { key });
        }
        let run_id = input.identifier.run_id;
        let state = RunState {
            metadata: RunMetadata {
                identifier: input.identifier,
                status: RunStatus::Scheduled,
                started_at: None,
                span_id: None,
                request_version: -1,
                disable_immediate_execution: false,
                debugger: input.debugger,
                context: input.context,
            },
            events: input.events,
            results: FxHashMap::default(),
        };
        inner.idempotency.insert(key, run_id);
        inner.runs.insert(run_id, state.clone());
        Ok(state)
    }

    async fn load(&self, run_id: RunId) -> Result<RunState, StateError> {
        self.inner
            .lock()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StateError::RunNotFound { run_id })
    }

    async fn exists(&self, run_id: RunId) -> Result<bool, StateError> {
        Ok(self.inner.lock().runs.contains_key(&run_id))
    }

    async fn metadata(&self, run_id: RunId) -> Result<RunMetadata, StateError> {
        Ok(self.load(run_id).await?.metadata)
    }

    async fn update_metadata(
        &self,
        run_id: RunId,
        update: MetadataUpdate,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let state = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StateError::RunNotFound { run_id })?;
        let md = &mut state.metadata;
        if md.started_at.is_none() {
            md.started_at = update.started_at;
        }
        if md.span_id.is_none() {
            md.span_id = update.span_id;
        }
        if let Some(v) = update.request_version {
            md.request_version = v;
        }
        if let Some(v) = update.disable_immediate_execution {
            md.disable_immediate_execution = v;
        }
        Ok(())
    }

    async fn save_response(
        &self,
        run_id: RunId,
        step_id: &str,
        result: MemoizedResult,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let state = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StateError::RunNotFound { run_id })?;
        if state.results.contains_key(step_id) {
            return Err(StateError::DuplicateResponse {
                step_id: step_id.to_string(),
            });
        }
        state.results.insert(step_id.to_string(), result);
        Ok(())
    }

    async fn set_status(&self, run_id: RunId, status: RunStatus) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let state = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StateError::RunNotFound { run_id })?;
        if state.metadata.status.is_terminal() {
            return Ok(());
        }
        state.metadata.status = status;
        Ok(())
    }

    async fn delete(&self, run_id: RunId) -> Result<bool, StateError> {
        let mut inner = self.inner.lock();
        let removed = inner.runs.remove(&run_id);
        if let Some(state) = &removed {
            let key = state.metadata.identifier.idempotency_key();
            inner.idempotency.remove(&key);
        }
        Ok(removed.is_some())
    }

    async fn save_pause(&self, pause: Pause) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if inner.pauses.contains_key(&pause.id) {
            return Err(StateError::PauseExists { pause_id: pause.id });
        }
        inner.pauses.insert(pause.id, pause);
        Ok(())
    }

    async fn lease_pause(&self, pause_id: Uuid) -> Result<Pause, StateError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let pause = inner
            .pauses
            .get(&pause_id)
            .cloned()
            .ok_or(StateError::PauseNotFound { pause_id })?;
        if let Some(until) = inner.leases.get(&pause_id) {
            if *until > now {
                return Err(StateError::PauseLeased { pause_id });
            }
        }
        inner
            .leases
            .insert(pause_id, now + Duration::seconds(PAUSE_LEASE_SECS));
        Ok(pause)
    }

    async fn consume_pause(&self, pause_id: Uuid, data: Option<Value>) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let pause = inner
            .pauses
            .remove(&pause_id)
            .ok_or(StateError::PauseNotFound { pause_id })?;
        inner.leases.remove(&pause_id);
        if let Some(data) = data {
            let run_id = pause.identifier.run_id;
            if let Some(state) = inner.runs.get_mut(&run_id) {
                state
                    .results
                    .entry(pause.data_key.clone())
                    .or_insert(MemoizedResult::Data(data));
            }
        }
        Ok(())
    }

    async fn delete_pause(&self, pause_id: Uuid) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        inner.pauses.remove(&pause_id);
        inner.leases.remove(&pause_id);
        Ok(())
    }

    async fn pause_by_id(&self, pause_id: Uuid) -> Result<Pause, StateError> {
        self.inner
            .lock()
            .pauses
            .get(&pause_id)
            .cloned()
            .ok_or(StateError::PauseNotFound { pause_id })
    }

    async fn pauses_for_event(
        &self,
        workspace_id: Uuid,
        event: &str,
    ) -> Result<Vec<Pause>, StateError> {
        Ok(self
            .inner
            .lock()
            .pauses
            .values()
            .filter(|p| p.workspace_id == workspace_id)
            .filter(|p| p.event.as_deref().is_none_or(|name| name == event))
            .cloned()
            .collect())
    }

    async fn pause_by_invoke_correlation(
        &self,
        workspace_id: Uuid,
        correlation_id: &str,
    ) -> Result<Pause, StateError> {
        self.inner
            .lock()
            .pauses
            .values()
            .find(|p| {
                p.workspace_id == workspace_id
                    && p.invoke_correlation_id.as_deref() == Some(correlation_id)
            })
            .cloned()
            .ok_or(StateError::PauseNotFound {
                pause_id: Uuid::nil(),
            })
    }
}
