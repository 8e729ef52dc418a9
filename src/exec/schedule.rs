//! Scheduling: turning an incoming event (or batch) into a new run.
//!
//! The scheduler mints the run identifier, resolves the idempotency key,
//! evaluates throttle / concurrency / priority expressions, allocates state,
//! materializes cancellation pauses, and enqueues the start edge. Every
//! conflict along the way (existing state, existing queue item) maps to
//! [`ScheduleError::AlreadyExists`] so a duplicate request never produces a
//! second run.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::hash::Hasher;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::batch::{BatchAppendStatus, BatchError, DebounceError};
use crate::event::StoredEvent;
use crate::expr::{Expression, ExprError};
use crate::function::Function;
use crate::lifecycle::{LifecycleEvent, SkipReason};
use crate::pause::Pause;
use crate::queue::{Edge, ItemKind, Payload, QueueError, QueueItem, Throttle};
use crate::state::{RunInput, StateError};
use crate::types::{CustomConcurrencyKey, RunId, RunIdentifier};

use super::Executor;

/// Request to schedule a run.
#[derive(Clone, Debug)]
pub struct ScheduleRequest {
    pub function: Arc<Function>,
    /// Triggering events: one, or a whole batch.
    pub events: Vec<StoredEvent>,
    pub batch_id: Option<Uuid>,
    /// Explicit idempotency key; wins over every derived key.
    pub idempotency_key: Option<String>,
    /// Set when this is a rerun of an earlier run.
    pub original_run_id: Option<RunId>,
    pub replay_id: Option<Uuid>,
    pub account_id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    /// Explicit run-at; otherwise derived from the event timestamp.
    pub at: Option<DateTime<Utc>>,
    /// Skip the debounce forward even when the function declares one.
    pub prevent_debounce: bool,
    /// Trace carrier to persist into run metadata.
    pub context: FxHashMap<String, String>,
}

impl ScheduleRequest {
    /// Minimal request for one event.
    #[must_use]
    pub fn new(
        function: Arc<Function>,
        event: StoredEvent,
        account_id: Uuid,
        workspace_id: Uuid,
        app_id: Uuid,
    ) -> Self {
        Self {
            function,
            events: vec![event],
            batch_id: None,
            idempotency_key: None,
            original_run_id: None,
            replay_id: None,
            account_id,
            workspace_id,
            app_id,
            at: None,
            prevent_debounce: false,
            context: FxHashMap::default(),
        }
    }
}

/// What scheduling produced.
#[derive(Clone, Debug)]
pub enum ScheduleOutcome {
    /// A new run was created and its start edge enqueued.
    Scheduled(RunIdentifier),
    /// The function is paused; no run was created.
    Skipped(SkipReason),
    /// The trigger was forwarded to the debouncer.
    Debounced,
}

/// Scheduling errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ScheduleError {
    /// A run for this `(function, idempotency key)` already exists.
    #[error("run already exists for key {key:?}")]
    #[diagnostic(code(stepline::schedule::already_exists))]
    AlreadyExists { key: String },

    #[error("schedule request carries no events")]
    #[diagnostic(code(stepline::schedule::no_events))]
    NoEvents,

    #[error("function declares debounce but no debouncer is configured")]
    #[diagnostic(code(stepline::schedule::missing_debouncer))]
    MissingDebouncer,

    #[error("batch scheduling requires a configured batcher")]
    #[diagnostic(code(stepline::schedule::missing_batcher))]
    MissingBatcher,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Debounce(#[from] DebounceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),
}

impl Executor {
    /// Schedule a run from an incoming event or batch.
    #[instrument(skip(self, req), fields(function = %req.function.slug), err)]
    pub async fn schedule(
        &self,
        req: ScheduleRequest,
    ) -> Result<ScheduleOutcome, ScheduleError> {
        let function = Arc::clone(&req.function);
        let first = req.events.first().cloned().ok_or(ScheduleError::NoEvents)?;
        let now = Utc::now();

        // Debounced functions accumulate triggers elsewhere; the debouncer
        // schedules the trailing event itself with prevent_debounce set.
        if function.debounce.is_some() && !req.prevent_debounce && req.batch_id.is_none() {
            let debouncer = self
                .debouncer
                .as_ref()
                .ok_or(ScheduleError::MissingDebouncer)?;
            debouncer.debounce(&function, first).await?;
            return Ok(ScheduleOutcome::Debounced);
        }

        let run_id = RunId::new();
        let key = idempotency_key(&req, run_id, &first);

        if function.is_paused(now) {
            let identifier = build_identifier(&req, run_id, key, vec![], None);
            self.lifecycle.notify(LifecycleEvent::FunctionSkipped {
                identifier,
                reason: SkipReason::FunctionPaused,
            });
            return Ok(ScheduleOutcome::Skipped(SkipReason::FunctionPaused));
        }

        let event_env = json!({ "event": first.event.map() });
        let concurrency_keys = custom_concurrency_keys(&function, &req, &event_env)?;
        let priority_factor = priority_factor(&function, &event_env)?;

        let identifier = build_identifier(&req, run_id, key, concurrency_keys, priority_factor);

        // Allocate state; an existing idempotency key means a duplicate
        // request and must not produce a second run.
        self.state
            .create(RunInput {
                identifier: identifier.clone(),
                events: req.events.clone(),
                context: req.context.clone(),
                debugger: false,
            })
            .await
            .map_err(|err| match err {
                StateError::RunExists { key } => ScheduleError::AlreadyExists { key },
                other => ScheduleError::State(other),
            })?;

        if req.batch_id.is_none() {
            self.save_cancellation_pauses(&function, &identifier, &first, now)
                .await?;
        }

        let at = run_at(&req, &first, now);
        let throttle = self.throttle_for(&function, &event_env);

        let item = QueueItem {
            job_id: Some(identifier.idempotency_key()),
            group_id: Uuid::new_v4(),
            workspace_id: req.workspace_id,
            kind: ItemKind::Start,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: self.config.source_edge_retries,
            payload: Payload::Edge {
                edge: Edge::source(),
            },
            throttle,
            run_info: (!req.context.is_empty()).then(|| req.context.clone()),
        };
        match self.queue.enqueue(item.clone(), at).await {
            Ok(()) => {}
            // Queue-level duplicate mirrors the state-level one.
            Err(QueueError::ItemExists { job_id }) => {
                return Err(ScheduleError::AlreadyExists { key: job_id });
            }
            Err(err) => return Err(err.into()),
        }

        self.lifecycle.notify(LifecycleEvent::FunctionScheduled {
            identifier: identifier.clone(),
            item,
        });

        Ok(ScheduleOutcome::Scheduled(identifier))
    }

    /// Materialize one pause per declared cancellation trigger.
    ///
    /// The saved expression always ANDs a creation-time guard so historical
    /// events can never cancel the run, while late events (or events without
    /// a timestamp) still match:
    /// `async.ts == null || async.ts > <run creation ms>`.
    async fn save_cancellation_pauses(
        &self,
        function: &Function,
        identifier: &RunIdentifier,
        first: &StoredEvent,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        for spec in &function.cancel {
            let guard = Expression::parse(&format!(
                "async.ts == null || async.ts > {}",
                identifier.run_id.timestamp_ms()
            ))?;

            let (expression, expression_data) = match &spec.r#if {
                None => (guard, None),
                Some(src) => {
                    let user = Expression::parse(src)?;
                    // Persist only the attributes the user expression reads.
                    let data = user.filtered_attributes(&json!({
                        "event": first.event.map()
                    }));
                    // Specialize event.* references to literals so the
                    // aggregate index can key on them.
                    let specialized = user.interpolate("event", &first.event.map());
                    (specialized.and(guard), Some(data))
                }
            };

            let timeout = spec
                .timeout
                .as_deref()
                .and_then(|t| crate::opcode::parse_duration(t).ok())
                .unwrap_or(self.config.cancel_timeout);

            let pause = Pause {
                id: Uuid::new_v4(),
                workspace_id: identifier.workspace_id,
                identifier: identifier.clone(),
                group_id: Uuid::new_v4(),
                outgoing: "cancel".into(),
                incoming: "cancel".into(),
                opcode: None,
                expires: now + timeout,
                event: Some(spec.event.clone()),
                expression: Some(expression.to_string()),
                expression_data,
                data_key: "cancel".into(),
                triggering_event_id: Some(first.internal_id),
                invoke_correlation_id: None,
                invoke_target_fn_id: None,
                step_span_id: None,
                trace_started_at: None,
                cancel: true,
                on_timeout: false,
            };
            match self.state.save_pause(pause.clone()).await {
                Ok(()) => self.aggregator.add(pause),
                Err(StateError::PauseExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Throttle key: hash of the function id, suffixed with the hash of the
    /// evaluated key expression when one is declared.
    fn throttle_for(&self, function: &Function, env: &Value) -> Option<Throttle> {
        let spec = function.throttle.as_ref()?;
        let mut key = fxhash_hex(function.id.to_string().as_bytes());
        if let Some(src) = &spec.key {
            if let Ok(expr) = Expression::parse(src) {
                let value = expr.resolve_value(env);
                key = format!("{key}-{}", fxhash_hex(value.to_string().as_bytes()));
            }
        }
        Some(Throttle {
            key,
            limit: spec.limit,
            burst: spec.burst,
            period_seconds: spec.period_seconds,
        })
    }
}

/// Key precedence: explicit key, else the run id for reruns (so a rerun is
/// not deduplicated against its original trigger), else the event's internal
/// id, else the batch id.
fn idempotency_key(req: &ScheduleRequest, run_id: RunId, first: &StoredEvent) -> String {
    if let Some(key) = req.idempotency_key.as_ref().filter(|k| !k.is_empty()) {
        return key.clone();
    }
    if req.original_run_id.is_some() {
        return run_id.to_string();
    }
    match req.batch_id {
        Some(batch_id) if req.events.len() > 1 => batch_id.to_string(),
        _ => first.internal_id.to_string(),
    }
}

fn build_identifier(
    req: &ScheduleRequest,
    run_id: RunId,
    key: String,
    custom_concurrency_keys: Vec<CustomConcurrencyKey>,
    priority_factor: Option<i64>,
) -> RunIdentifier {
    RunIdentifier {
        workflow_id: req.function.id,
        workflow_version: req.function.version,
        run_id,
        event_id: req
            .events
            .first()
            .map(|e| e.internal_id)
            .unwrap_or_default(),
        event_ids: req.events.iter().map(|e| e.internal_id).collect(),
        batch_id: req.batch_id,
        original_run_id: req.original_run_id,
        replay_id: req.replay_id,
        account_id: req.account_id,
        workspace_id: req.workspace_id,
        app_id: req.app_id,
        key,
        custom_concurrency_keys,
        priority_factor,
    }
}

/// Evaluate each custom concurrency limit's key against the first event.
///
/// The raw expression's hash rides along so a function-version upgrade can
/// re-target the limit bucket.
fn custom_concurrency_keys(
    function: &Function,
    req: &ScheduleRequest,
    env: &Value,
) -> Result<Vec<CustomConcurrencyKey>, ExprError> {
    let mut keys = Vec::with_capacity(function.concurrency.len());
    for limit in &function.concurrency {
        let expr = Expression::parse(&limit.key)?;
        let value = expr.resolve_value(env);
        let scope_prefix = match limit.scope {
            crate::types::ConcurrencyScope::Function => format!("f:{}", function.id),
            crate::types::ConcurrencyScope::Account => format!("a:{}", req.account_id),
            crate::types::ConcurrencyScope::Environment => format!("e:{}", req.workspace_id),
        };
        keys.push(CustomConcurrencyKey {
            scope: limit.scope,
            key: format!("{scope_prefix}:{}", value_text(&value)),
            hash: fxhash_hex(limit.key.as_bytes()),
            limit: limit.limit,
        });
    }
    Ok(keys)
}

fn priority_factor(function: &Function, env: &Value) -> Result<Option<i64>, ExprError> {
    let Some(src) = function.priority.as_ref().and_then(|p| p.run.as_ref()) else {
        return Ok(None);
    };
    let expr = Expression::parse(src)?;
    Ok(expr.resolve_value(env).as_i64())
}

/// Scheduled instant: the explicit request time, else the event timestamp
/// when it lies in the future, else now.
fn run_at(req: &ScheduleRequest, first: &StoredEvent, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(at) = req.at {
        return at.max(now);
    }
    DateTime::<Utc>::from_timestamp_millis(first.event.ts)
        .filter(|ts| *ts > now)
        .unwrap_or(now)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn fxhash_hex(bytes: &[u8]) -> String {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

// ---------------------------------------------------------------------------
// Batch glue
// ---------------------------------------------------------------------------

/// Tenant scope for batch-driven scheduling.
#[derive(Clone, Debug)]
pub struct BatchScope {
    pub account_id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub context: FxHashMap<String, String>,
}

impl Executor {
    /// Append an event to the function's batch; flush when it fills.
    ///
    /// A new batch also records its flush deadline so a timer can run the
    /// batch even if it never fills. Returns the schedule outcome when the
    /// append filled the batch, `None` otherwise.
    #[instrument(skip(self, function, event, scope), fields(function = %function.slug), err)]
    pub async fn append_and_schedule_batch(
        &self,
        function: Arc<Function>,
        event: StoredEvent,
        scope: BatchScope,
    ) -> Result<Option<ScheduleOutcome>, ScheduleError> {
        let batcher = self
            .batcher
            .as_ref()
            .ok_or(ScheduleError::MissingBatcher)?;
        let outcome = batcher.append(&function, event).await?;
        match outcome.status {
            BatchAppendStatus::New => {
                let timeout = function
                    .batch
                    .as_ref()
                    .map_or(60, |b| b.timeout_seconds);
                batcher
                    .schedule_flush(
                        outcome.batch_id,
                        Utc::now() + chrono::Duration::seconds(timeout as i64),
                    )
                    .await?;
                Ok(None)
            }
            BatchAppendStatus::Appended => Ok(None),
            BatchAppendStatus::Full => self
                .retrieve_and_schedule_batch(function, outcome.batch_id, scope)
                .await
                .map(Some),
        }
    }

    /// Pull a closed batch and schedule one run over its events.
    #[instrument(skip(self, function, scope), fields(function = %function.slug), err)]
    pub async fn retrieve_and_schedule_batch(
        &self,
        function: Arc<Function>,
        batch_id: Uuid,
        scope: BatchScope,
    ) -> Result<ScheduleOutcome, ScheduleError> {
        let batcher = self
            .batcher
            .as_ref()
            .ok_or(ScheduleError::MissingBatcher)?;
        let events = batcher.retrieve(batch_id).await?;
        if events.is_empty() {
            return Err(BatchError::NotFound { batch_id }.into());
        }
        let request = ScheduleRequest {
            function: Arc::clone(&function),
            events,
            batch_id: Some(batch_id),
            idempotency_key: Some(format!("{}-{}", function.id, batch_id)),
            original_run_id: None,
            replay_id: None,
            account_id: scope.account_id,
            workspace_id: scope.workspace_id,
            app_id: scope.app_id,
            at: None,
            prevent_debounce: true,
            context: scope.context,
        };
        self.schedule(request).await
    }
}
