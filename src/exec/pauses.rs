//! The pause engine: matching incoming events against saved pauses and
//! resuming or cancelling the runs behind them.
//!
//! Two strategies share one per-pause path. Small candidate sets are scanned
//! naively under a weighted semaphore; past a threshold the aggregate index
//! supplies candidates in O(matches). Either way the full expression is
//! re-evaluated before anything is consumed, and consumption is protected by
//! the store's pause lease so exactly one matcher wins.

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::instrument;
use uuid::Uuid;

use crate::event::StoredEvent;
use crate::expr::Expression;
use crate::lifecycle::LifecycleEvent;
use crate::opcode::Op;
use crate::pause::{Pause, ResumeRequest};
use crate::queue::{Edge, ItemKind, Payload, QueueItem};
use crate::state::StateError;

use super::cancel::CancelRequest;
use super::{ExecError, Executor};

/// Counters returned by one round of pause handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseMatchResult {
    /// Pauses whose expressions were evaluated against the event.
    pub attempted: usize,
    /// Pauses consumed (resumed or cancelled) by this event.
    pub consumed: usize,
}

impl Executor {
    /// Match an incoming event against saved pauses.
    #[instrument(
        skip(self, event),
        fields(event = %event.event.name, workspace = %workspace_id)
    )]
    pub async fn handle_pauses(
        &self,
        workspace_id: Uuid,
        event: &StoredEvent,
    ) -> Result<PauseMatchResult, ExecError> {
        let candidates = self
            .state
            .pauses_for_event(workspace_id, &event.event.name)
            .await?;

        // The candidate count is the best estimate we have before paying
        // for evaluation; past the threshold, the index prunes for us.
        let candidates = if candidates.len() > self.config.aggregate_pause_threshold {
            self.aggregator.matches(workspace_id, &event.event)
        } else {
            candidates
        };

        let semaphore = Arc::new(Semaphore::new(self.config.pause_handle_concurrency));
        let results = join_all(candidates.into_iter().map(|pause| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.process_pause(pause, event).await
            }
        }))
        .await;

        let mut outcome = PauseMatchResult::default();
        for result in results {
            outcome.attempted += 1;
            match result {
                Ok(true) => outcome.consumed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "pause handling failed");
                }
            }
        }
        Ok(outcome)
    }

    /// The shared per-pause path. Returns whether the pause was consumed.
    async fn process_pause(&self, pause: Pause, event: &StoredEvent) -> Result<bool, ExecError> {
        let now = Utc::now();

        // Expired pauses are deleted, never consumed.
        if pause.is_expired(now) {
            self.state.delete_pause(pause.id).await?;
            self.aggregator.remove(pause.id);
            return Ok(false);
        }

        // An event never matches the pauses of the run it created.
        if pause.is_self_trigger(event.internal_id) {
            return Ok(false);
        }

        // Cancellation pauses outlive their runs; reap the dangling ones.
        if pause.cancel && !self.state.exists(pause.identifier.run_id).await? {
            self.state.delete_pause(pause.id).await?;
            self.aggregator.remove(pause.id);
            return Ok(false);
        }

        if let Some(src) = &pause.expression {
            let expr = match Expression::parse(src) {
                Ok(expr) => expr,
                Err(err) => {
                    tracing::warn!(pause = %pause.id, error = %err, "unparseable pause expression");
                    return Ok(false);
                }
            };
            let mut env = pause
                .expression_data
                .clone()
                .unwrap_or_else(|| json!({}));
            if let Value::Object(map) = &mut env {
                map.insert("async".to_string(), event.event.map());
            }
            if !expr.evaluate(&env) {
                return Ok(false);
            }
        }

        if pause.cancel {
            let run_id = pause.identifier.run_id;
            match self
                .cancel(
                    run_id,
                    CancelRequest {
                        event_id: Some(event.internal_id),
                    },
                )
                .await
            {
                Ok(()) => {}
                // The run ended on its own; the pause is just stale.
                Err(ExecError::FunctionEnded) => {}
                Err(err) => return Err(err),
            }
            match self.state.consume_pause(pause.id, None).await {
                Ok(()) | Err(StateError::PauseNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            self.aggregator.remove(pause.id);
            return Ok(true);
        }

        let request = ResumeRequest {
            event_id: Some(event.internal_id),
            with: Some(resume_data(&pause, event)),
            event_name: Some(event.event.name.clone()),
        };
        self.resume(pause, request).await?;
        Ok(true)
    }

    /// Resume a paused run.
    ///
    /// Leasing makes this single-winner: losing callers see leased or
    /// not-found and treat it as success. Queue-exists on the continuation
    /// edge is swallowed for the same reason.
    #[instrument(skip(self, pause, req), fields(pause = %pause.id), err)]
    pub async fn resume(&self, pause: Pause, req: ResumeRequest) -> Result<(), ExecError> {
        match self.state.lease_pause(pause.id).await {
            Ok(_) => {}
            Err(StateError::PauseLeased { .. } | StateError::PauseNotFound { .. }) => {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        // A timeout resumption racing a real event: the event wins, and the
        // timeout consumes nothing.
        if pause.on_timeout && req.event_id.is_some() {
            match self.state.consume_pause(pause.id, None).await {
                Ok(()) | Err(StateError::PauseNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            self.aggregator.remove(pause.id);
            return Ok(());
        }

        match self.state.consume_pause(pause.id, req.with.clone()).await {
            Ok(()) | Err(StateError::PauseNotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.aggregator.remove(pause.id);

        let identifier = &pause.identifier;
        let item = QueueItem {
            job_id: Some(format!(
                "{}-{}",
                identifier.idempotency_key(),
                pause.data_key
            )),
            group_id: pause.group_id,
            workspace_id: pause.workspace_id,
            kind: ItemKind::Edge,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: self.config.source_edge_retries,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: pause.outgoing.clone(),
                    incoming: pause.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: None,
        };
        self.enqueue_idempotent(item, Utc::now()).await?;

        let event = if pause.opcode == Some(Op::InvokeFunction) {
            LifecycleEvent::InvokeFunctionResumed {
                identifier: identifier.clone(),
                pause,
                request: req,
            }
        } else {
            LifecycleEvent::WaitForEventResumed {
                identifier: identifier.clone(),
                pause,
                request: req,
            }
        };
        self.lifecycle.notify(event);
        Ok(())
    }

    /// Enforce a pause timeout from its queue-scheduled job.
    pub async fn handle_pause_timeout(&self, item: &QueueItem) -> Result<(), ExecError> {
        let Payload::PauseTimeout {
            pause_id,
            on_timeout,
        } = &item.payload
        else {
            return Ok(());
        };
        let mut pause = match self.state.pause_by_id(*pause_id).await {
            Ok(pause) => pause,
            // Already consumed by a matching event.
            Err(StateError::PauseNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        pause.on_timeout = *on_timeout;
        self.resume(pause, ResumeRequest::default()).await
    }

    /// Route a function-finished event back to the invoking run's pause.
    #[instrument(skip(self, event), fields(event = %event.event.name), err)]
    pub async fn handle_invoke_finish(
        &self,
        workspace_id: Uuid,
        event: &StoredEvent,
    ) -> Result<(), ExecError> {
        let Some(correlation_id) = event.event.correlation_id() else {
            return Ok(());
        };
        let pause = match self
            .state
            .pause_by_invoke_correlation(workspace_id, correlation_id)
            .await
        {
            Ok(pause) => pause,
            Err(StateError::PauseNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let request = ResumeRequest {
            event_id: Some(event.internal_id),
            with: Some(resume_data(&pause, event)),
            event_name: Some(event.event.name.clone()),
        };
        self.resume(pause, request).await
    }
}

/// The payload a resumption stores under the pause's `data_key`.
///
/// Waits receive the whole matching event; invocations receive the invoked
/// function's result, or its error wrapped for the caller.
fn resume_data(pause: &Pause, event: &StoredEvent) -> Value {
    if pause.opcode == Some(Op::InvokeFunction) {
        if let Some(error) = event.event.data.get("error") {
            return json!({ "error": error });
        }
        return event
            .event
            .data
            .get("result")
            .cloned()
            .unwrap_or(Value::Null);
    }
    event.event.map()
}
