//! Step execution: loading state, dispatching to a driver, and handling the
//! normalized response.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::instrument;

use crate::driver::DriverResponse;
use crate::lifecycle::LifecycleEvent;
use crate::opcode::Op;
use crate::queue::{Edge, QueueItem};
use crate::state::{MemoizedResult, MetadataUpdate, RunStatus, StateError};

use super::cancel::FinishOutcome;
use super::{new_span_id, ExecError, Executor};

impl Executor {
    /// Execute the step addressed by a queue item's edge.
    ///
    /// Returns `Ok(None)` when validation stops the run without retry (the
    /// queue swallows the item), `Ok(Some(response))` on a handled driver
    /// response, and `Err` when the queue should apply its retry policy.
    #[instrument(
        skip(self, item, edge),
        fields(run_id = %item.identifier.run_id, incoming = %edge.incoming),
        err
    )]
    pub async fn execute(
        &self,
        item: &QueueItem,
        edge: &Edge,
        stack_index: usize,
    ) -> Result<Option<DriverResponse>, ExecError> {
        let identifier = &item.identifier;
        let function = self.functions.load(identifier.workflow_id).await?;

        let state = match self.state.load(identifier.run_id).await {
            Ok(state) => state,
            // The run was cancelled and reaped; nothing left to do.
            Err(StateError::RunNotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // Terminal runs stop without retry; the queue swallows the item.
        if state.metadata.status.is_terminal() {
            return Ok(None);
        }
        if state.step_count() >= self.config.max_steps {
            // Fatal, but never surfaced to the queue: the run is finalized
            // here and the item is swallowed.
            let cap = ExecError::StepCapExceeded {
                max_steps: self.config.max_steps,
            };
            let error = json!({
                "name": "RunLimitExceeded",
                "message": cap.to_string(),
            });
            self.state
                .set_status(identifier.run_id, RunStatus::Failed)
                .await?;
            self.finish(&state, FinishOutcome::Failed(error)).await?;
            return Ok(None);
        }

        // The per-step retry policy governs every edge execution; the
        // item's own max-attempts only protects the synthetic start edge.
        let max_attempts = function.step_retries() + 1;

        // The trigger edge is synthetic; rewrite it to the function's sole
        // entry step. Static multi-step fan-out is rejected outright:
        // parallelism flows through the opcode protocol.
        let mut edge = edge.clone();
        if edge.is_source() {
            if function.steps.len() != 1 {
                return Err(ExecError::never_retry(ExecError::InvalidTopology {
                    count: function.steps.len(),
                }));
            }
            let step = &function.steps[0];
            edge.incoming = step.id.clone();

            if item.attempt == 0 {
                // First attempt only; the store ignores later writes.
                self.state
                    .update_metadata(
                        identifier.run_id,
                        MetadataUpdate {
                            started_at: Some(Utc::now()),
                            span_id: Some(new_span_id()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.state
                    .set_status(identifier.run_id, RunStatus::Running)
                    .await?;
                self.lifecycle.notify(LifecycleEvent::FunctionStarted {
                    identifier: identifier.clone(),
                    item: item.clone(),
                });
            }
        }

        self.lifecycle.notify(LifecycleEvent::StepStarted {
            identifier: identifier.clone(),
            item: item.clone(),
        });

        let step = function
            .steps
            .first()
            .ok_or(ExecError::InvalidTopology { count: 0 })?;

        // Memoized results short-circuit: a step with a stored output is
        // never re-invoked.
        if let Some(stored) = state.stored(edge.result_key()) {
            return Ok(Some(DriverResponse {
                step: Some(step.clone()),
                output: Some(stored.value().clone()),
                request_version: state.metadata.request_version,
                ..Default::default()
            }));
        }

        let driver =
            self.drivers
                .get(&step.runtime_type)
                .ok_or_else(|| ExecError::MissingDriver {
                    runtime: step.runtime_type.clone(),
                })?;

        let attempts_exhausted = item.attempt + 1 >= max_attempts;
        let mut response = match driver
            .execute(&state, item, &edge, step, stack_index, item.attempt)
            .await
        {
            Ok(response) => response,
            // Transport failures become a retryable response; at the final
            // attempt the failure is terminal.
            Err(err) => DriverResponse {
                step: Some(step.clone()),
                err: Some(err.to_string()),
                no_retry: attempts_exhausted,
                ..Default::default()
            },
        };

        if response.step.is_none() {
            response.step = Some(step.clone());
        }
        if let Some(user_error) = response.user_error() {
            if user_error.no_retry || attempts_exhausted {
                response.no_retry = true;
            }
        }

        self.handle_response(item, &edge, response, max_attempts)
            .await
    }

    /// Interpret a normalized driver response.
    pub async fn handle_response(
        &self,
        item: &QueueItem,
        edge: &Edge,
        response: DriverResponse,
        max_attempts: u32,
    ) -> Result<Option<DriverResponse>, ExecError> {
        let identifier = &item.identifier;
        let run_id = identifier.run_id;

        self.lifecycle.notify(LifecycleEvent::StepFinished {
            identifier: identifier.clone(),
            item: item.clone(),
            output: response.output.clone(),
            error: response.err.clone(),
        });

        let attempts_exhausted = item.attempt + 1 >= max_attempts;

        if let Some(message) = response.err.clone() {
            if !response.no_retry && !attempts_exhausted {
                self.lifecycle.notify(LifecycleEvent::StepScheduled {
                    identifier: identifier.clone(),
                    item: item.clone(),
                    step_name: response.step.as_ref().map(|s| s.name.clone()),
                });
                return Err(ExecError::Driver { message });
            }

            self.state.set_status(run_id, RunStatus::Failed).await?;
            let state = self.state.load(run_id).await?;
            self.finish(
                &state,
                FinishOutcome::Failed(json!({
                    "name": "Error",
                    "message": message,
                })),
            )
            .await?;
            return Ok(Some(response));
        }

        // A `None` opcode terminates its execution thread; a response that
        // carries nothing else is the function returning.
        let has_live_opcodes = response.generator.iter().any(|op| op.op != Op::None);
        if has_live_opcodes {
            return match self
                .handle_generator(item, edge, &response, max_attempts)
                .await
            {
                Ok(()) => Ok(Some(response)),
                // A compile error in a saved expression can never succeed on
                // retry; the run fails with the error as its result.
                Err(ExecError::Expr(err)) => {
                    let error = json!({
                        "name": "InvalidExpression",
                        "message": err.to_string(),
                    });
                    match self
                        .state
                        .save_response(
                            run_id,
                            edge.result_key(),
                            MemoizedResult::Error(error.clone()),
                        )
                        .await
                    {
                        Ok(()) | Err(StateError::DuplicateResponse { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                    self.state.set_status(run_id, RunStatus::Failed).await?;
                    let state = self.state.load(run_id).await?;
                    self.finish(&state, FinishOutcome::Failed(error)).await?;
                    Ok(Some(response))
                }
                Err(other) => Err(other),
            };
        }

        // The function returned. Persist the final output under a
        // run-scoped key; a duplicate save means a parallel terminal
        // already finished the run.
        let output = response.output.clone().unwrap_or(Value::Null);
        match self
            .state
            .save_response(run_id, FINAL_OUTPUT_KEY, MemoizedResult::Data(output.clone()))
            .await
        {
            Ok(()) => {}
            Err(StateError::DuplicateResponse { .. }) => return Ok(Some(response)),
            Err(err) => return Err(err.into()),
        }

        let state = self.state.load(run_id).await?;
        self.finish(&state, FinishOutcome::Completed(output)).await?;
        self.state.set_status(run_id, RunStatus::Completed).await?;
        Ok(Some(response))
    }
}

/// Run-scoped key the final function output memoizes under. A single key
/// (rather than one per edge) is what makes concurrent terminals collapse to
/// exactly one completion.
pub(crate) const FINAL_OUTPUT_KEY: &str = "$output";
