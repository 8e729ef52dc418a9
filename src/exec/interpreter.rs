//! The opcode interpreter: consuming a driver response's opcode list.
//!
//! Opcodes are split into groups; a group whose opcodes open parallel
//! history threads mints a fresh group id per opcode, while a single linear
//! opcode continues the incoming item's group. Opcodes within a group are
//! dispatched concurrently — ordering across them is not guaranteed, and
//! correctness rests on deterministic pause ids and idempotent writes so
//! duplicates collapse.

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tracing::instrument;
use uuid::Uuid;

use crate::driver::DriverResponse;
use crate::event::{
    TriggerEvent, DATA_ENVELOPE_KEY, EVENT_FUNCTION_FINISHED, EVENT_FUNCTION_INVOKED,
    INVOKE_CORRELATION_KEY,
};
use crate::expr::{self, Expression};
use crate::lifecycle::LifecycleEvent;
use crate::opcode::{GeneratorOpcode, Op};
use crate::pause::Pause;
use crate::queue::{Edge, ItemKind, Payload, QueueError, QueueItem};
use crate::state::{MemoizedResult, MetadataUpdate, StateError};

use super::{new_span_id, ExecError, Executor};

/// A batch of opcodes dispatched together.
struct OpcodeGroup<'a> {
    opcodes: Vec<&'a GeneratorOpcode>,
    /// When set, each opcode starts its own history group; otherwise the
    /// group continues the incoming item's.
    fresh_group_ids: bool,
}

/// Group policy: parallel fan-out (more than one live opcode) and planned
/// discovery steps open new history threads; a single linear opcode reuses
/// the incoming group.
fn opcode_groups(opcodes: &[GeneratorOpcode]) -> Vec<OpcodeGroup<'_>> {
    let live: Vec<&GeneratorOpcode> = opcodes.iter().filter(|op| op.op != Op::None).collect();
    if live.len() <= 1 {
        let fresh = live.iter().any(|op| op.op == Op::StepPlanned);
        return vec![OpcodeGroup {
            opcodes: live,
            fresh_group_ids: fresh,
        }];
    }
    vec![OpcodeGroup {
        opcodes: live,
        fresh_group_ids: true,
    }]
}

impl Executor {
    /// Interpret the opcode list of one driver response.
    #[instrument(
        skip(self, item, edge, response),
        fields(run_id = %item.identifier.run_id, opcodes = response.generator.len()),
        err
    )]
    pub(crate) async fn handle_generator(
        &self,
        item: &QueueItem,
        edge: &Edge,
        response: &DriverResponse,
        max_attempts: u32,
    ) -> Result<(), ExecError> {
        let run_id = item.identifier.run_id;

        // Write-through of the SDK's declared protocol version, and the
        // parallel-execution latch: once a response fans out, the SDK must
        // pre-plan steps rather than execute in-line.
        let metadata = self.state.metadata(run_id).await?;
        let mut update = MetadataUpdate::default();
        if metadata.request_version == -1 {
            update.request_version = Some(response.request_version);
        }
        let live_count = response
            .generator
            .iter()
            .filter(|op| op.op != Op::None)
            .count();
        if response.generator.len() > 1 && !metadata.disable_immediate_execution {
            update.disable_immediate_execution = Some(true);
        }
        if update.request_version.is_some() || update.disable_immediate_execution.is_some() {
            self.state.update_metadata(run_id, update).await?;
        }
        debug_assert!(live_count > 0, "all-None responses are final returns");

        for group in opcode_groups(&response.generator) {
            let results = join_all(group.opcodes.iter().map(|opcode| {
                let group_id = if group.fresh_group_ids {
                    Uuid::new_v4()
                } else {
                    item.group_id
                };
                self.handle_opcode(item, edge, opcode, group_id, max_attempts)
            }))
            .await;

            // The group fails as a unit; the first error wins and is
            // classified for the queue from the response's retry hints.
            for result in results {
                if let Err(err) = result {
                    return Err(classify_group_error(err, response));
                }
            }
        }
        Ok(())
    }

    async fn handle_opcode(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
        group_id: Uuid,
        max_attempts: u32,
    ) -> Result<(), ExecError> {
        match opcode.op {
            Op::None => Ok(()),
            Op::Step | Op::StepRun => self.handle_op_step(item, edge, opcode).await,
            Op::StepError => {
                self.handle_op_step_error(item, edge, opcode, group_id, max_attempts)
                    .await
            }
            Op::StepPlanned => self.handle_op_planned(item, edge, opcode, group_id).await,
            Op::Sleep => self.handle_op_sleep(item, edge, opcode, group_id).await,
            Op::WaitForEvent => self.handle_op_wait(item, edge, opcode, group_id).await,
            Op::InvokeFunction => self.handle_op_invoke(item, edge, opcode, group_id).await,
        }
    }

    /// Memoize a completed step and enqueue the discovery of the next one.
    async fn handle_op_step(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let output = opcode.output.clone().unwrap_or(Value::Null);
        match self
            .state
            .save_response(identifier.run_id, &opcode.id, MemoizedResult::Data(output))
            .await
        {
            // A duplicate write is a concurrent retry of the same opcode.
            Ok(()) | Err(StateError::DuplicateResponse { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let next = QueueItem {
            job_id: Some(format!("{}-{}", identifier.idempotency_key(), opcode.id)),
            group_id: Uuid::new_v4(),
            workspace_id: item.workspace_id,
            kind: ItemKind::Edge,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: opcode.id.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: item.run_info.clone(),
        };
        self.enqueue_idempotent(next.clone(), Utc::now()).await?;

        // The successor is a discovery request, so it has no step name yet.
        self.lifecycle.notify(LifecycleEvent::StepScheduled {
            identifier: identifier.clone(),
            item: next,
            step_name: None,
        });
        Ok(())
    }

    /// Handle a user-level step failure: retry while attempts remain, then
    /// persist the error and route to the function's failure edge.
    async fn handle_op_step_error(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
        group_id: Uuid,
        max_attempts: u32,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let error = opcode.error.clone().unwrap_or_default();

        let retryable = !error.no_retry && item.attempt + 1 < max_attempts;
        if retryable {
            self.lifecycle.notify(LifecycleEvent::StepScheduled {
                identifier: identifier.clone(),
                item: item.clone(),
                step_name: Some(opcode.name.clone()),
            });
            // Sentinel: the queue retries this item even though the step
            // error was observed and recorded.
            return Err(ExecError::HandledStepError);
        }

        let payload = json!({
            "name": error.name,
            "message": error.message,
            "data": error.data,
        });
        match self
            .state
            .save_response(
                identifier.run_id,
                &opcode.id,
                MemoizedResult::Error(payload),
            )
            .await
        {
            Ok(()) | Err(StateError::DuplicateResponse { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let next = QueueItem {
            job_id: Some(format!(
                "{}-{}-failure",
                identifier.idempotency_key(),
                opcode.id
            )),
            group_id,
            workspace_id: item.workspace_id,
            kind: ItemKind::EdgeError,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: opcode.id.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: item.run_info.clone(),
        };
        self.enqueue_idempotent(next.clone(), Utc::now()).await?;

        self.lifecycle.notify(LifecycleEvent::StepScheduled {
            identifier: identifier.clone(),
            item: next,
            step_name: Some(opcode.name.clone()),
        });
        Ok(())
    }

    /// Enqueue execution of a step the SDK planned but did not run.
    async fn handle_op_planned(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
        group_id: Uuid,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let next = QueueItem {
            job_id: Some(format!(
                "{}-{}-plan",
                identifier.idempotency_key(),
                opcode.id
            )),
            group_id,
            workspace_id: item.workspace_id,
            kind: ItemKind::Edge,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: edge.outgoing.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: Some(opcode.id.clone()),
                },
            },
            throttle: None,
            run_info: item.run_info.clone(),
        };
        self.enqueue_idempotent(next.clone(), Utc::now()).await?;

        self.lifecycle.notify(LifecycleEvent::StepScheduled {
            identifier: identifier.clone(),
            item: next,
            step_name: Some(opcode.name.clone()),
        });
        Ok(())
    }

    /// Schedule the wake-up edge for a sleep.
    async fn handle_op_sleep(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
        group_id: Uuid,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let until = opcode.sleep_opts()?.wake_at(Utc::now())?;

        let next = QueueItem {
            job_id: Some(format!("{}-{}", identifier.idempotency_key(), opcode.id)),
            group_id,
            workspace_id: item.workspace_id,
            kind: ItemKind::Sleep,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: opcode.id.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: item.run_info.clone(),
        };
        self.enqueue_idempotent(next.clone(), until).await?;

        self.lifecycle.notify(LifecycleEvent::Sleep {
            identifier: identifier.clone(),
            item: next,
            step_id: opcode.id.clone(),
            until,
        });
        Ok(())
    }

    /// Persist a wait-for-event pause and its timeout job.
    async fn handle_op_wait(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
        group_id: Uuid,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let opts = opcode.wait_opts()?;
        let expires = opts.expires_at(Utc::now())?;

        let (expression, expression_data) = match &opts.r#if {
            None => (None, None),
            Some(src) => {
                let parsed = Expression::parse(src)?;
                let state = self.state.load(identifier.run_id).await?;
                let event_map = state
                    .event()
                    .map(|e| e.event.map())
                    .unwrap_or(Value::Null);
                let data = parsed.filtered_attributes(&json!({ "event": event_map }));
                // Specializing `event.*` to literals keeps the expression
                // self-contained and indexable by the aggregator.
                let specialized = parsed.interpolate("event", &event_map);
                (Some(specialized.to_string()), Some(data))
            }
        };

        let pause = Pause {
            id: Pause::opcode_id(identifier.run_id, &opcode.id),
            workspace_id: item.workspace_id,
            identifier: identifier.clone(),
            group_id,
            outgoing: opcode.id.clone(),
            incoming: edge.incoming.clone(),
            opcode: Some(Op::WaitForEvent),
            expires,
            event: Some(opts.event.clone()),
            expression,
            expression_data,
            data_key: opcode.id.clone(),
            triggering_event_id: Some(identifier.event_id),
            invoke_correlation_id: None,
            invoke_target_fn_id: None,
            step_span_id: Some(new_span_id()),
            trace_started_at: Some(identifier.run_id.created_at()),
            cancel: false,
            on_timeout: false,
        };
        self.save_pause_idempotent(pause.clone()).await?;
        self.enqueue_pause_timeout(item, &opcode.id, pause.id, expires)
            .await?;

        self.lifecycle.notify(LifecycleEvent::WaitForEvent {
            identifier: identifier.clone(),
            item: item.clone(),
            pause,
        });
        Ok(())
    }

    /// Start another function and pause until it finishes.
    async fn handle_op_invoke(
        &self,
        item: &QueueItem,
        edge: &Edge,
        opcode: &GeneratorOpcode,
        group_id: Uuid,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let opts = opcode.invoke_opts()?;
        let expires = opts.expires_at(Utc::now())?;

        let correlation_id = format!("{}.{}", identifier.run_id, opcode.id);
        let expression = format!(
            "async.data.{DATA_ENVELOPE_KEY}.{INVOKE_CORRELATION_KEY} == \"{correlation_id}\""
        );
        expr::validate(&expression)?;

        let pause = Pause {
            id: Pause::opcode_id(identifier.run_id, &opcode.id),
            workspace_id: item.workspace_id,
            identifier: identifier.clone(),
            group_id,
            outgoing: opcode.id.clone(),
            incoming: edge.incoming.clone(),
            opcode: Some(Op::InvokeFunction),
            expires,
            event: Some(EVENT_FUNCTION_FINISHED.to_string()),
            expression: Some(expression),
            expression_data: None,
            data_key: opcode.id.clone(),
            triggering_event_id: Some(identifier.event_id),
            invoke_correlation_id: Some(correlation_id.clone()),
            invoke_target_fn_id: Some(opts.function_id),
            step_span_id: Some(new_span_id()),
            trace_started_at: Some(identifier.run_id.created_at()),
            cancel: false,
            on_timeout: false,
        };
        self.save_pause_idempotent(pause.clone()).await?;
        self.enqueue_pause_timeout(item, &opcode.id, pause.id, expires)
            .await?;

        // The invocation event is what actually starts the target function;
        // its envelope carries the correlation id the finished event must
        // echo back.
        let mut data = match opts.payload {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
            None => Map::new(),
        };
        data.insert(
            DATA_ENVELOPE_KEY.to_string(),
            json!({
                INVOKE_CORRELATION_KEY: correlation_id,
                "function_id": opts.function_id,
            }),
        );
        let mut event = TriggerEvent::new(EVENT_FUNCTION_INVOKED);
        event.data = data.into_iter().collect();
        self.publisher.publish(event).await?;

        self.lifecycle.notify(LifecycleEvent::InvokeFunction {
            identifier: identifier.clone(),
            item: item.clone(),
            pause,
            correlation_id,
        });
        Ok(())
    }

    /// Enqueue, swallowing job-id conflicts: re-issues self-heal.
    pub(crate) async fn enqueue_idempotent(
        &self,
        queue_item: QueueItem,
        at: chrono::DateTime<Utc>,
    ) -> Result<(), ExecError> {
        match self.queue.enqueue(queue_item, at).await {
            Ok(()) | Err(QueueError::ItemExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Save a pause, treating an existing deterministic id as success, and
    /// mirror it into the aggregate index.
    pub(crate) async fn save_pause_idempotent(&self, pause: Pause) -> Result<(), ExecError> {
        match self.state.save_pause(pause.clone()).await {
            Ok(()) => {
                self.aggregator.add(pause);
                Ok(())
            }
            Err(StateError::PauseExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn enqueue_pause_timeout(
        &self,
        item: &QueueItem,
        step_id: &str,
        pause_id: Uuid,
        expires: chrono::DateTime<Utc>,
    ) -> Result<(), ExecError> {
        let identifier = &item.identifier;
        let timeout = QueueItem {
            job_id: Some(format!(
                "{}-{}-timeout",
                identifier.idempotency_key(),
                step_id
            )),
            group_id: item.group_id,
            workspace_id: item.workspace_id,
            kind: ItemKind::Pause,
            identifier: identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::PauseTimeout {
                pause_id,
                on_timeout: true,
            },
            throttle: None,
            run_info: item.run_info.clone(),
        };
        self.enqueue_idempotent(timeout, expires).await
    }
}

/// Classify a group failure for the queue using the response's retry hints.
/// The handled-step-error sentinel and compile errors keep their own
/// meaning.
fn classify_group_error(err: ExecError, response: &DriverResponse) -> ExecError {
    match err {
        ExecError::HandledStepError | ExecError::Expr(_) => err,
        err if response.no_retry => ExecError::never_retry(err),
        err => match response.retry_at {
            Some(at) => ExecError::retry_at(err, at),
            None => err,
        },
    }
}
