//! Terminal transitions: cancellation and the finish handler.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::instrument;
use uuid::Uuid;

use crate::event::{
    TriggerEvent, DATA_ENVELOPE_KEY, EVENT_FUNCTION_FAILED, EVENT_FUNCTION_FINISHED,
    INVOKE_CORRELATION_KEY,
};
use crate::lifecycle::LifecycleEvent;
use crate::state::{RunState, RunStatus, StateError};
use crate::types::RunId;

use super::{ExecError, Executor};

/// Request to cancel a run.
#[derive(Clone, Debug, Default)]
pub struct CancelRequest {
    /// Internal id of the cancelling event, when cancellation was matched
    /// from one.
    pub event_id: Option<Uuid>,
}

/// How a run ended, with its user-visible payload.
#[derive(Clone, Debug)]
pub(crate) enum FinishOutcome {
    Completed(Value),
    Failed(Value),
    Cancelled,
}

impl Executor {
    /// Cancel a run.
    ///
    /// Cancelling an already-cancelled run is a no-op; cancelling a run that
    /// finished any other way returns [`ExecError::FunctionEnded`], a stable
    /// sentinel callers ignore.
    #[instrument(skip(self, _req), fields(run_id = %run_id), err)]
    pub async fn cancel(&self, run_id: RunId, _req: CancelRequest) -> Result<(), ExecError> {
        let state = match self.state.load(run_id).await {
            Ok(state) => state,
            // Already reaped; cancellation is idempotent.
            Err(StateError::RunNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match state.metadata.status {
            RunStatus::Cancelled => return Ok(()),
            RunStatus::Completed | RunStatus::Failed | RunStatus::Overflowed => {
                return Err(ExecError::FunctionEnded);
            }
            RunStatus::Scheduled | RunStatus::Running => {}
        }

        self.state.set_status(run_id, RunStatus::Cancelled).await?;
        self.state.delete(run_id).await?;
        self.finish(&state, FinishOutcome::Cancelled).await?;
        self.lifecycle.notify(LifecycleEvent::FunctionCancelled {
            identifier: state.metadata.identifier.clone(),
        });
        Ok(())
    }

    /// Publish the function-finished event family and notify observers.
    ///
    /// When the run was started by an invocation, the trigger event's
    /// envelope correlation id is echoed into the finished event so the
    /// caller's pause matches.
    pub(crate) async fn finish(
        &self,
        state: &RunState,
        outcome: FinishOutcome,
    ) -> Result<(), ExecError> {
        let identifier = &state.metadata.identifier;
        let correlation_id = state
            .event()
            .and_then(|e| e.event.correlation_id())
            .map(str::to_string);

        let mut data = serde_json::Map::new();
        data.insert("function_id".into(), json!(identifier.workflow_id));
        data.insert("run_id".into(), json!(identifier.run_id));
        data.insert(
            "event".into(),
            state.event().map(|e| e.event.map()).unwrap_or(Value::Null),
        );
        data.insert(
            "events".into(),
            Value::Array(state.events.iter().map(|e| e.event.map()).collect()),
        );

        let (status, output, failed) = match &outcome {
            FinishOutcome::Completed(result) => {
                data.insert("result".into(), result.clone());
                (RunStatus::Completed, Some(result.clone()), false)
            }
            FinishOutcome::Failed(error) => {
                data.insert("error".into(), error.clone());
                (RunStatus::Failed, Some(error.clone()), true)
            }
            // Cancellation is user-visible as finished-with-error, not as a
            // failure event.
            FinishOutcome::Cancelled => {
                let error = json!({
                    "name": "FunctionCancelled",
                    "message": "function cancelled",
                });
                data.insert("error".into(), error.clone());
                (RunStatus::Cancelled, Some(error), false)
            }
        };

        if let Some(corr) = &correlation_id {
            data.insert("correlation_id".into(), json!(corr));
            data.insert(
                DATA_ENVELOPE_KEY.into(),
                json!({ INVOKE_CORRELATION_KEY: corr }),
            );
        }

        let mut finished = TriggerEvent::new(EVENT_FUNCTION_FINISHED);
        finished.ts = Utc::now().timestamp_millis();
        finished.data = data.clone().into_iter().collect();
        self.publisher.publish(finished).await?;

        if failed {
            let mut failure = TriggerEvent::new(EVENT_FUNCTION_FAILED);
            failure.ts = Utc::now().timestamp_millis();
            failure.data = data.into_iter().collect();
            self.publisher.publish(failure).await?;
        }

        self.lifecycle.notify(LifecycleEvent::FunctionFinished {
            identifier: identifier.clone(),
            status,
            output,
        });
        Ok(())
    }
}
