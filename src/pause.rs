//! Pauses: persisted continuations awaiting an event, a timeout, or a
//! cancellation signal.
//!
//! A pause is written by the scheduler (cancellation triggers) or the opcode
//! interpreter (`wait-for-event`, `invoke`) and later matched against
//! incoming events by the pause engine. Opcode pauses use a deterministic id
//! derived from `(run_id, step_id)` so re-issuing the same save is a no-op;
//! cancellation pauses are random v4.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::opcode::Op;
use crate::types::{RunId, RunIdentifier};

/// A suspended continuation of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub identifier: RunIdentifier,
    /// History group the resumption continues.
    pub group_id: Uuid,
    /// Step name the paused edge leaves from.
    pub outgoing: String,
    /// Step name the resumption lands on.
    pub incoming: String,
    /// Set for opcode pauses: `WaitForEvent` or `InvokeFunction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opcode: Option<Op>,
    pub expires: DateTime<Utc>,
    /// Event name filter; `None` matches any event (cancellation pauses
    /// always carry a name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Pre-filtered attribute data: only the variables the expression
    /// references, captured at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression_data: Option<Value>,
    /// Step id the resume payload is stored under in run state.
    pub data_key: String,
    /// Internal id of the event that created the run; an event with this id
    /// never matches the pause (self-cancellation guard).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_target_fn_id: Option<Uuid>,
    /// Span of the step that created the pause, for trace continuation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_started_at: Option<DateTime<Utc>>,
    /// When set, a match cancels the run instead of resuming it.
    #[serde(default)]
    pub cancel: bool,
    /// When set, this pause is being consumed by its timeout job rather
    /// than by a matched event.
    #[serde(default)]
    pub on_timeout: bool,
}

impl Pause {
    /// Deterministic id for an opcode pause.
    ///
    /// UUIDv5 over the OID namespace of `"<run_id>-<step_id>"`, which makes
    /// re-issuing `save_pause` for the same step idempotent across retries.
    #[must_use]
    pub fn opcode_id(run_id: RunId, step_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{run_id}-{step_id}").as_bytes(),
        )
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Whether `event_id` is the event that created this pause's run.
    #[must_use]
    pub fn is_self_trigger(&self, event_id: Uuid) -> bool {
        self.triggering_event_id == Some(event_id)
    }
}

/// Request to resume a paused run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// Internal id of the matching event; `None` for timeout resumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    /// Resume payload stored under the pause's `data_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Value>,
    /// Name of the matching event, recorded for observers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}
