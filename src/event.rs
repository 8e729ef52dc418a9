//! Triggering events and the system event vocabulary.
//!
//! Runs are started, resumed, and cancelled by events. A [`TriggerEvent`] is
//! the user-visible shape; [`StoredEvent`] pairs it with the internal id the
//! event store assigned at ingest, which is what identifiers and pauses refer
//! to.

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Name of the event published when a run completes successfully.
pub const EVENT_FUNCTION_FINISHED: &str = "stepline/function.finished";
/// Name of the event published when a run fails permanently.
pub const EVENT_FUNCTION_FAILED: &str = "stepline/function.failed";
/// Name of the event published to start an invoked function.
pub const EVENT_FUNCTION_INVOKED: &str = "stepline/function.invoked";

/// Key of the reserved envelope object inside event data used for
/// cross-function plumbing such as invoke correlation ids.
pub const DATA_ENVELOPE_KEY: &str = "_stepline";
/// Key of the invoke correlation id inside the [`DATA_ENVELOPE_KEY`] object.
pub const INVOKE_CORRELATION_KEY: &str = "invoke_correlation_id";

fn ts_is_unset(ts: &i64) -> bool {
    *ts == 0
}

/// An event as produced by callers and delivered to user functions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Caller-supplied id, used for deduplication at ingest. May be empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data: FxHashMap<String, Value>,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub user: FxHashMap<String, Value>,
    /// Event timestamp in unix milliseconds. Zero means "unset": the field
    /// is omitted from the JSON form so `async.ts == null` guards pass.
    #[serde(default, skip_serializing_if = "ts_is_unset")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl TriggerEvent {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ts: Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Builder-style helper to attach a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// The event rendered as a JSON object, the form expression
    /// environments consume (`event.*` / `async.*`).
    #[must_use]
    pub fn map(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The invoke correlation id carried in this event's envelope, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.data
            .get(DATA_ENVELOPE_KEY)
            .and_then(|v| v.get(INVOKE_CORRELATION_KEY))
            .and_then(Value::as_str)
    }
}

/// An event together with the internal id assigned at ingest.
///
/// The internal id is what run identifiers, pauses, and the self-match guard
/// compare; the caller-supplied `event.id` only participates in ingest
/// deduplication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub internal_id: Uuid,
    pub event: TriggerEvent,
}

impl StoredEvent {
    #[must_use]
    pub fn new(event: TriggerEvent) -> Self {
        Self {
            internal_id: Uuid::new_v4(),
            event,
        }
    }

    #[must_use]
    pub fn with_id(internal_id: Uuid, event: TriggerEvent) -> Self {
        Self { internal_id, event }
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Errors surfaced by event publishing.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PublishError {
    #[error("event publish failed: {message}")]
    #[diagnostic(code(stepline::event::publish))]
    Backend { message: String },
}

/// Sink for events the engine itself produces: invocation events and the
/// function-finished family.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TriggerEvent) -> Result<(), PublishError>;
}

/// Capturing publisher for tests and local development.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    events: std::sync::Arc<parking_lot::Mutex<Vec<TriggerEvent>>>,
}

impl MemoryPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TriggerEvent> {
        self.events.lock().clone()
    }
}

#[async_trait::async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: TriggerEvent) -> Result<(), PublishError> {
        self.events.lock().push(event);
        Ok(())
    }
}
