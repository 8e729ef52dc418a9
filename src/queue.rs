//! Queue substrate interface and the in-process implementation.
//!
//! The engine treats the queue as an external collaborator: a durable
//! priority queue with leasing and throttling. Here we define the item
//! vocabulary ([`QueueItem`], [`Edge`], [`Payload`]), the [`Queue`] seam, and
//! [`InMemoryQueue`], an ordered in-process implementation used by tests and
//! local development.
//!
//! Job-id uniqueness is the queue's contribution to idempotency: enqueueing
//! an item whose `job_id` already exists yields [`QueueError::ItemExists`],
//! which callers treat as success.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::RunIdentifier;

/// Name of the synthetic edge every run starts from.
pub const SOURCE_EDGE: &str = "$source";

/// Kind of work a queue item carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// First item of a run, from the synthetic source edge.
    Start,
    /// Transition between steps.
    Edge,
    /// Transition into a user failure handler after a permanent step error.
    EdgeError,
    Sleep,
    /// Pause timeout enforcement.
    Pause,
}

/// A transition between two steps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub outgoing: String,
    pub incoming: String,
    /// Set when the incoming step was planned by a generator response;
    /// memoized results are keyed by this id instead of `incoming`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_generator_step: Option<String>,
}

impl Edge {
    /// The synthetic trigger edge a run begins on.
    #[must_use]
    pub fn source() -> Self {
        Self {
            outgoing: SOURCE_EDGE.to_string(),
            incoming: SOURCE_EDGE.to_string(),
            incoming_generator_step: None,
        }
    }

    #[must_use]
    pub fn is_source(&self) -> bool {
        self.incoming == SOURCE_EDGE
    }

    /// The step id memoized results for this edge are keyed by.
    #[must_use]
    pub fn result_key(&self) -> &str {
        self.incoming_generator_step
            .as_deref()
            .unwrap_or(&self.incoming)
    }
}

/// Payload of a queue item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Edge { edge: Edge },
    PauseTimeout { pause_id: Uuid, on_timeout: bool },
}

/// Throttle metadata passed through to the queue substrate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    /// Bucket key: hash of the function id, optionally suffixed with the
    /// hash of the evaluated key expression.
    pub key: String,
    pub limit: u32,
    pub burst: u32,
    pub period_seconds: u64,
}

/// One unit of queued work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Idempotency handle; two enqueues with the same job id collapse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// History group this item continues.
    pub group_id: Uuid,
    pub workspace_id: Uuid,
    pub kind: ItemKind,
    pub identifier: RunIdentifier,
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    /// Opaque trace carrier propagated alongside the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_info: Option<rustc_hash::FxHashMap<String, String>>,
}

impl QueueItem {
    /// The edge carried by this item, if it is an edge-shaped payload.
    #[must_use]
    pub fn edge(&self) -> Option<&Edge> {
        match &self.payload {
            Payload::Edge { edge } => Some(edge),
            Payload::PauseTimeout { .. } => None,
        }
    }

    /// Whether the attempt counter has reached the configured maximum.
    #[must_use]
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

/// Errors surfaced by queue operations.
#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    /// An item with the same job id is already enqueued. Callers treat this
    /// as idempotent success.
    #[error("queue item already exists: {job_id}")]
    #[diagnostic(code(stepline::queue::item_exists))]
    ItemExists { job_id: String },

    #[error("queue backend error: {message}")]
    #[diagnostic(code(stepline::queue::backend))]
    Backend { message: String },
}

/// The queue seam. Fairness, leasing, and throttling live behind it.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue `item` to run at `at`. Job-id conflicts yield
    /// [`QueueError::ItemExists`].
    async fn enqueue(&self, item: QueueItem, at: DateTime<Utc>) -> Result<(), QueueError>;
}

/// A scheduled item as recorded by [`InMemoryQueue`].
#[derive(Clone, Debug)]
pub struct ScheduledItem {
    pub at: DateTime<Utc>,
    pub item: QueueItem,
}

/// Ordered in-process queue. Records every enqueue and enforces job-id
/// uniqueness; consumers drain it explicitly.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    items: Vec<ScheduledItem>,
    job_ids: FxHashSet<String>,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything enqueued so far, in enqueue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ScheduledItem> {
        self.inner.lock().items.clone()
    }

    /// Remove and return the earliest item whose run-at is `<= now`.
    #[must_use]
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<ScheduledItem> {
        let mut inner = self.inner.lock();
        let idx = inner
            .items
            .iter()
            .enumerate()
            .filter(|(_, s)| s.at <= now)
            .min_by_key(|(_, s)| s.at)
            .map(|(i, _)| i)?;
        let scheduled = inner.items.remove(idx);
        if let Some(job_id) = &scheduled.item.job_id {
            inner.job_ids.remove(job_id);
        }
        Some(scheduled)
    }

    /// Remove and return the earliest item regardless of its run-at.
    #[must_use]
    pub fn pop(&self) -> Option<ScheduledItem> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            return None;
        }
        let idx = inner
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.at)
            .map(|(i, _)| i)?;
        let scheduled = inner.items.remove(idx);
        if let Some(job_id) = &scheduled.item.job_id {
            inner.job_ids.remove(job_id);
        }
        Some(scheduled)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

#[async_trait::async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, item: QueueItem, at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if let Some(job_id) = &item.job_id {
            if !inner.job_ids.insert(job_id.clone()) {
                return Err(QueueError::ItemExists {
                    job_id: job_id.clone(),
                });
            }
        }
        inner.items.push(ScheduledItem { at, item });
        Ok(())
    }
}
