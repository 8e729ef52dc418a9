//! Batching and debouncing seams.
//!
//! Both are external collaborators: the batcher accumulates trigger events
//! until a size or time bound and hands them back as one batch; the
//! debouncer collapses rapid triggers into the trailing event. The executor
//! only glues them to scheduling (see `exec`), so the traits here stay
//! narrow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::event::StoredEvent;
use crate::function::Function;

/// What an append did to the function's open batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchAppendStatus {
    /// The event opened a new batch; a flush must be scheduled.
    New,
    /// The event joined an existing batch.
    Appended,
    /// The event filled the batch; it is ready to run now.
    Full,
}

/// Result of appending one event to a batch.
#[derive(Clone, Debug)]
pub struct BatchAppendOutcome {
    pub status: BatchAppendStatus,
    pub batch_id: Uuid,
}

#[derive(Debug, Error, Diagnostic)]
pub enum BatchError {
    #[error("batch not found: {batch_id}")]
    #[diagnostic(code(stepline::batch::not_found))]
    NotFound { batch_id: Uuid },

    #[error("batch backend error: {message}")]
    #[diagnostic(code(stepline::batch::backend))]
    Backend { message: String },
}

/// Event batch accumulator.
#[async_trait]
pub trait Batcher: Send + Sync {
    /// Append an event to the function's open batch.
    async fn append(
        &self,
        function: &Function,
        event: StoredEvent,
    ) -> Result<BatchAppendOutcome, BatchError>;

    /// Pull the events of a batch, closing it.
    async fn retrieve(&self, batch_id: Uuid) -> Result<Vec<StoredEvent>, BatchError>;

    /// Record when the batch must flush even if it never fills.
    async fn schedule_flush(&self, batch_id: Uuid, at: DateTime<Utc>) -> Result<(), BatchError>;
}

#[derive(Debug, Error, Diagnostic)]
pub enum DebounceError {
    #[error("debounce backend error: {message}")]
    #[diagnostic(code(stepline::debounce::backend))]
    Backend { message: String },
}

/// Debounce accumulator: the scheduler forwards triggers here when the
/// function declares a debounce period.
#[async_trait]
pub trait Debouncer: Send + Sync {
    async fn debounce(
        &self,
        function: &Function,
        event: StoredEvent,
    ) -> Result<(), DebounceError>;
}

/// Size-bound in-process batcher for tests and local development.
#[derive(Clone, Default)]
pub struct MemoryBatcher {
    inner: Arc<Mutex<BatcherInner>>,
}

#[derive(Default)]
struct BatcherInner {
    /// Open batch per function.
    open: FxHashMap<Uuid, Uuid>,
    batches: FxHashMap<Uuid, Vec<StoredEvent>>,
    flushes: FxHashMap<Uuid, DateTime<Utc>>,
}

impl MemoryBatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded flush deadline for a batch, if any.
    #[must_use]
    pub fn flush_at(&self, batch_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner.lock().flushes.get(&batch_id).copied()
    }
}

#[async_trait]
impl Batcher for MemoryBatcher {
    async fn append(
        &self,
        function: &Function,
        event: StoredEvent,
    ) -> Result<BatchAppendOutcome, BatchError> {
        let max_size = function.batch.as_ref().map_or(1, |b| b.max_size).max(1);
        let mut inner = self.inner.lock();
        let (batch_id, status) = match inner.open.get(&function.id).copied() {
            Some(id) => (id, BatchAppendStatus::Appended),
            None => {
                let id = Uuid::new_v4();
                inner.open.insert(function.id, id);
                (id, BatchAppendStatus::New)
            }
        };
        let batch = inner.batches.entry(batch_id).or_default();
        batch.push(event);
        let status = if batch.len() >= max_size {
            inner.open.remove(&function.id);
            BatchAppendStatus::Full
        } else {
            status
        };
        Ok(BatchAppendOutcome { status, batch_id })
    }

    async fn retrieve(&self, batch_id: Uuid) -> Result<Vec<StoredEvent>, BatchError> {
        let mut inner = self.inner.lock();
        inner.open.retain(|_, id| *id != batch_id);
        inner
            .batches
            .remove(&batch_id)
            .ok_or(BatchError::NotFound { batch_id })
    }

    async fn schedule_flush(&self, batch_id: Uuid, at: DateTime<Utc>) -> Result<(), BatchError> {
        self.inner.lock().flushes.insert(batch_id, at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TriggerEvent;
    use crate::function::{BatchSpec, StepDefinition, Trigger};

    fn function(max_size: usize) -> Function {
        Function {
            id: Uuid::new_v4(),
            slug: "batchy".into(),
            version: 1,
            triggers: vec![Trigger {
                event: "x".into(),
                expression: None,
            }],
            steps: vec![StepDefinition {
                id: "step".into(),
                name: "step".into(),
                runtime_type: "http".into(),
                retries: None,
            }],
            throttle: None,
            debounce: None,
            batch: Some(BatchSpec {
                max_size,
                timeout_seconds: 60,
            }),
            concurrency: vec![],
            cancel: vec![],
            priority: None,
            paused_at: None,
        }
    }

    #[tokio::test]
    async fn fills_after_max_size_events() {
        let batcher = MemoryBatcher::new();
        let f = function(2);

        let first = batcher
            .append(&f, StoredEvent::new(TriggerEvent::new("x")))
            .await
            .unwrap();
        assert_eq!(first.status, BatchAppendStatus::New);

        let second = batcher
            .append(&f, StoredEvent::new(TriggerEvent::new("x")))
            .await
            .unwrap();
        assert_eq!(second.status, BatchAppendStatus::Full);
        assert_eq!(second.batch_id, first.batch_id);

        let events = batcher.retrieve(first.batch_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(batcher.retrieve(first.batch_id).await.is_err());
    }
}
