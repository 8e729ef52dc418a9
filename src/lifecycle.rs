//! Lifecycle observers: side-effect sinks notified at run transitions.
//!
//! History writers, tracing exporters, and metrics all hang off these
//! notifications. Dispatch is detached from the caller: events are pushed
//! onto a bounded channel and drained by a background worker, so observer
//! work finishes even when the request that produced it is cancelled, and a
//! slow observer exerts backpressure instead of unbounded memory growth.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::pause::{Pause, ResumeRequest};
use crate::queue::QueueItem;
use crate::state::RunStatus;
use crate::types::RunIdentifier;

/// Capacity of the dispatch channel before senders start waiting.
const DISPATCH_BUFFER: usize = 1024;

/// Why a schedule request produced no run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    FunctionPaused,
}

/// A lifecycle notification.
///
/// Variants mirror the engine's observable transitions; each carries the run
/// identifier plus whatever context the transition has at hand.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    FunctionScheduled {
        identifier: RunIdentifier,
        item: QueueItem,
    },
    FunctionStarted {
        identifier: RunIdentifier,
        item: QueueItem,
    },
    FunctionFinished {
        identifier: RunIdentifier,
        status: RunStatus,
        output: Option<Value>,
    },
    FunctionCancelled {
        identifier: RunIdentifier,
    },
    FunctionSkipped {
        identifier: RunIdentifier,
        reason: SkipReason,
    },
    StepStarted {
        identifier: RunIdentifier,
        item: QueueItem,
    },
    StepScheduled {
        identifier: RunIdentifier,
        item: QueueItem,
        /// Name of the scheduled step; `None` when the successor is a
        /// discovery request rather than a named step.
        step_name: Option<String>,
    },
    StepFinished {
        identifier: RunIdentifier,
        item: QueueItem,
        output: Option<Value>,
        error: Option<String>,
    },
    Sleep {
        identifier: RunIdentifier,
        item: QueueItem,
        step_id: String,
        until: DateTime<Utc>,
    },
    WaitForEvent {
        identifier: RunIdentifier,
        item: QueueItem,
        pause: Pause,
    },
    WaitForEventResumed {
        identifier: RunIdentifier,
        pause: Pause,
        request: ResumeRequest,
    },
    InvokeFunction {
        identifier: RunIdentifier,
        item: QueueItem,
        pause: Pause,
        correlation_id: String,
    },
    InvokeFunctionResumed {
        identifier: RunIdentifier,
        pause: Pause,
        request: ResumeRequest,
    },
}

/// An observer of lifecycle events.
///
/// Implementations are allowed to block or await; the dispatcher worker
/// serializes delivery, so one listener's latency delays later events, not
/// the engine.
#[async_trait::async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn handle(&self, event: &LifecycleEvent);
}

/// Fan-out dispatcher with a detached worker.
///
/// The listener list is frozen at construction. Cloning the dispatcher
/// clones the sending side only; the worker is shared.
#[derive(Clone)]
pub struct LifecycleDispatcher {
    tx: Option<flume::Sender<LifecycleEvent>>,
    pending: Arc<AtomicUsize>,
    _worker: Arc<Option<JoinHandle<()>>>,
}

impl LifecycleDispatcher {
    /// Build a dispatcher over a fixed listener list and start its worker.
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn LifecycleListener>>) -> Self {
        if listeners.is_empty() {
            return Self {
                tx: None,
                pending: Arc::new(AtomicUsize::new(0)),
                _worker: Arc::new(None),
            };
        }
        let (tx, rx) = flume::bounded::<LifecycleEvent>(DISPATCH_BUFFER);
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let worker = tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                for listener in &listeners {
                    listener.handle(&event).await;
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Self {
            tx: Some(tx),
            pending,
            _worker: Arc::new(Some(worker)),
        }
    }

    /// Dispatcher that drops every event; used when no listeners are wired.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Queue an event for delivery on the detached worker.
    ///
    /// Never blocks the caller: when the buffer is full, handoff moves to a
    /// spawned task that waits for capacity.
    pub fn notify(&self, event: LifecycleEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                let tx = tx.clone();
                let pending = Arc::clone(&self.pending);
                tokio::spawn(async move {
                    if tx.send_async(event).await.is_err() {
                        pending.fetch_sub(1, Ordering::SeqCst);
                        tracing::debug!("lifecycle worker gone; event dropped");
                    }
                });
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Wait until every queued event has been delivered. Test hook.
    pub async fn drain(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
    }
}

/// Capturing listener for tests and local inspection.
#[derive(Clone, Default)]
pub struct MemoryLifecycle {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl MemoryLifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything observed so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait::async_trait]
impl LifecycleListener for MemoryLifecycle {
    async fn handle(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}
