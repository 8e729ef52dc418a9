//! # Stepline: Durable Step-Function Execution
//!
//! Stepline drives user functions expressed as opcode-emitting steps through
//! a persistent state store and a reliable job queue. Runs are resumable:
//! every step result is memoized, every wait is a persisted pause, and an
//! event arriving days later picks the run up exactly where it stopped.
//!
//! ## Core Concepts
//!
//! - **Runs**: One execution of a function, named by a [`types::RunId`] that
//!   embeds its own creation time
//! - **Opcodes**: Instructions returned by user SDKs (step results, sleeps,
//!   waits, invocations) interpreted by the engine
//! - **Pauses**: Persisted continuations matched against incoming events by
//!   expression
//! - **Drivers**: Pluggable executors of a single step against a remote
//!   runtime, selected by runtime type
//! - **Lifecycle observers**: Side-effect sinks notified at well-defined
//!   transitions on a detached dispatch worker
//!
//! ## Building an Executor
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stepline::event::MemoryPublisher;
//! use stepline::exec::Executor;
//! use stepline::queue::InMemoryQueue;
//! use stepline::state::InMemoryStateStore;
//! # use stepline::function::{Function, FunctionLoader, FunctionLoaderError};
//! # use uuid::Uuid;
//! # struct Loader;
//! # #[async_trait::async_trait]
//! # impl FunctionLoader for Loader {
//! #     async fn load(&self, _: Uuid) -> Result<Arc<Function>, FunctionLoaderError> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = Executor::builder()
//!     .state_store(Arc::new(InMemoryStateStore::new()))
//!     .queue(Arc::new(InMemoryQueue::new()))
//!     .function_loader(Arc::new(Loader))
//!     .publisher(Arc::new(MemoryPublisher::new()))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! Scheduling a run enqueues its start edge; dispatching queue items through
//! [`exec::Executor::execute`] drives the function until it returns, sleeps,
//! waits, or invokes. Incoming events flow through
//! [`exec::Executor::handle_pauses`] to resume or cancel whatever is waiting
//! on them.
//!
//! ## Module Guide
//!
//! - [`types`] - Run identity: run ids and run identifiers
//! - [`event`] - Trigger events, system event names, publishing
//! - [`function`] - Function definitions and the loader seam
//! - [`state`] - Run state, memoized results, the state-store seam
//! - [`queue`] - Queue items, edges, the queue seam
//! - [`pause`] - Persisted continuations
//! - [`opcode`] - The driver opcode protocol
//! - [`driver`] - Runtime drivers and their registry
//! - [`expr`] - Predicate expressions and the aggregate pause index
//! - [`lifecycle`] - Observer dispatch
//! - [`batch`] - Batching and debouncing seams
//! - [`exec`] - The engine: scheduling, execution, interpretation, pauses

pub mod batch;
pub mod driver;
pub mod event;
pub mod exec;
pub mod expr;
pub mod function;
pub mod lifecycle;
pub mod opcode;
pub mod pause;
pub mod queue;
pub mod state;
pub mod types;
