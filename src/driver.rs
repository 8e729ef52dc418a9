//! Runtime drivers: pluggable executors of a single step against a remote
//! user runtime.
//!
//! A driver owns the wire contract to one kind of SDK runtime (HTTP, gRPC,
//! …) and is selected by the step's `runtime_type`. The engine never sees
//! the wire: it hands the driver run state and an edge, and receives back a
//! [`DriverResponse`] holding either a final output or a generator opcode
//! list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::function::StepDefinition;
use crate::opcode::{GeneratorOpcode, Op, UserError};
use crate::queue::{Edge, QueueItem};
use crate::state::RunState;

/// Result of one driver invocation.
#[derive(Clone, Debug, Default)]
pub struct DriverResponse {
    /// The step that was invoked. Populated by the executor when the driver
    /// leaves it empty.
    pub step: Option<StepDefinition>,
    /// Final function output; meaningful only when `generator` is empty.
    pub output: Option<Value>,
    /// Opcodes to interpret; empty means the function returned.
    pub generator: Vec<GeneratorOpcode>,
    /// Transport or SDK-level error. Authoritative for retry
    /// classification; the user-visible payload travels in opcode errors.
    pub err: Option<String>,
    /// Set when the response must not be retried regardless of the attempt
    /// policy.
    pub no_retry: bool,
    /// Earliest instant a retry may run, when the SDK asked for one.
    pub retry_at: Option<DateTime<Utc>>,
    /// Protocol version the responding SDK declared.
    pub request_version: i32,
}

impl DriverResponse {
    /// Whether this response may be retried by the queue.
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.err.is_some() && !self.no_retry
    }

    /// The single user error carried by a lone `StepError` opcode, if that
    /// is what this response is.
    #[must_use]
    pub fn user_error(&self) -> Option<&UserError> {
        match self.generator.as_slice() {
            [opcode] if opcode.op == Op::StepError => opcode.error.as_ref(),
            _ => None,
        }
    }

    /// Whether the response drives the generator protocol rather than
    /// returning a final output.
    #[must_use]
    pub fn is_generator(&self) -> bool {
        !self.generator.is_empty()
    }
}

/// Driver invocation errors. These are transport-level: the user function
/// was not observed to run to a decision.
#[derive(Debug, Error, Diagnostic)]
pub enum DriverError {
    #[error("driver transport error: {message}")]
    #[diagnostic(
        code(stepline::driver::transport),
        help("The runtime was unreachable or returned an unusable response; the queue will retry.")
    )]
    Transport { message: String },

    #[error("driver error: {message}")]
    #[diagnostic(code(stepline::driver::other))]
    Other { message: String },
}

/// Executes a single step against a remote user runtime.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// The runtime type this driver serves, e.g. `"http"`. Registry key.
    fn runtime_type(&self) -> &'static str;

    async fn execute(
        &self,
        state: &RunState,
        item: &QueueItem,
        edge: &Edge,
        step: &StepDefinition,
        stack_index: usize,
        attempt: u32,
    ) -> Result<DriverResponse, DriverError>;
}

/// Errors building the driver registry.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("duplicate driver registered for runtime type {runtime:?}")]
    #[diagnostic(
        code(stepline::driver::duplicate),
        help("Each runtime type may be served by exactly one driver.")
    )]
    Duplicate { runtime: String },
}

/// Write-once map from runtime type to driver, built during configuration.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: FxHashMap<String, Arc<dyn RuntimeDriver>>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver; duplicate runtime types fail construction.
    pub fn register(&mut self, driver: Arc<dyn RuntimeDriver>) -> Result<(), RegistryError> {
        let runtime = driver.runtime_type().to_string();
        if self.drivers.contains_key(&runtime) {
            return Err(RegistryError::Duplicate { runtime });
        }
        self.drivers.insert(runtime, driver);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, runtime_type: &str) -> Option<Arc<dyn RuntimeDriver>> {
        self.drivers.get(runtime_type).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
