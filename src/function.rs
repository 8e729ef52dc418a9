//! Function definitions and the loader seam.
//!
//! A [`Function`] is the versioned configuration the scheduler and executor
//! consult: triggers, the single entry step, retry counts, throttle /
//! debounce / concurrency policies, and declared cancellation triggers.
//! Definitions are owned elsewhere; the engine reads them through the
//! [`FunctionLoader`] trait.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::types::ConcurrencyScope;

/// Default number of retries for a user step when the definition is silent.
pub const DEFAULT_STEP_RETRIES: u32 = 4;

/// One executable step of a function.
///
/// Functions currently declare exactly one entry step; fan-out happens
/// through the opcode protocol at runtime, not through static DAG edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Stable step id, referenced by edges and memoized results.
    pub id: String,
    pub name: String,
    /// Runtime driver selector, e.g. `"http"`.
    pub runtime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// An event trigger for a function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Declared cancellation: an event that, when matched, cancels the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelSpec {
    pub event: String,
    /// Optional match expression, `event.*` referring to the triggering
    /// event and `async.*` to the cancelling one.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub r#if: Option<String>,
    /// How long the cancellation window stays open, e.g. `"24h"`. Falls back
    /// to the executor's configured cancel timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Throttle policy applied at enqueue time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrottleSpec {
    pub limit: u32,
    #[serde(default)]
    pub burst: u32,
    pub period_seconds: u64,
    /// Optional key expression evaluated against the first event; runs with
    /// distinct keys throttle independently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Debounce policy: collapse rapid triggers into the trailing event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DebounceSpec {
    pub period_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Event batching policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub max_size: usize,
    pub timeout_seconds: u64,
}

/// A custom concurrency limit with its key expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    pub scope: ConcurrencyScope,
    /// Key expression evaluated against the first event, e.g.
    /// `event.data.customer_id`.
    pub key: String,
    pub limit: u32,
}

/// Priority configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrioritySpec {
    /// Expression yielding a signed factor; higher runs sooner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

/// A versioned function definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: Uuid,
    /// Human-readable slug, unique per workspace.
    pub slug: String,
    pub version: i32,
    pub triggers: Vec<Trigger>,
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<DebounceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<ConcurrencyLimit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<CancelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PrioritySpec>,
    /// Set when the function is paused; runs scheduled after this instant
    /// are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

impl Function {
    /// Retry count for the function's entry step, with the default applied.
    #[must_use]
    pub fn step_retries(&self) -> u32 {
        self.steps
            .first()
            .and_then(|s| s.retries)
            .unwrap_or(DEFAULT_STEP_RETRIES)
    }

    /// Whether the function is paused as of `now`.
    #[must_use]
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_at.is_some_and(|at| at <= now)
    }
}

/// Errors surfaced by function loading.
#[derive(Debug, Error, Diagnostic)]
pub enum FunctionLoaderError {
    #[error("function not found: {function_id}")]
    #[diagnostic(code(stepline::function::not_found))]
    NotFound { function_id: Uuid },

    #[error("function loader backend error: {message}")]
    #[diagnostic(code(stepline::function::backend))]
    Backend { message: String },
}

/// Read-only access to function definitions.
#[async_trait::async_trait]
pub trait FunctionLoader: Send + Sync {
    async fn load(&self, function_id: Uuid) -> Result<Arc<Function>, FunctionLoaderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(retries: Option<u32>) -> Function {
        Function {
            id: Uuid::new_v4(),
            slug: "demo".into(),
            version: 1,
            triggers: vec![Trigger {
                event: "demo/run".into(),
                expression: None,
            }],
            steps: vec![StepDefinition {
                id: "step".into(),
                name: "step".into(),
                runtime_type: "http".into(),
                retries,
            }],
            throttle: None,
            debounce: None,
            batch: None,
            concurrency: vec![],
            cancel: vec![],
            priority: None,
            paused_at: None,
        }
    }

    #[test]
    fn step_retries_defaults() {
        assert_eq!(minimal(None).step_retries(), DEFAULT_STEP_RETRIES);
        assert_eq!(minimal(Some(1)).step_retries(), 1);
    }

    #[test]
    fn paused_only_when_in_the_past() {
        let mut f = minimal(None);
        let now = Utc::now();
        assert!(!f.is_paused(now));
        f.paused_at = Some(now - chrono::Duration::seconds(1));
        assert!(f.is_paused(now));
        f.paused_at = Some(now + chrono::Duration::hours(1));
        assert!(!f.is_paused(now));
    }
}
