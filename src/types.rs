//! Run identity types for the stepline executor.
//!
//! This module defines how a single durable run is named. A [`RunId`] encodes
//! its own creation instant (millisecond precision plus a random tail), and a
//! [`RunIdentifier`] carries everything the queue and state store need to
//! address the run without loading it: workspace scoping, triggering events,
//! the idempotency key, and any evaluated concurrency keys.
//!
//! # Examples
//!
//! ```rust
//! use stepline::types::RunId;
//!
//! let id = RunId::new();
//! // The id embeds its creation time; later components (cancellation
//! // windows, trace start) read it back instead of storing a second clock.
//! assert!(id.timestamp_ms() > 0);
//!
//! let parsed: RunId = id.to_string().parse().unwrap();
//! assert_eq!(parsed, id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::{NoContext, Timestamp, Uuid};

/// Unique identifier of one run, minted at schedule time.
///
/// Backed by a UUIDv7 so the identifier is sortable by creation time and the
/// creation instant can be recovered via [`timestamp_ms`](Self::timestamp_ms).
/// The random tail keeps ids minted in the same millisecond distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Mint a new run id stamped with the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Mint a run id stamped with an explicit instant.
    ///
    /// Used by reruns and tests that need control over the embedded clock.
    #[must_use]
    pub fn at(when: DateTime<Utc>) -> Self {
        let secs = when.timestamp().max(0) as u64;
        let nanos = when.timestamp_subsec_nanos();
        Self(Uuid::new_v7(Timestamp::from_unix(NoContext, secs, nanos)))
    }

    /// The creation instant embedded in the id, as unix milliseconds.
    ///
    /// This is the run's time reference: cancellation expressions compare
    /// event timestamps against it and tracing uses it as the span start.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        match self.0.get_timestamp() {
            Some(ts) => {
                let (secs, nanos) = ts.to_unix();
                secs as i64 * 1000 + i64::from(nanos) / 1_000_000
            }
            None => 0,
        }
    }

    /// The creation instant as a [`DateTime<Utc>`].
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms()).unwrap_or_default()
    }

    /// The raw UUID backing this id.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

impl From<Uuid> for RunId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// Scope a custom concurrency limit binds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    Function,
    Account,
    Environment,
}

/// A custom concurrency key evaluated at schedule time.
///
/// The `hash` is the hash of the *unevaluated* key expression, copied onto the
/// identifier so a later function-version upgrade can re-target the limit
/// bucket without re-reading the old definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyKey {
    pub scope: ConcurrencyScope,
    /// The evaluated key, e.g. `"f:<fn-id>:customer-42"`.
    pub key: String,
    /// Hash of the raw key expression this key was evaluated from.
    pub hash: String,
    pub limit: u32,
}

/// Fully-qualified name of one run.
///
/// Created once by the scheduler and then carried by every queue item,
/// pause, and state record that refers to the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentifier {
    /// The function being run.
    pub workflow_id: Uuid,
    /// The function version captured at schedule time.
    pub workflow_version: i32,
    /// Unique id of this run; encodes the creation instant.
    pub run_id: RunId,
    /// Internal id of the triggering event (first event for batches).
    pub event_id: Uuid,
    /// Internal ids of every triggering event.
    pub event_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    /// Set when this run is a rerun of an earlier run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_id: Option<Uuid>,
    pub account_id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    /// Deduplication handle chosen by the scheduler (see
    /// [`idempotency_key`](Self::idempotency_key) for the prefixed form).
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrencyKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
}

impl RunIdentifier {
    /// The function-scoped idempotency key.
    ///
    /// Prefixed with the function id so two functions triggered by the same
    /// event never collide, and used as the base for every queue job id
    /// belonging to this run.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.key)
    }
}
