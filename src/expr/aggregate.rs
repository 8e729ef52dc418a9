//! Aggregate pause index: sub-linear matching for large pause sets.
//!
//! Linear evaluation of every candidate pause is fine for a handful of
//! waiters; it is not fine for tens of thousands. The index exploits the
//! shape of saved expressions: after save-time interpolation, most reduce to
//! a conjunction containing at least one constant equality on an `async.*`
//! attribute. Those tuples are extracted once at insert time and keyed under
//! `(workspace, event_name, attribute, value)`, so an incoming event only
//! touches the pauses whose constants it actually carries. Expressions with
//! no usable constant fall back to a per-event-name scan set, preserving
//! correctness.
//!
//! The index returns *candidates*; callers re-evaluate the full expression
//! before consuming, so a stale or overly-broad entry can never cause a
//! false resume.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use uuid::Uuid;

use crate::event::TriggerEvent;
use crate::expr::Expression;
use crate::pause::Pause;

/// Root all indexed attributes live under: the incoming event.
const ASYNC_ROOT: &str = "async";

/// `(workspace, event-name filter)`. Pauses without a name filter index
/// under an empty name and are considered for every event.
type ScopeKey = (Uuid, String);

#[derive(Default)]
struct IndexInner {
    /// Constant-equality buckets: scope -> (attribute path, canonical value)
    /// -> pause ids.
    buckets: FxHashMap<ScopeKey, FxHashMap<(String, String), FxHashSet<Uuid>>>,
    /// Pauses whose expression has no indexable constant.
    scans: FxHashMap<ScopeKey, FxHashSet<Uuid>>,
    pauses: FxHashMap<Uuid, Pause>,
}

/// Concurrent aggregate index over pause expressions.
#[derive(Default)]
pub struct PauseIndex {
    inner: RwLock<IndexInner>,
}

impl PauseIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(pause: &Pause) -> ScopeKey {
        (
            pause.workspace_id,
            pause.event.clone().unwrap_or_default(),
        )
    }

    /// Index a pause. Pauses with an unparseable expression go to the scan
    /// set; evaluation at match time decides their fate.
    pub fn add(&self, pause: Pause) {
        let scope = Self::scope(&pause);
        let tuples = pause
            .expression
            .as_deref()
            .and_then(|src| Expression::parse(src).ok())
            .map(|expr| indexable_tuples(&expr))
            .unwrap_or_default();

        let mut inner = self.inner.write();
        if tuples.is_empty() {
            inner.scans.entry(scope).or_default().insert(pause.id);
        } else {
            let bucket = inner.buckets.entry(scope).or_default();
            for tuple in tuples {
                bucket.entry(tuple).or_default().insert(pause.id);
            }
        }
        inner.pauses.insert(pause.id, pause);
    }

    /// Drop a pause from the index after it was consumed or deleted.
    pub fn remove(&self, pause_id: Uuid) {
        let mut inner = self.inner.write();
        let Some(pause) = inner.pauses.remove(&pause_id) else {
            return;
        };
        let scope = Self::scope(&pause);
        if let Some(set) = inner.scans.get_mut(&scope) {
            set.remove(&pause_id);
        }
        if let Some(bucket) = inner.buckets.get_mut(&scope) {
            for set in bucket.values_mut() {
                set.remove(&pause_id);
            }
            bucket.retain(|_, set| !set.is_empty());
        }
    }

    /// Candidate pauses for an incoming event: every bucket hit by one of
    /// the event's attributes, plus the scan sets. O(event attributes +
    /// matches), independent of the total pause count.
    #[must_use]
    pub fn matches(&self, workspace_id: Uuid, event: &TriggerEvent) -> Vec<Pause> {
        let attrs = flatten(ASYNC_ROOT, &event.map());
        let scopes = [
            (workspace_id, event.name.clone()),
            (workspace_id, String::new()),
        ];

        let inner = self.inner.read();
        let mut ids: FxHashSet<Uuid> = FxHashSet::default();
        for scope in &scopes {
            if let Some(bucket) = inner.buckets.get(scope) {
                for tuple in &attrs {
                    if let Some(set) = bucket.get(tuple) {
                        ids.extend(set.iter().copied());
                    }
                }
            }
            if let Some(set) = inner.scans.get(scope) {
                ids.extend(set.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| inner.pauses.get(&id).cloned())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().pauses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().pauses.is_empty()
    }
}

/// Constant equalities on `async.*` attributes, in canonical string form.
fn indexable_tuples(expr: &Expression) -> Vec<(String, String)> {
    expr.conjunctive_equalities()
        .into_iter()
        .filter(|(path, _)| {
            path.split('.').next() == Some(ASYNC_ROOT)
        })
        .map(|(path, value)| (path, canonical(&value)))
        .collect()
}

fn canonical(value: &Value) -> String {
    value.to_string()
}

/// Flatten a JSON tree into `(dotted path, canonical value)` pairs rooted at
/// `root`, scalars only.
fn flatten(root: &str, value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(root, value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(&format!("{prefix}.{k}"), v, out);
            }
        }
        Value::Array(_) => {}
        scalar => out.push((prefix.to_string(), canonical(scalar))),
    }
}
