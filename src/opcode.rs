//! The opcode protocol returned by runtime drivers.
//!
//! A driver invocation returns either a final output or a list of
//! [`GeneratorOpcode`]s describing what the run should do next: memoize a
//! step result, report a step error, plan parallel steps, sleep, wait for an
//! event, or invoke another function. The interpreter in
//! [`crate::exec::interpreter`] dispatches on [`Op`].

use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Instruction kind inside a driver response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Terminate this execution thread; used to coalesce parallel branches.
    #[default]
    None,
    /// A step completed with an output to memoize.
    Step,
    /// Same as [`Op::Step`], reported by newer SDK protocol versions.
    StepRun,
    /// A step failed with a user-level error.
    StepError,
    /// A step was discovered but not executed; enqueue it for execution.
    StepPlanned,
    Sleep,
    WaitForEvent,
    InvokeFunction,
}

impl Op {
    /// Whether this opcode memoizes a step result directly.
    #[must_use]
    pub fn is_step(&self) -> bool {
        matches!(self, Op::Step | Op::StepRun)
    }
}

/// A user-level error carried by [`Op::StepError`] opcodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserError {
    pub name: String,
    pub message: String,
    /// When set the step must not be retried regardless of attempts left.
    #[serde(default)]
    pub no_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One instruction from a driver response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOpcode {
    pub op: Op,
    /// Stable step id; deterministic across retries of the same response.
    pub id: String,
    /// User-defined display name.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
}

/// Errors decoding opcode options.
#[derive(Debug, Error, Diagnostic)]
pub enum OpcodeError {
    #[error("opcode {op:?} ({id}) is missing opts")]
    #[diagnostic(code(stepline::opcode::missing_opts))]
    MissingOpts { op: Op, id: String },

    #[error("invalid opts for opcode {op:?} ({id}): {message}")]
    #[diagnostic(code(stepline::opcode::invalid_opts))]
    InvalidOpts {
        op: Op,
        id: String,
        message: String,
    },

    #[error("invalid duration {input:?}")]
    #[diagnostic(
        code(stepline::opcode::invalid_duration),
        help("Durations combine integer counts with units, e.g. \"30s\", \"5m\", \"1h30m\", \"250ms\".")
    )]
    InvalidDuration { input: String },
}

/// Options of an [`Op::Sleep`] opcode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Absolute wake-up instant (RFC 3339), taking precedence over
    /// `duration` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl SleepOpts {
    /// Resolve the instant the sleep ends, relative to `now`.
    pub fn wake_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, OpcodeError> {
        if let Some(until) = self.until {
            return Ok(until);
        }
        match &self.duration {
            Some(d) => Ok(now + parse_duration(d)?),
            None => Err(OpcodeError::InvalidDuration {
                input: String::new(),
            }),
        }
    }
}

/// Options of an [`Op::WaitForEvent`] opcode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitOpts {
    pub event: String,
    /// How long to wait before resolving with nil, e.g. `"1m"`. Older SDK
    /// protocol versions send this as `timeout`.
    #[serde(alias = "timeout")]
    pub expires: String,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub r#if: Option<String>,
}

impl WaitOpts {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, OpcodeError> {
        Ok(now + parse_duration(&self.expires)?)
    }
}

/// Options of an [`Op::InvokeFunction`] opcode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeOpts {
    pub function_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// How long to wait for the invoked function, e.g. `"1h"`. Older SDK
    /// protocol versions send this as `timeout`.
    #[serde(alias = "timeout")]
    pub expires: String,
}

impl InvokeOpts {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, OpcodeError> {
        Ok(now + parse_duration(&self.expires)?)
    }
}

impl GeneratorOpcode {
    fn opts_value(&self) -> Result<&Value, OpcodeError> {
        self.opts.as_ref().ok_or_else(|| OpcodeError::MissingOpts {
            op: self.op,
            id: self.id.clone(),
        })
    }

    fn decode_opts<T: serde::de::DeserializeOwned>(&self) -> Result<T, OpcodeError> {
        serde_json::from_value(self.opts_value()?.clone()).map_err(|e| {
            OpcodeError::InvalidOpts {
                op: self.op,
                id: self.id.clone(),
                message: e.to_string(),
            }
        })
    }

    pub fn sleep_opts(&self) -> Result<SleepOpts, OpcodeError> {
        self.decode_opts()
    }

    pub fn wait_opts(&self) -> Result<WaitOpts, OpcodeError> {
        self.decode_opts()
    }

    pub fn invoke_opts(&self) -> Result<InvokeOpts, OpcodeError> {
        self.decode_opts()
    }
}

/// Parse a compact duration string (`"30s"`, `"5m"`, `"1h30m"`, `"250ms"`)
/// into a [`chrono::Duration`].
///
/// Units may be chained largest-to-smallest; `ms` must come last.
pub fn parse_duration(input: &str) -> Result<Duration, OpcodeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(OpcodeError::InvalidDuration {
            input: input.to_string(),
        });
    }
    let invalid = || OpcodeError::InvalidDuration {
        input: input.to_string(),
    };

    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    let mut matched_any = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let count: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            'h' => Duration::hours(1),
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    Duration::milliseconds(1)
                } else {
                    Duration::minutes(1)
                }
            }
            's' => Duration::seconds(1),
            'd' => Duration::days(1),
            _ => return Err(invalid()),
        };
        total += unit * count as i32;
        matched_any = true;
    }

    if !digits.is_empty() || !matched_any {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::hours(1) + Duration::minutes(30)
        );
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("2d").unwrap(), Duration::days(2));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("5").is_err());
    }

    #[test]
    fn sleep_opts_prefer_until() {
        let until = Utc::now() + Duration::hours(2);
        let opts = SleepOpts {
            duration: Some("1s".into()),
            until: Some(until),
        };
        assert_eq!(opts.wake_at(Utc::now()).unwrap(), until);
    }

    #[test]
    fn wait_opts_decode_from_wire_shape() {
        let opcode = GeneratorOpcode {
            op: Op::WaitForEvent,
            id: "w".into(),
            opts: Some(json!({
                "event": "payment/succeeded",
                "expires": "1m",
                "if": "event.data.k == 'v'",
            })),
            ..Default::default()
        };
        let opts = opcode.wait_opts().unwrap();
        assert_eq!(opts.event, "payment/succeeded");
        assert_eq!(opts.expires, "1m");
        assert_eq!(opts.r#if.as_deref(), Some("event.data.k == 'v'"));
    }

    #[test]
    fn expires_accepts_the_legacy_timeout_alias() {
        let wait = GeneratorOpcode {
            op: Op::WaitForEvent,
            id: "w".into(),
            opts: Some(json!({"event": "x", "timeout": "30s"})),
            ..Default::default()
        };
        assert_eq!(wait.wait_opts().unwrap().expires, "30s");

        let invoke = GeneratorOpcode {
            op: Op::InvokeFunction,
            id: "call".into(),
            opts: Some(json!({"function_id": Uuid::nil(), "timeout": "1h"})),
            ..Default::default()
        };
        assert_eq!(invoke.invoke_opts().unwrap().expires, "1h");
    }

    #[test]
    fn missing_opts_is_a_typed_error() {
        let opcode = GeneratorOpcode {
            op: Op::Sleep,
            id: "s".into(),
            ..Default::default()
        };
        assert!(matches!(
            opcode.sleep_opts(),
            Err(OpcodeError::MissingOpts { .. })
        ));
    }
}
