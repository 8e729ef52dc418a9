//! Scripted runtime drivers for exercising the engine without a real SDK.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

use stepline::driver::{DriverError, DriverResponse, RuntimeDriver};
use stepline::function::StepDefinition;
use stepline::opcode::{GeneratorOpcode, Op, UserError};
use stepline::queue::{Edge, QueueItem};
use stepline::state::RunState;

/// One recorded driver invocation.
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub edge: Edge,
    pub attempt: u32,
    pub memoized_steps: usize,
}

enum Scripted {
    Respond(DriverResponse),
    Fail(String),
}

/// Driver that replays a scripted sequence of responses.
///
/// Once the script is exhausted it returns a final null response, which the
/// engine treats as the function returning.
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, response: DriverResponse) {
        self.script.lock().push_back(Scripted::Respond(response));
    }

    pub fn respond_opcodes(&self, opcodes: Vec<GeneratorOpcode>) {
        self.respond(DriverResponse {
            generator: opcodes,
            request_version: 1,
            ..Default::default()
        });
    }

    pub fn respond_final(&self, output: Value) {
        self.respond(DriverResponse {
            output: Some(output),
            request_version: 1,
            ..Default::default()
        });
    }

    pub fn fail_transport(&self, message: &str) {
        self.script
            .lock()
            .push_back(Scripted::Fail(message.to_string()));
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RuntimeDriver for ScriptedDriver {
    fn runtime_type(&self) -> &'static str {
        "test"
    }

    async fn execute(
        &self,
        state: &RunState,
        item: &QueueItem,
        edge: &Edge,
        _step: &StepDefinition,
        _stack_index: usize,
        _attempt: u32,
    ) -> Result<DriverResponse, DriverError> {
        self.calls.lock().push(CallRecord {
            edge: edge.clone(),
            attempt: item.attempt,
            memoized_steps: state.step_count(),
        });
        match self.script.lock().pop_front() {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(DriverError::Transport { message }),
            None => Ok(DriverResponse {
                output: Some(Value::Null),
                request_version: 1,
                ..Default::default()
            }),
        }
    }
}

/// Shorthand for a generator opcode.
pub fn opcode(op: Op, id: &str) -> GeneratorOpcode {
    GeneratorOpcode {
        op,
        id: id.to_string(),
        name: id.to_string(),
        ..Default::default()
    }
}

/// Shorthand for a generator opcode with options.
pub fn opcode_with_opts(op: Op, id: &str, opts: Value) -> GeneratorOpcode {
    GeneratorOpcode {
        opts: Some(opts),
        ..opcode(op, id)
    }
}

/// Shorthand for a step-error opcode.
pub fn step_error(id: &str, message: &str, no_retry: bool) -> GeneratorOpcode {
    GeneratorOpcode {
        error: Some(UserError {
            name: "Error".to_string(),
            message: message.to_string(),
            no_retry,
            data: None,
        }),
        ..opcode(Op::StepError, id)
    }
}
