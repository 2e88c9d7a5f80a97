//! Test doubles shared by unit tests.

use crate::ports::command_runner::{CommandRunner, ProcessOutput, ProcessSpec, RunError};
use crate::ports::kernel::{Kernel, KernelCall};
use crate::ports::AdapterError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

enum Scripted {
    Output(ProcessOutput),
    NotFound,
}

/// Replays queued process results in order and records every spec it saw.
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<ProcessSpec>>,
}

impl ScriptedRunner {
    pub fn push_stdout(&self, code: i32, stdout: &str) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Output(ProcessOutput {
                code: Some(code),
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            }));
    }

    pub fn push_stderr(&self, code: i32, stderr: &str) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Output(ProcessOutput {
                code: Some(code),
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            }));
    }

    pub fn push_not_found(&self) {
        self.queue.lock().unwrap().push_back(Scripted::NotFound);
    }

    pub fn calls(&self) -> Vec<ProcessSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput, RunError> {
        self.calls.lock().unwrap().push(spec.clone());
        match self.queue.lock().unwrap().pop_front() {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::NotFound) => Err(RunError::NotFound(spec.program.display().to_string())),
            None => Ok(ProcessOutput {
                code: Some(0),
                stdout: b"{}".to_vec(),
                stderr: Vec::new(),
            }),
        }
    }
}

/// Kernel answering from a fixed table keyed by command name.
#[derive(Default)]
pub struct StubKernel {
    responses: Mutex<HashMap<String, Result<Value, AdapterError>>>,
    calls: Mutex<Vec<KernelCall>>,
}

impl StubKernel {
    pub fn respond(&self, command: &str, result: Result<Value, AdapterError>) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), result);
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Kernel for StubKernel {
    async fn call(&self, call: KernelCall) -> Result<Value, AdapterError> {
        let result = self
            .responses
            .lock()
            .unwrap()
            .get(&call.command)
            .cloned()
            .unwrap_or_else(|| Ok(serde_json::json!({})));
        self.calls.lock().unwrap().push(call);
        result
    }
}
