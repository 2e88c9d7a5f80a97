use super::AdapterError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// A named command dispatched to the session kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelCall {
    pub command: String,
    pub args: Value,
    pub timeout: Option<Duration>,
}

impl KernelCall {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Value::Object(Default::default()),
            timeout: None,
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
pub trait Kernel: Send + Sync {
    async fn call(&self, call: KernelCall) -> Result<Value, AdapterError>;
}
