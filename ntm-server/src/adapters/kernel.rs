use super::cli::run_json;
use super::tools::ToolRegistry;
use crate::ports::command_runner::{CommandRunner, ProcessSpec};
use crate::ports::kernel::{Kernel, KernelCall};
use crate::ports::AdapterError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Dispatches kernel commands to `ntm kernel exec <command> --json` with the
/// arguments as JSON on stdin.
pub struct ProcessKernel {
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
}

impl ProcessKernel {
    pub fn new(program: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
            default_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[async_trait]
impl Kernel for ProcessKernel {
    async fn call(&self, call: KernelCall) -> Result<Value, AdapterError> {
        let stdin = serde_json::to_vec(&call.args)
            .map_err(|err| AdapterError::Invalid(format!("unserializable arguments: {err}")))?;
        let spec = ProcessSpec::new(&self.program)
            .args(["kernel", "exec", call.command.as_str(), "--json"])
            .stdin(stdin)
            .timeout(call.timeout.unwrap_or(self.default_timeout));
        debug!(command = %call.command, "kernel call");
        run_json(self.runner.as_ref(), &spec, "ntm").await
    }
}

/// Kernel bound to whatever `ntm` the tool registry currently resolves, so a
/// `deps/refresh` after installing it takes effect without a restart.
pub struct ToolKernel {
    tools: Arc<ToolRegistry>,
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
}

impl ToolKernel {
    pub fn new(tools: Arc<ToolRegistry>, runner: Arc<dyn CommandRunner>, default_timeout: Duration) -> Self {
        Self {
            tools,
            runner,
            default_timeout,
        }
    }
}

#[async_trait]
impl Kernel for ToolKernel {
    async fn call(&self, call: KernelCall) -> Result<Value, AdapterError> {
        let program = self.tools.resolve("ntm")?;
        ProcessKernel::new(program, self.runner.clone())
            .with_timeout(self.default_timeout)
            .call(call)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use serde_json::json;

    fn kernel(runner: Arc<ScriptedRunner>) -> ProcessKernel {
        ProcessKernel::new("ntm", runner)
    }

    #[tokio::test]
    async fn passes_arguments_on_stdin() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_stdout(0, r#"{"sessions":[]}"#);
        let value = kernel(runner.clone())
            .call(KernelCall::new("sessions.list").args(json!({"limit": 5})))
            .await
            .unwrap();
        assert_eq!(value, json!({"sessions": []}));
        let spec = runner.calls().pop().unwrap();
        assert_eq!(spec.args, vec!["kernel", "exec", "sessions.list", "--json"]);
        assert_eq!(spec.stdin.unwrap(), br#"{"limit":5}"#.to_vec());
    }

    #[tokio::test]
    async fn error_codes_are_mapped() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_stdout(
            1,
            r#"{"success":false,"error":"no such session","error_code":"SESSION_NOT_FOUND"}"#,
        );
        let err = kernel(runner)
            .call(KernelCall::new("sessions.get"))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::NotFound("no such session".into()));
    }

    #[tokio::test]
    async fn missing_binary_is_a_dependency_error() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_not_found();
        let err = kernel(runner)
            .call(KernelCall::new("sessions.list"))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::DependencyMissing("ntm".into()));
    }

    #[tokio::test]
    async fn call_timeout_overrides_default() {
        let runner = Arc::new(ScriptedRunner::default());
        kernel(runner.clone())
            .call(KernelCall::new("agents.wait").timeout(Duration::from_secs(95)))
            .await
            .unwrap();
        assert_eq!(runner.calls()[0].timeout, Duration::from_secs(95));
    }
}
