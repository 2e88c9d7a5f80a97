use crate::ports::command_runner::{CommandRunner, ProcessOutput, ProcessSpec, RunError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Spawns real child processes. Dropping the future kills the child.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput, RunError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RunError::NotFound(spec.program.display().to_string())
            } else {
                RunError::Io {
                    command: spec.display(),
                    source,
                }
            }
        })?;

        if let (Some(bytes), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin
                .write_all(bytes)
                .await
                .map_err(|source| RunError::Io {
                    command: spec.display(),
                    source,
                })?;
            drop(stdin);
        }

        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| RunError::Timeout {
                command: spec.display(),
                timeout: spec.timeout,
            })?
            .map_err(|source| RunError::Io {
                command: spec.display(),
                source,
            })?;

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn runner_pipes_stdin_to_child() {
        let runner = ProcessCommandRunner::new();
        let spec = ProcessSpec::new("cat").stdin(b"{\"ok\":true}".to_vec());
        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let runner = ProcessCommandRunner::new();
        let spec = ProcessSpec::new("/nonexistent/ntm-binary");
        assert!(matches!(runner.run(&spec).await, Err(RunError::NotFound(_))));
    }

    #[tokio::test]
    async fn slow_child_times_out() {
        let runner = ProcessCommandRunner::new();
        let spec = ProcessSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        assert!(matches!(runner.run(&spec).await, Err(RunError::Timeout { .. })));
    }
}
