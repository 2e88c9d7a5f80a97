use crate::ports::command_runner::{CommandRunner, ProcessOutput, ProcessSpec, RunError};
use crate::ports::AdapterError;
use serde_json::{json, Value};

/// Runs a CLI that speaks JSON on stdout and maps failures to adapter errors.
pub async fn run_json(
    runner: &dyn CommandRunner,
    spec: &ProcessSpec,
    tool: &str,
) -> Result<Value, AdapterError> {
    match runner.run(spec).await {
        Ok(output) => decode_output(tool, output),
        Err(RunError::NotFound(_)) => Err(AdapterError::DependencyMissing(tool.to_string())),
        Err(err @ RunError::Timeout { .. }) => Err(AdapterError::Timeout(err.to_string())),
        Err(err) => Err(AdapterError::Failed(err.to_string())),
    }
}

pub fn decode_output(tool: &str, output: ProcessOutput) -> Result<Value, AdapterError> {
    let text = String::from_utf8_lossy(&output.stdout);
    let text = text.trim();
    let parsed: Option<Value> = if text.is_empty() {
        None
    } else {
        serde_json::from_str(text).ok()
    };

    if let Some(err) = parsed.as_ref().and_then(error_from_payload) {
        return Err(err);
    }
    if !output.success() {
        let stderr = output.stderr_text();
        let message = if stderr.is_empty() {
            format!("{tool} exited with {:?}", output.code)
        } else {
            stderr
        };
        return Err(AdapterError::Failed(message));
    }

    Ok(match parsed {
        Some(value) => value,
        None if text.is_empty() => json!({}),
        None => json!({ "output": text }),
    })
}

fn error_from_payload(value: &Value) -> Option<AdapterError> {
    let object = value.as_object()?;
    let failed = object.get("success").and_then(Value::as_bool) == Some(false);
    let code = object.get("error_code").and_then(Value::as_str);
    if !failed && code.is_none() {
        return None;
    }
    let message = object
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("command failed");
    Some(AdapterError::from_code(code.unwrap_or("INTERNAL"), message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            code: Some(code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn error_payload_wins_over_exit_code() {
        let err = decode_output(
            "ntm",
            output(0, r#"{"success":false,"error":"bad","error_code":"INVALID_ARGS"}"#, ""),
        )
        .unwrap_err();
        assert_eq!(err, AdapterError::Invalid("bad".into()));
    }

    #[test]
    fn stderr_is_used_for_failures_without_payload() {
        let err = decode_output("caam", output(2, "", "no accounts configured\n")).unwrap_err();
        assert_eq!(err, AdapterError::Failed("no accounts configured".into()));
    }

    #[test]
    fn empty_and_text_outputs_are_wrapped() {
        assert_eq!(decode_output("br", output(0, "", "")).unwrap(), json!({}));
        assert_eq!(
            decode_output("br", output(0, "done\n", "")).unwrap(),
            json!({"output": "done"})
        );
    }
}
