//! Request handlers, one module per resource. Each handler validates its
//! input, delegates to a service or the kernel, and publishes the events the
//! registry declares for it.

pub mod agents;
pub mod approvals;
pub mod checkpoints;
pub mod history;
pub mod integrations;
pub mod jobs;
pub mod panes;
pub mod pipelines;
pub mod safety;
pub mod sessions;
pub mod system;

use super::envelope::ApiError;
use crate::ports::kernel::KernelCall;
use crate::AppState;
use serde_json::Value;
use std::time::Duration;

const MAX_NAME_LEN: usize = 128;

/// Runs one kernel command.
pub(crate) async fn kernel(state: &AppState, command: &str, args: Value) -> Result<Value, ApiError> {
    Ok(state.kernel.call(KernelCall::new(command).args(args)).await?)
}

pub(crate) async fn kernel_with_timeout(
    state: &AppState,
    command: &str,
    args: Value,
    timeout: Duration,
) -> Result<Value, ApiError> {
    Ok(state
        .kernel
        .call(KernelCall::new(command).args(args).timeout(timeout))
        .await?)
}

/// Session names, checkpoint ids and the like end up in paths and tmux
/// targets: no separators, no leading dot.
pub(crate) fn validate_name<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::invalid_field(field, format!("{field} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ApiError::invalid_field(
            field,
            format!("{field} must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    if value.starts_with('.')
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return Err(ApiError::invalid_field(
            field,
            format!("{field} may contain only letters, digits, '-', '_', '.', '@' and must not start with '.'"),
        ));
    }
    Ok(value)
}

pub(crate) fn require_text<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid_field(field, format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

/// Splits `a,b,c` query values.
pub(crate) fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
