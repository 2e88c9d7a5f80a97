use crate::adapters::tools::ToolRegistry;
use crate::app::events::EventBus;
use crate::domain::events::topics;
use crate::ports::AdapterError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

pub const ROTATION_HISTORY: usize = 100;
const CAAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RotateRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RotationRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_by: String,
}

/// Coding-agent accounts managed through `caam`, plus the rotations this
/// process performed.
pub struct AccountService {
    tools: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    history: Mutex<VecDeque<RotationRecord>>,
}

impl AccountService {
    pub fn new(tools: Arc<ToolRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            tools,
            bus,
            history: Mutex::new(VecDeque::with_capacity(ROTATION_HISTORY)),
        }
    }

    pub async fn list(&self) -> Result<Value, AdapterError> {
        self.tools.run_json("caam", ["list", "--json"], CAAM_TIMEOUT).await
    }

    pub async fn status(&self) -> Result<Value, AdapterError> {
        self.tools.run_json("caam", ["status", "--json"], CAAM_TIMEOUT).await
    }

    pub async fn rotate(&self, request: RotateRequest, user: &str) -> Result<(Value, RotationRecord), AdapterError> {
        let mut args = vec!["rotate".to_string()];
        if let Some(provider) = request.provider.as_deref().filter(|p| !p.is_empty()) {
            args.push(provider.to_string());
        }
        if let Some(account) = request.account.as_deref().filter(|a| !a.is_empty()) {
            args.push("--to".into());
            args.push(account.to_string());
        }
        args.push("--json".into());
        let result = self.tools.run_json("caam", args, CAAM_TIMEOUT).await?;

        let text = |key: &str| result.get(key).and_then(Value::as_str).map(str::to_string);
        let record = RotationRecord {
            timestamp: Utc::now(),
            provider: request.provider.clone().or_else(|| text("provider")),
            previous: text("previous").or_else(|| text("from")),
            current: text("current").or_else(|| text("to")),
            reason: request.reason,
            requested_by: user.to_string(),
        };
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == ROTATION_HISTORY {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        info!(provider = ?record.provider, user, "account rotated");
        self.bus.publish(
            topics::ACCOUNTS,
            "account.rotated",
            serde_json::to_value(&record).unwrap_or_else(|_| json!({})),
        );
        Ok((result, record))
    }

    /// Rotations newest first.
    pub fn history(&self, limit: usize) -> Vec<RotationRecord> {
        let limit = if limit == 0 { ROTATION_HISTORY } else { limit };
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::events::{EventStoreConfig, WsEventStore};
    use crate::testing::ScriptedRunner;
    use std::os::unix::fs::PermissionsExt;

    fn service(bin: &std::path::Path, runner: Arc<ScriptedRunner>) -> AccountService {
        let tools = Arc::new(ToolRegistry::detect(Some(bin.as_os_str().to_owned()), runner));
        let bus = Arc::new(EventBus::new(Arc::new(WsEventStore::memory(
            EventStoreConfig::default(),
        ))));
        AccountService::new(tools, bus)
    }

    #[tokio::test]
    async fn missing_caam_is_a_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = service(dir.path(), Arc::new(ScriptedRunner::default()));
        assert_eq!(
            accounts.list().await.unwrap_err(),
            AdapterError::DependencyMissing("caam".into())
        );
    }

    #[tokio::test]
    async fn rotation_is_recorded_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let caam = dir.path().join("caam");
        std::fs::write(&caam, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&caam, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = Arc::new(ScriptedRunner::default());
        runner.push_stdout(0, r#"{"provider":"claude","from":"a@x","to":"b@x"}"#);
        runner.push_stdout(0, r#"{"provider":"codex","from":"c@x","to":"d@x"}"#);
        let accounts = service(dir.path(), runner.clone());

        accounts
            .rotate(
                RotateRequest {
                    provider: Some("claude".into()),
                    account: Some("b@x".into()),
                    reason: Some("rate limited".into()),
                },
                "alice",
            )
            .await
            .unwrap();
        accounts.rotate(RotateRequest::default(), "bob").await.unwrap();

        assert_eq!(
            runner.calls()[0].args,
            vec!["rotate", "claude", "--to", "b@x", "--json"]
        );
        let history = accounts.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].requested_by, "bob");
        assert_eq!(history[0].provider.as_deref(), Some("codex"));
        assert_eq!(history[1].current.as_deref(), Some("b@x"));
    }
}
