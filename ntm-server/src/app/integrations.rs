use crate::adapters::tools::ToolRegistry;
use crate::app::events::EventBus;
use crate::domain::events::topics;
use crate::paths::PathResolver;
use crate::ports::AdapterError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::info;

const MEMORY_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_TIMEOUT: Duration = Duration::from_secs(600);
const DAEMON_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonPidFile {
    pub pid: u32,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DaemonStatus {
    pub session: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonPidFile>,
}

/// `cm` memory daemon: context lookups and per-session liveness.
pub struct MemoryService {
    tools: Arc<ToolRegistry>,
    paths: Arc<dyn PathResolver>,
}

impl MemoryService {
    pub fn new(tools: Arc<ToolRegistry>, paths: Arc<dyn PathResolver>) -> Self {
        Self { tools, paths }
    }

    pub async fn context(&self, task: &str) -> Result<Value, AdapterError> {
        if task.trim().is_empty() {
            return Err(AdapterError::Invalid("task is required".into()));
        }
        self.tools
            .run_json("cm", ["context".to_string(), task.to_string(), "--json".into()], MEMORY_TIMEOUT)
            .await
    }

    /// Reads `pids/cm-<session>.pid` and checks the daemon port.
    pub async fn daemon(&self, session: &str) -> Result<DaemonStatus, AdapterError> {
        if session.is_empty() || session.contains(['/', '\\']) || session.starts_with('.') {
            return Err(AdapterError::Invalid(format!("invalid session name '{session}'")));
        }
        let path = self.paths.pid_dir().join(format!("cm-{session}.pid"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DaemonStatus {
                    session: session.to_string(),
                    running: false,
                    daemon: None,
                })
            }
            Err(err) => return Err(AdapterError::Failed(format!("reading {}: {err}", path.display()))),
        };
        let daemon: DaemonPidFile = serde_json::from_slice(&bytes)
            .map_err(|err| AdapterError::Failed(format!("corrupt pid file {}: {err}", path.display())))?;
        let running = match daemon.port {
            Some(port) => tokio::time::timeout(
                DAEMON_CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect(("127.0.0.1", port)),
            )
            .await
            .is_ok_and(|connected| connected.is_ok()),
            None => false,
        };
        Ok(DaemonStatus {
            session: session.to_string(),
            running,
            daemon: Some(daemon),
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub only: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanRecord {
    pub finished_at: DateTime<Utc>,
    pub requested_by: String,
    pub result: Value,
}

/// `ubs` bug scanner with the last result kept for status queries.
pub struct ScannerService {
    tools: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    last: RwLock<Option<ScanRecord>>,
}

impl ScannerService {
    pub fn new(tools: Arc<ToolRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            tools,
            bus,
            last: RwLock::new(None),
        }
    }

    pub async fn run(&self, request: ScanRequest, user: &str) -> Result<ScanRecord, AdapterError> {
        let mut args = vec!["--format=json".to_string()];
        if let Some(only) = request.only.filter(|only| !only.is_empty()) {
            args.push(format!("--only={only}"));
        }
        args.push(request.path.unwrap_or_else(|| ".".into()));
        let result = self.tools.run_json("ubs", args, SCAN_TIMEOUT).await?;
        let record = ScanRecord {
            finished_at: Utc::now(),
            requested_by: user.to_string(),
            result,
        };
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        info!(user, "scan completed");
        self.bus.publish(
            topics::SCANNER,
            "scan.completed",
            json!({"finished_at": record.finished_at, "requested_by": user, "result": record.result}),
        );
        Ok(record)
    }

    pub fn status(&self) -> Value {
        json!({
            "available": self.tools.is_installed("ubs"),
            "last_scan": *self.last.read().unwrap_or_else(PoisonError::into_inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::{EventStoreConfig, WsEventStore};
    use crate::paths::HomePaths;
    use crate::testing::ScriptedRunner;

    #[tokio::test]
    async fn daemon_status_reads_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Arc<dyn PathResolver> = Arc::new(HomePaths::new(dir.path()));
        let tools = Arc::new(ToolRegistry::detect(
            Some(dir.path().as_os_str().to_owned()),
            Arc::new(ScriptedRunner::default()),
        ));
        let memory = MemoryService::new(tools, paths.clone());

        let missing = memory.daemon("proj").await.unwrap();
        assert!(!missing.running && missing.daemon.is_none());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        std::fs::create_dir_all(paths.pid_dir()).unwrap();
        std::fs::write(
            paths.pid_dir().join("cm-proj.pid"),
            format!(r#"{{"pid":4242,"port":{port},"session_id":"proj"}}"#),
        )
        .unwrap();
        let status = memory.daemon("proj").await.unwrap();
        assert!(status.running);
        assert_eq!(status.daemon.unwrap().pid, 4242);

        assert!(matches!(memory.daemon("../etc").await, Err(AdapterError::Invalid(_))));
        assert!(matches!(memory.context(" ").await, Err(AdapterError::Invalid(_))));
    }

    #[tokio::test]
    async fn scanner_without_ubs_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(ToolRegistry::detect(
            Some(dir.path().as_os_str().to_owned()),
            Arc::new(ScriptedRunner::default()),
        ));
        let bus = Arc::new(EventBus::new(Arc::new(WsEventStore::memory(
            EventStoreConfig::default(),
        ))));
        let scanner = ScannerService::new(tools, bus);
        assert_eq!(
            scanner.run(ScanRequest::default(), "alice").await.unwrap_err(),
            AdapterError::DependencyMissing("ubs".into())
        );
        assert_eq!(scanner.status()["available"], false);
    }
}
