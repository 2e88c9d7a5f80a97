use super::SafetyError;
use crate::adapters::fs::write_atomic;
use crate::domain::policy::{
    self, Automation, CompiledPolicy, PolicyDecision, PolicyStats, SafetyPolicy,
    DEFAULT_POLICY_YAML,
};
use crate::paths::PathResolver;
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{info, warn};

const POLICY_FILE_MODE: u32 = 0o644;
pub const DEFAULT_BLOCKED_HOURS: i64 = 24;
pub const DEFAULT_BLOCKED_LIMIT: usize = 100;

#[derive(Clone, Debug, Serialize)]
pub struct PolicyView {
    pub path: PathBuf,
    pub source: &'static str,
    pub content: String,
    pub policy: SafetyPolicy,
    pub stats: PolicyStats,
}

/// One line of the wrapper-written block log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

struct Cached {
    modified: Option<SystemTime>,
    compiled: Arc<CompiledPolicy>,
}

/// The active safety policy: `$HOME/.ntm/policy.yaml` when present, the
/// built-in default otherwise. Reloaded when the file's mtime changes.
pub struct PolicyStore {
    paths: Arc<dyn PathResolver>,
    builtin: Arc<CompiledPolicy>,
    cached: RwLock<Option<Cached>>,
}

impl PolicyStore {
    pub fn new(paths: Arc<dyn PathResolver>) -> Result<Self, SafetyError> {
        Ok(Self {
            paths,
            builtin: Arc::new(SafetyPolicy::builtin().compile()?),
            cached: RwLock::new(None),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.paths.policy_file()
    }

    pub fn current(&self) -> Arc<CompiledPolicy> {
        let path = self.path();
        let modified = match std::fs::metadata(&path) {
            Ok(meta) => meta.modified().ok(),
            Err(_) => return self.builtin.clone(),
        };
        if let Some(cached) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|cached| cached.modified == modified)
        {
            return cached.compiled.clone();
        }

        let compiled = match std::fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|content| {
                SafetyPolicy::from_yaml(&content)
                    .and_then(|policy| policy.compile())
                    .map_err(|err| err.to_string())
            }) {
            Ok(compiled) => Arc::new(compiled),
            Err(err) => {
                warn!(path = %path.display(), %err, "policy file unusable; using built-in default");
                self.builtin.clone()
            }
        };
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(Cached {
            modified,
            compiled: compiled.clone(),
        });
        compiled
    }

    fn invalidate(&self) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn check(&self, command: &str) -> PolicyDecision {
        self.current().check(command)
    }

    pub fn slb_required(&self, action: &str) -> bool {
        self.current().slb_required(action)
    }

    pub async fn view(&self) -> Result<PolicyView, SafetyError> {
        let path = self.path();
        let (source, content) = match tokio::fs::read_to_string(&path).await {
            Ok(content) => ("file", content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ("default", DEFAULT_POLICY_YAML.to_string())
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into())
            }
        };
        let policy = self.current().policy().clone();
        Ok(PolicyView {
            path,
            source,
            content,
            stats: policy.stats(),
            policy,
        })
    }

    pub async fn update(&self, content: &str) -> Result<PolicyView, SafetyError> {
        let report = policy::validate(content);
        if !report.valid {
            return Err(SafetyError::InvalidPolicy(report));
        }
        self.write(content).await?;
        info!(path = %self.path().display(), "policy updated");
        self.view().await
    }

    pub async fn reset(&self) -> Result<PolicyView, SafetyError> {
        self.write(DEFAULT_POLICY_YAML).await?;
        info!(path = %self.path().display(), "policy reset to default");
        self.view().await
    }

    /// Writes the default policy unless a policy file already exists.
    pub async fn ensure_default(&self) -> Result<bool, SafetyError> {
        if tokio::fs::try_exists(self.path()).await.unwrap_or(false) {
            return Ok(false);
        }
        self.write(DEFAULT_POLICY_YAML).await?;
        Ok(true)
    }

    pub fn automation(&self) -> Automation {
        self.current().policy().automation.clone()
    }

    pub async fn update_automation(&self, automation: Automation) -> Result<Automation, SafetyError> {
        let mut policy = self.current().policy().clone();
        policy.automation = automation;
        let yaml = policy.to_yaml()?;
        self.write(&yaml).await?;
        Ok(self.automation())
    }

    async fn write(&self, content: &str) -> Result<(), SafetyError> {
        let path = self.path();
        write_atomic(&path, content.as_bytes(), Some(POLICY_FILE_MODE))
            .await
            .with_context(|| format!("writing policy {}", path.display()))?;
        self.invalidate();
        Ok(())
    }

    /// Entries from the block log within the last `hours`, newest first.
    pub async fn blocked(&self, hours: i64, limit: usize) -> Result<Vec<BlockedEntry>, SafetyError> {
        let hours = if hours <= 0 { DEFAULT_BLOCKED_HOURS } else { hours };
        let limit = if limit == 0 { DEFAULT_BLOCKED_LIMIT } else { limit };
        let path = self.paths.blocked_log();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into())
            }
        };
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let mut entries: Vec<BlockedEntry> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<BlockedEntry>(line).ok())
            .filter(|entry| entry.timestamp >= cutoff)
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{ForceRelease, PolicyAction};
    use crate::paths::HomePaths;

    fn store(home: &std::path::Path) -> PolicyStore {
        PolicyStore::new(Arc::new(HomePaths::new(home))).unwrap()
    }

    #[tokio::test]
    async fn falls_back_to_builtin_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let view = store.view().await.unwrap();
        assert_eq!(view.source, "default");
        assert_eq!(store.check("git reset --hard HEAD").action, PolicyAction::Block);
        assert!(store.slb_required("force_release"));

        assert!(store.ensure_default().await.unwrap());
        assert!(!store.ensure_default().await.unwrap());
        assert_eq!(store.view().await.unwrap().source, "file");
    }

    #[tokio::test]
    async fn update_rejects_invalid_and_applies_valid() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store
            .update("version: 1\nblocked:\n  - pattern: '('\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SafetyError::InvalidPolicy(_)));
        assert!(!store.path().exists());

        store
            .update("version: 2\nblocked:\n  - pattern: 'make\\s+clean'\n    reason: no\n")
            .await
            .unwrap();
        assert_eq!(store.check("make clean").action, PolicyAction::Block);
        assert_eq!(store.check("git reset --hard").action, PolicyAction::Allow);

        store.reset().await.unwrap();
        assert_eq!(store.check("git reset --hard").action, PolicyAction::Block);
    }

    #[tokio::test]
    async fn automation_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.automation().force_release, ForceRelease::Approval);
        let updated = store
            .update_automation(Automation {
                auto_commit: true,
                auto_push: false,
                force_release: ForceRelease::Never,
            })
            .await
            .unwrap();
        assert!(updated.auto_commit);
        assert_eq!(store.automation().force_release, ForceRelease::Never);
        assert_eq!(store.check("git reset --hard").action, PolicyAction::Block);
    }

    #[tokio::test]
    async fn blocked_log_is_windowed_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HomePaths::new(dir.path());
        let log = paths.blocked_log();
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        let recent = Utc::now() - ChronoDuration::minutes(5);
        let older = Utc::now() - ChronoDuration::minutes(50);
        let stale = Utc::now() - ChronoDuration::hours(30);
        let lines = [
            format!(r#"{{"timestamp":"{}","command":"git reset --hard","session":"a"}}"#, older.to_rfc3339()),
            "not json".to_string(),
            format!(r#"{{"timestamp":"{}","command":"rm -rf /"}}"#, stale.to_rfc3339()),
            format!(r#"{{"timestamp":"{}","command":"git clean -fd"}}"#, recent.to_rfc3339()),
        ];
        std::fs::write(&log, lines.join("\n")).unwrap();

        let store = store(dir.path());
        let entries = store.blocked(24, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, "git clean -fd");
        assert_eq!(entries[1].extra["session"], "a");
        assert_eq!(store.blocked(24, 1).await.unwrap().len(), 1);
    }
}
