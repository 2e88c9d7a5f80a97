use super::cli::run_json;
use crate::ports::command_runner::{CommandRunner, ProcessSpec};
use crate::ports::AdapterError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    pub binaries: &'static [&'static str],
    pub description: &'static str,
}

pub const KNOWN_TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "ntm",
        binaries: &["ntm"],
        description: "session kernel and checkpoint engine",
    },
    ToolSpec {
        name: "tmux",
        binaries: &["tmux"],
        description: "terminal multiplexer",
    },
    ToolSpec {
        name: "git",
        binaries: &["git"],
        description: "version control",
    },
    ToolSpec {
        name: "cm",
        binaries: &["cm"],
        description: "memory daemon and context retrieval",
    },
    ToolSpec {
        name: "beads",
        binaries: &["br", "bd"],
        description: "bead issue tracker",
    },
    ToolSpec {
        name: "cass",
        binaries: &["cass"],
        description: "coding agent session search",
    },
    ToolSpec {
        name: "caam",
        binaries: &["caam"],
        description: "coding agent account manager",
    },
    ToolSpec {
        name: "ubs",
        binaries: &["ubs"],
        description: "bug scanner",
    },
];

#[derive(Clone, Debug, Serialize)]
pub struct ToolStatus {
    pub name: &'static str,
    pub description: &'static str,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// PATH lookup results for the external CLIs, computed once and refreshed on
/// demand.
pub struct ToolRegistry {
    search_path: Option<OsString>,
    entries: RwLock<BTreeMap<&'static str, ToolStatus>>,
    runner: Arc<dyn CommandRunner>,
}

impl ToolRegistry {
    pub fn detect(search_path: Option<OsString>, runner: Arc<dyn CommandRunner>) -> Self {
        let registry = Self {
            search_path,
            entries: RwLock::new(BTreeMap::new()),
            runner,
        };
        registry.refresh();
        registry
    }

    pub fn refresh(&self) -> Vec<ToolStatus> {
        let detected: BTreeMap<_, _> = KNOWN_TOOLS
            .iter()
            .map(|spec| (spec.name, self.detect_one(spec)))
            .collect();
        let installed = detected.values().filter(|status| status.installed).count();
        info!(installed, known = KNOWN_TOOLS.len(), "located external tools");
        let report = detected.values().cloned().collect();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = detected;
        report
    }

    fn detect_one(&self, spec: &ToolSpec) -> ToolStatus {
        let found = spec.binaries.iter().find_map(|binary| {
            let result = match &self.search_path {
                Some(paths) => {
                    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
                    which::which_in(binary, Some(paths), cwd)
                }
                None => which::which(binary),
            };
            result.ok().map(|path| (*binary, path))
        });
        debug!(tool = spec.name, found = found.is_some(), "tool lookup");
        ToolStatus {
            name: spec.name,
            description: spec.description,
            installed: found.is_some(),
            binary: found.as_ref().map(|(binary, _)| *binary),
            path: found.map(|(_, path)| path),
        }
    }

    pub fn report(&self) -> Vec<ToolStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, AdapterError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(|status| status.path.clone())
            .ok_or_else(|| AdapterError::DependencyMissing(name.to_string()))
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Runs `tool args…` and decodes its JSON stdout.
    pub async fn run_json<I, S>(&self, tool: &str, args: I, timeout: Duration) -> Result<Value, AdapterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = self.resolve(tool)?;
        let spec = ProcessSpec::new(program).args(args).timeout(timeout);
        run_json(self.runner.as_ref(), &spec, tool).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::os::unix::fs::PermissionsExt;

    fn fake_binary(dir: &std::path::Path, name: &str) {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\necho '{}'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn empty_path_reports_everything_missing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::detect(
            Some(dir.path().as_os_str().to_owned()),
            Arc::new(ScriptedRunner::default()),
        );
        assert!(registry.report().iter().all(|status| !status.installed));
        let err = registry
            .run_json("caam", ["list", "--json"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::DependencyMissing("caam".into()));
    }

    #[tokio::test]
    async fn refresh_picks_up_new_binaries_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let registry = ToolRegistry::detect(Some(dir.path().as_os_str().to_owned()), runner.clone());
        assert!(!registry.is_installed("beads"));

        fake_binary(dir.path(), "bd");
        registry.refresh();
        assert_eq!(registry.resolve("beads").unwrap(), dir.path().join("bd"));

        runner.push_stdout(0, r#"[{"id":"bd-1"}]"#);
        let value = registry
            .run_json("beads", ["list", "--json"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value[0]["id"], "bd-1");
        assert_eq!(runner.calls()[0].program, dir.path().join("bd"));
    }
}
