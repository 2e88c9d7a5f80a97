use super::{PolicyStore, SafetyError};
use crate::adapters::fs::{file_sha256, sha256_hex, write_atomic};
use crate::domain::policy::PolicyStats;
use crate::paths::PathResolver;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const GIT_WRAPPER: &str = include_str!("../../../resources/wrappers/git");
const RM_WRAPPER: &str = include_str!("../../../resources/wrappers/rm");
const PRE_TOOL_HOOK: &str = include_str!("../../../resources/hooks/ntm-safety.sh");
const SCRIPT_MODE: u32 = 0o755;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub mode: u32,
    pub sha256: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub installed_at: Option<DateTime<Utc>>,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InstallReport {
    pub installed: Vec<PathBuf>,
    pub policy_created: bool,
    pub manifest: PathBuf,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UninstallReport {
    pub removed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub present: bool,
    pub managed: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SafetyStatus {
    pub installed: bool,
    pub files: Vec<FileStatus>,
    pub policy_path: PathBuf,
    pub policy_exists: bool,
    pub policy: PolicyStats,
}

/// Installs the git/rm wrappers and the PreToolUse hook, tracking each
/// written file in a manifest so uninstall only removes untouched copies.
pub struct SafetyInstaller {
    paths: Arc<dyn PathResolver>,
    policy: Arc<PolicyStore>,
}

impl SafetyInstaller {
    pub fn new(paths: Arc<dyn PathResolver>, policy: Arc<PolicyStore>) -> Self {
        Self { paths, policy }
    }

    fn artifacts(&self) -> [(PathBuf, &'static str); 3] {
        let bin = self.paths.wrapper_dir();
        [
            (bin.join("git"), GIT_WRAPPER),
            (bin.join("rm"), RM_WRAPPER),
            (self.paths.hook_file(), PRE_TOOL_HOOK),
        ]
    }

    pub async fn install(&self, force: bool) -> Result<InstallReport, SafetyError> {
        let artifacts = self.artifacts();
        if !force {
            let mut existing = Vec::new();
            for (path, _) in &artifacts {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    existing.push(path.clone());
                }
            }
            if !existing.is_empty() {
                return Err(SafetyError::Conflict(existing));
            }
        }

        let mut manifest = InstallManifest {
            installed_at: Some(Utc::now()),
            entries: Vec::with_capacity(artifacts.len()),
        };
        for (path, content) in &artifacts {
            write_atomic(path, content.as_bytes(), Some(SCRIPT_MODE)).await?;
            manifest.entries.push(ManifestEntry {
                path: path.clone(),
                mode: SCRIPT_MODE,
                sha256: sha256_hex(content.as_bytes()),
            });
        }
        let policy_created = self.policy.ensure_default().await?;
        self.write_manifest(&manifest).await?;

        let installed: Vec<PathBuf> = manifest.entries.into_iter().map(|e| e.path).collect();
        info!(files = installed.len(), policy_created, force, "safety wrappers installed");
        Ok(InstallReport {
            installed,
            policy_created,
            manifest: self.paths.install_manifest(),
        })
    }

    pub async fn uninstall(&self) -> Result<UninstallReport, SafetyError> {
        let manifest = self.read_manifest().await?;
        let mut report = UninstallReport::default();
        for entry in &manifest.entries {
            match file_sha256(&entry.path).await? {
                None => {}
                Some(hash) if hash == entry.sha256 => {
                    tokio::fs::remove_file(&entry.path)
                        .await
                        .with_context(|| format!("removing {}", entry.path.display()))?;
                    report.removed.push(entry.path.clone());
                }
                Some(_) => {
                    warn!(path = %entry.path.display(), "keeping user-modified file");
                    report.skipped.push(entry.path.clone());
                }
            }
        }

        let remaining: Vec<ManifestEntry> = manifest
            .entries
            .into_iter()
            .filter(|entry| report.skipped.contains(&entry.path))
            .collect();
        let manifest_path = self.paths.install_manifest();
        if remaining.is_empty() {
            match tokio::fs::remove_file(&manifest_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("removing {}", manifest_path.display()))
                        .into())
                }
            }
        } else {
            self.write_manifest(&InstallManifest {
                installed_at: manifest.installed_at,
                entries: remaining,
            })
            .await?;
        }
        info!(
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "safety wrappers uninstalled"
        );
        Ok(report)
    }

    pub async fn status(&self) -> Result<SafetyStatus, SafetyError> {
        let manifest = self.read_manifest().await?;
        let mut files = Vec::new();
        for (path, _) in self.artifacts() {
            let hash = file_sha256(&path).await?;
            let managed = match (&hash, manifest.entries.iter().find(|e| e.path == path)) {
                (Some(hash), Some(entry)) => *hash == entry.sha256,
                _ => false,
            };
            files.push(FileStatus {
                present: hash.is_some(),
                managed,
                path,
            });
        }
        let policy_path = self.policy.path();
        Ok(SafetyStatus {
            installed: files.iter().all(|file| file.present),
            files,
            policy_exists: tokio::fs::try_exists(&policy_path).await.unwrap_or(false),
            policy_path,
            policy: self.policy.current().policy().stats(),
        })
    }

    async fn read_manifest(&self) -> Result<InstallManifest, SafetyError> {
        let path = self.paths.install_manifest();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(InstallManifest::default()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading {}", path.display()))
                .into()),
        }
    }

    async fn write_manifest(&self, manifest: &InstallManifest) -> Result<(), SafetyError> {
        let bytes = serde_json::to_vec_pretty(manifest).context("encoding install manifest")?;
        write_atomic(&self.paths.install_manifest(), &bytes, Some(0o644)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::HomePaths;

    fn installer(home: &std::path::Path) -> (SafetyInstaller, Arc<dyn PathResolver>) {
        let paths: Arc<dyn PathResolver> = Arc::new(HomePaths::new(home));
        let policy = Arc::new(PolicyStore::new(paths.clone()).unwrap());
        (SafetyInstaller::new(paths.clone(), policy), paths)
    }

    #[tokio::test]
    async fn install_writes_scripts_policy_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, paths) = installer(dir.path());
        let report = installer.install(false).await.unwrap();
        assert_eq!(report.installed.len(), 3);
        assert!(report.policy_created);
        assert!(paths.policy_file().exists());

        let git = std::fs::read_to_string(paths.wrapper_dir().join("git")).unwrap();
        assert!(git.starts_with("#!/bin/sh"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(paths.hook_file()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let status = installer.status().await.unwrap();
        assert!(status.installed);
        assert!(status.files.iter().all(|file| file.managed));
        assert!(status.policy_exists);
    }

    #[tokio::test]
    async fn existing_files_conflict_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, paths) = installer(dir.path());
        let hook = paths.hook_file();
        std::fs::create_dir_all(hook.parent().unwrap()).unwrap();
        std::fs::write(&hook, "#!/bin/sh\n# mine\n").unwrap();

        let err = installer.install(false).await.unwrap_err();
        match err {
            SafetyError::Conflict(paths) => assert_eq!(paths, vec![hook.clone()]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!paths.wrapper_dir().join("git").exists());
        assert!(!paths.policy_file().exists());

        installer.install(true).await.unwrap();
        assert_eq!(std::fs::read_to_string(&hook).unwrap(), PRE_TOOL_HOOK);
    }

    #[tokio::test]
    async fn uninstall_keeps_user_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, paths) = installer(dir.path());
        installer.install(false).await.unwrap();
        let rm = paths.wrapper_dir().join("rm");
        std::fs::write(&rm, "#!/bin/sh\nexec /bin/rm \"$@\"\n").unwrap();

        let report = installer.uninstall().await.unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.skipped, vec![rm.clone()]);
        assert!(rm.exists());
        assert!(!paths.wrapper_dir().join("git").exists());
        assert!(paths.install_manifest().exists());

        let status = installer.status().await.unwrap();
        assert!(!status.installed);
        let rm_status = status.files.iter().find(|f| f.path == rm).unwrap();
        assert!(rm_status.present && !rm_status.managed);
    }

    #[tokio::test]
    async fn uninstall_without_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _) = installer(dir.path());
        let report = installer.uninstall().await.unwrap();
        assert!(report.removed.is_empty() && report.skipped.is_empty());
    }
}
