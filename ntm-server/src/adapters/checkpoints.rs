use super::cli::run_json;
use super::fs::sha256_hex;
use crate::ports::checkpoint_store::{
    CheckpointMeta, CheckpointStore, ExportOptions, ExportResult, ImportOptions, RestoreOptions,
    VerifyReport,
};
use crate::ports::command_runner::{CommandRunner, ProcessSpec};
use crate::ports::AdapterError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

const METADATA_FILE: &str = "metadata.json";
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Reads checkpoint metadata straight from disk and delegates archive work
/// (export, import, restore) to the `ntm checkpoint` CLI.
pub struct FileCheckpointStore {
    root: PathBuf,
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl FileCheckpointStore {
    pub fn new(root: PathBuf, program: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root,
            program: program.into(),
            runner,
        }
    }

    fn checkpoint_dir(&self, session: &str, id: &str) -> Result<PathBuf, AdapterError> {
        validate_segment("session", session)?;
        validate_segment("checkpoint id", id)?;
        Ok(self.root.join(session).join(id))
    }

    async fn read_meta(&self, dir: &Path, session: &str, id: &str) -> Result<CheckpointMeta, AdapterError> {
        let path = dir.join(METADATA_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::NotFound(format!(
                    "checkpoint {id} not found in session {session}"
                )))
            }
            Err(err) => {
                return Err(AdapterError::Failed(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        let mut meta: CheckpointMeta = serde_json::from_slice(&bytes).map_err(|err| {
            AdapterError::Failed(format!("corrupt checkpoint metadata {}: {err}", path.display()))
        })?;
        if meta.id.is_empty() {
            meta.id = id.to_string();
        }
        if meta.session.is_empty() {
            meta.session = session.to_string();
        }
        Ok(meta)
    }

    fn cli(&self) -> ProcessSpec {
        ProcessSpec::new(&self.program)
            .arg("checkpoint")
            .timeout(ARCHIVE_TIMEOUT)
    }
}

fn validate_segment(label: &str, value: &str) -> Result<(), AdapterError> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(AdapterError::Invalid(format!("invalid {label} '{value}'")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn list(&self, session: &str) -> Result<Vec<CheckpointMeta>, AdapterError> {
        validate_segment("session", session)?;
        let dir = self.root.join(session);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AdapterError::Failed(format!(
                    "listing {}: {err}",
                    dir.display()
                )))
            }
        };

        let mut checkpoints = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_segment("checkpoint id", &id).is_err() {
                continue;
            }
            match self.read_meta(&entry.path(), session, &id).await {
                Ok(meta) => checkpoints.push(meta),
                Err(AdapterError::NotFound(_)) => {}
                Err(err) => warn!(%err, checkpoint = %id, "skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    async fn get(&self, session: &str, id: &str) -> Result<CheckpointMeta, AdapterError> {
        let dir = self.checkpoint_dir(session, id)?;
        self.read_meta(&dir, session, id).await
    }

    async fn exists(&self, session: &str, id: &str) -> bool {
        match self.checkpoint_dir(session, id) {
            Ok(dir) => fs::metadata(dir.join(METADATA_FILE)).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn delete(&self, session: &str, id: &str) -> Result<(), AdapterError> {
        let dir = self.checkpoint_dir(session, id)?;
        if !self.exists(session, id).await {
            return Err(AdapterError::NotFound(format!(
                "checkpoint {id} not found in session {session}"
            )));
        }
        fs::remove_dir_all(&dir)
            .await
            .map_err(|err| AdapterError::Failed(format!("deleting {}: {err}", dir.display())))
    }

    async fn export(
        &self,
        session: &str,
        id: &str,
        options: &ExportOptions,
    ) -> Result<ExportResult, AdapterError> {
        if !self.exists(session, id).await {
            return Err(AdapterError::NotFound(format!(
                "checkpoint {id} not found in session {session}"
            )));
        }
        fs::create_dir_all(&options.output_dir)
            .await
            .map_err(|err| AdapterError::Failed(format!("creating export dir: {err}")))?;
        let output = options
            .output_dir
            .join(format!("{session}-{id}.{}", options.format.as_str()));

        let mut spec = self
            .cli()
            .args(["export", session, id, "--json", "--format", options.format.as_str()])
            .arg("--output")
            .arg(output.display().to_string());
        if options.redact_secrets {
            spec = spec.arg("--redact-secrets");
        }
        if options.rewrite_paths {
            spec = spec.arg("--rewrite-paths");
        }
        if !options.include_scrollback {
            spec = spec.arg("--no-scrollback");
        }
        if !options.include_git_patch {
            spec = spec.arg("--no-git-patch");
        }
        let details = run_json(self.runner.as_ref(), &spec, "ntm").await?;

        let size_bytes = fs::metadata(&output)
            .await
            .map(|meta| meta.len())
            .map_err(|err| {
                AdapterError::Failed(format!("export produced no archive at {}: {err}", output.display()))
            })?;
        Ok(ExportResult {
            path: output,
            format: options.format,
            size_bytes,
            details: Some(details),
        })
    }

    async fn import(&self, archive: &Path, options: &ImportOptions) -> Result<Value, AdapterError> {
        let mut spec = self
            .cli()
            .arg("import")
            .arg(archive.display().to_string())
            .arg("--json");
        if let Some(target) = &options.target_session {
            validate_segment("target session", target)?;
            spec = spec.arg("--target-session").arg(target.clone());
        }
        if options.verify_checksums {
            spec = spec.arg("--verify");
        }
        if options.allow_overwrite {
            spec = spec.arg("--force");
        }
        run_json(self.runner.as_ref(), &spec, "ntm").await
    }

    async fn restore(
        &self,
        session: &str,
        id: &str,
        options: &RestoreOptions,
    ) -> Result<Value, AdapterError> {
        if !self.exists(session, id).await {
            return Err(AdapterError::NotFound(format!(
                "checkpoint {id} not found in session {session}"
            )));
        }
        let mut spec = self.cli().args(["restore", session, id, "--json"]);
        if options.dry_run {
            spec = spec.arg("--dry-run");
        }
        if options.force {
            spec = spec.arg("--force");
        }
        if options.skip_git {
            spec = spec.arg("--no-git");
        }
        if let Some(target) = &options.target_session {
            validate_segment("target session", target)?;
            spec = spec.arg("--target").arg(target.clone());
        }
        run_json(self.runner.as_ref(), &spec, "ntm").await
    }

    async fn verify(&self, session: &str, id: &str) -> Result<VerifyReport, AdapterError> {
        let dir = self.checkpoint_dir(session, id)?;
        let meta = self.read_meta(&dir, session, id).await?;
        let mut report = VerifyReport::default();

        if let Some(patch) = meta.git.as_ref().and_then(|git| git.patch_file.as_ref()) {
            report.checked_files += 1;
            if fs::metadata(dir.join(patch)).await.is_err() {
                report.errors.push(format!("git patch {patch} is missing"));
            }
        }
        for (file, expected) in &meta.checksums {
            report.checked_files += 1;
            if validate_relative(file).is_err() {
                report.errors.push(format!("{file}: path escapes checkpoint directory"));
                continue;
            }
            match fs::read(dir.join(file)).await {
                Ok(bytes) => {
                    let actual = sha256_hex(&bytes);
                    if !actual.eq_ignore_ascii_case(expected) {
                        report.errors.push(format!("{file}: checksum mismatch"));
                    }
                }
                Err(_) => report.errors.push(format!("{file}: missing")),
            }
        }
        report.valid = report.errors.is_empty();
        Ok(report)
    }
}

fn validate_relative(file: &str) -> Result<(), ()> {
    let path = Path::new(file);
    if path.is_absolute()
        || path
            .components()
            .any(|part| matches!(part, std::path::Component::ParentDir))
    {
        Err(())
    } else {
        Ok(())
    }
}
