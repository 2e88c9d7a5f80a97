use super::AdapterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    pub commit: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub is_dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_file: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Defaults to the checkpoint directory name.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub pane_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    #[default]
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "zip")]
    Zip,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::TarGz => "tar.gz",
            ExportFormat::Zip => "zip",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::TarGz => "application/gzip",
            ExportFormat::Zip => "application/zip",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tar.gz" | "tgz" | "targz" => Ok(ExportFormat::TarGz),
            "zip" => Ok(ExportFormat::Zip),
            other => Err(format!("format must be tar.gz or zip, got '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub redact_secrets: bool,
    pub rewrite_paths: bool,
    pub include_scrollback: bool,
    pub include_git_patch: bool,
    pub output_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportResult {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub target_session: Option<String>,
    pub verify_checksums: bool,
    pub allow_overwrite: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub dry_run: bool,
    pub force: bool,
    pub target_session: Option<String>,
    pub skip_git: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub checked_files: usize,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn list(&self, session: &str) -> Result<Vec<CheckpointMeta>, AdapterError>;
    async fn get(&self, session: &str, id: &str) -> Result<CheckpointMeta, AdapterError>;
    async fn exists(&self, session: &str, id: &str) -> bool;
    async fn delete(&self, session: &str, id: &str) -> Result<(), AdapterError>;
    async fn export(
        &self,
        session: &str,
        id: &str,
        options: &ExportOptions,
    ) -> Result<ExportResult, AdapterError>;
    async fn import(&self, archive: &Path, options: &ImportOptions) -> Result<Value, AdapterError>;
    async fn restore(
        &self,
        session: &str,
        id: &str,
        options: &RestoreOptions,
    ) -> Result<Value, AdapterError>;
    async fn verify(&self, session: &str, id: &str) -> Result<VerifyReport, AdapterError>;
}
