pub mod installer;
pub mod policy_store;

pub use installer::{InstallReport, SafetyInstaller, SafetyStatus, UninstallReport};
pub use policy_store::{BlockedEntry, PolicyStore, PolicyView};

use crate::domain::policy::{PolicyError, ValidationReport};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("policy is invalid: {}", .0.errors.join("; "))]
    InvalidPolicy(ValidationReport),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("{} already exist; pass force to overwrite", display_paths(.0))]
    Conflict(Vec<PathBuf>),
    #[error("{0}")]
    Io(#[from] anyhow::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
