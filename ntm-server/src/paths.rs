use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Well-known locations under the user's home directory.
pub trait PathResolver: Send + Sync {
    fn home(&self) -> &Path;

    fn ntm_dir(&self) -> PathBuf {
        self.home().join(".ntm")
    }

    fn policy_file(&self) -> PathBuf {
        self.ntm_dir().join("policy.yaml")
    }

    fn wrapper_dir(&self) -> PathBuf {
        self.ntm_dir().join("bin")
    }

    fn blocked_log(&self) -> PathBuf {
        self.ntm_dir().join("logs").join("blocked.jsonl")
    }

    fn pid_dir(&self) -> PathBuf {
        self.ntm_dir().join("pids")
    }

    fn install_manifest(&self) -> PathBuf {
        self.ntm_dir().join("install-manifest.json")
    }

    fn hook_file(&self) -> PathBuf {
        self.home()
            .join(".claude")
            .join("hooks")
            .join("PreToolUse")
            .join("ntm-safety.sh")
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.home()
            .join(".local")
            .join("share")
            .join("ntm")
            .join("checkpoints")
    }
}

#[derive(Clone, Debug)]
pub struct HomePaths {
    home: PathBuf,
}

impl HomePaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn from_env() -> Result<Self> {
        dirs::home_dir()
            .map(Self::new)
            .ok_or_else(|| anyhow!("unable to resolve home directory; set HOME"))
    }
}

impl PathResolver for HomePaths {
    fn home(&self) -> &Path {
        &self.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_home() {
        let paths = HomePaths::new("/home/dev");
        assert_eq!(paths.policy_file(), PathBuf::from("/home/dev/.ntm/policy.yaml"));
        assert_eq!(paths.wrapper_dir(), PathBuf::from("/home/dev/.ntm/bin"));
        assert_eq!(
            paths.hook_file(),
            PathBuf::from("/home/dev/.claude/hooks/PreToolUse/ntm-safety.sh")
        );
        assert_eq!(
            paths.checkpoints_dir(),
            PathBuf::from("/home/dev/.local/share/ntm/checkpoints")
        );
    }
}
