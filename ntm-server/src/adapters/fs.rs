use anyhow::Context;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TMP_SUFFIX: &str = "tmp";

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    path.with_file_name(format!(".{name}.{}.{TMP_SUFFIX}", std::process::id()))
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating temp file {}", tmp.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", tmp.display()))?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("setting mode on {}", tmp.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming temp file to {}", path.display()))?;
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of a file on disk, `None` when it does not exist.
pub async fn file_sha256(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_replaces_content_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/bin/git");
        write_atomic(&path, b"one", Some(0o755)).await.unwrap();
        write_atomic(&path, b"two", Some(0o755)).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn hash_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_sha256(&dir.path().join("absent")).await.unwrap(), None);
        let path = dir.path().join("present");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).await.unwrap().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
