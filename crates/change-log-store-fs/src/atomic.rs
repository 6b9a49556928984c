use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

pub(crate) const TMP_EXTENSION: &str = "tmp";

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map_or_else(|| "change-log".into(), |name| name.to_string_lossy().into_owned());
    path.with_file_name(format!("{file_name}.{}.{TMP_EXTENSION}", Ulid::new()))
}

/// Writes `bytes` to a sibling temp file, fsyncs it, then renames it over
/// `path`. Readers see either the old file or the new one, never a mix.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let temp = temp_path_for(path);
    let written = async {
        let mut file = tokio::fs::File::create(&temp)
            .await
            .with_context(|| format!("failed to create temp file {}", temp.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("failed to write temp file {}", temp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to sync temp file {}", temp.display()))?;
        tokio::fs::rename(&temp, path).await.with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp.display(),
                path.display()
            )
        })
    }
    .await;

    if written.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    written
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode JSON for {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// Moves a file, falling back to copy + remove when a rename crosses devices.
pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    tokio::fs::remove_file(from)
        .await
        .with_context(|| format!("failed to remove {}", from.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = std::env::temp_dir().join(format!("change-log-atomic-{}", Ulid::new()));
        let path = dir.join("nested").join("file.json");

        must(write_atomic(&path, b"first").await);
        must(write_atomic(&path, b"second").await);

        let content = must(tokio::fs::read(&path).await.map_err(anyhow::Error::from));
        assert_eq!(content, b"second");

        let mut entries = must(
            tokio::fs::read_dir(dir.join("nested"))
                .await
                .map_err(anyhow::Error::from),
        );
        let mut names = Vec::new();
        while let Some(entry) = must(entries.next_entry().await.map_err(anyhow::Error::from)) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["file.json".to_string()]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
