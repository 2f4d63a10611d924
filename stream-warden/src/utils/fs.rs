//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / parent-directory checks.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Blocking variant for use before the runtime is up.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    ensure_dir_all(parent).await
}

/// Move a file into `dir`, keeping its file name.
///
/// Tries a rename first and falls back to copy + delete when the rename fails
/// (for example across filesystems). Returns the new path.
pub async fn move_into_dir(file: &Path, dir: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .ok_or_else(|| Error::validation(format!("No file name in {}", file.display())))?;
    ensure_dir_all_with_op("creating archive directory", dir).await?;
    let target = dir.join(name);

    if let Err(e) = tokio::fs::rename(file, &target).await {
        debug!(from = %file.display(), to = %target.display(), error = %e, "Rename failed, copying");
        tokio::fs::copy(file, &target)
            .await
            .map_err(|e| io_error("copying file", &target, e))?;
        tokio::fs::remove_file(file)
            .await
            .map_err(|e| io_error("removing file", file, e))?;
    }

    Ok(target)
}

/// Total size of the regular files below `dir`.
///
/// A missing directory counts as empty.
pub async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error("reading directory", &current, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("reading directory", &current, e))?
        {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Removed between listing and stat.
                Err(_) => continue,
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

/// Regular files directly inside `dir`, sorted by path.
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(io_error("reading directory", dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_parent_dir_creates_nested_directories() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a").join("b").join("c.ts");
        ensure_parent_dir(&file).await.unwrap();
        assert!(temp.path().join("a").join("b").is_dir());

        // Bare file names have no parent to create.
        ensure_parent_dir(Path::new("c.ts")).await.unwrap();
    }

    #[tokio::test]
    async fn test_move_into_dir() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("capture.ts");
        tokio::fs::write(&file, b"data").await.unwrap();

        let archive = temp.path().join("archive");
        let moved = move_into_dir(&file, &archive).await.unwrap();
        assert_eq!(moved, archive.join("capture.ts"));
        assert!(!file.exists());
        assert_eq!(tokio::fs::read(&moved).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_move_missing_file_fails_with_context() {
        let temp = TempDir::new().unwrap();
        let err = move_into_dir(&temp.path().join("gone.ts"), &temp.path().join("archive"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }));
    }

    #[tokio::test]
    async fn test_dir_size_recurses() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("a.ts"), vec![0u8; 100])
            .await
            .unwrap();
        let nested = temp.path().join("nested");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("b.ts"), vec![0u8; 50])
            .await
            .unwrap();

        assert_eq!(dir_size(temp.path()).await.unwrap(), 150);
        assert_eq!(dir_size(&temp.path().join("missing")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_files_skips_directories() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("b.ts"), b"").await.unwrap();
        tokio::fs::write(temp.path().join("a.ts"), b"").await.unwrap();
        tokio::fs::create_dir_all(temp.path().join("sub")).await.unwrap();

        let files = list_files(temp.path()).await.unwrap();
        assert_eq!(
            files,
            vec![temp.path().join("a.ts"), temp.path().join("b.ts")]
        );
    }
}
