//! Storage abstraction used by the timeline and the action executors.
//!
//! Every file the protocol touches is addressed as a path relative to a
//! table root. This module maps those relative paths onto the backend and
//! provides the small set of primitives the commit protocol is built on:
//!
//! - create-if-absent writes (instant state files, markers),
//! - write-then-rename replacement (table config),
//! - appends (rollback command blocks on log files),
//! - deletes that report whether anything was removed,
//! - directory listings (timeline loading, partition discovery, rollback
//!   and cleaner planning).
//!
//! Only the local filesystem is implemented, but nothing above this module
//! assumes it: object-store adapters would slot in as new
//! [`StorageLocation`] variants.

use snafu::{Backtrace, prelude::*};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

mod error;
pub mod layout;
mod table_location;

pub use error::{BackendError, StorageError};
pub(crate) use error::{NotFoundSnafu, OtherIoSnafu, UnsupportedLocationSnafu};
pub use table_location::TableLocation;

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Backend-level location of a storage root.
#[derive(Clone, Debug)]
pub enum StorageLocation {
    /// A root on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// Parse a location string. Plain paths and `file://` URLs are accepted.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        let trimmed = spec.trim();
        if let Some(path) = trimmed.strip_prefix("file://") {
            return Ok(StorageLocation::Local(PathBuf::from(path)));
        }
        if trimmed.is_empty() || trimmed.contains("://") {
            return UnsupportedLocationSnafu {
                spec: spec.to_string(),
            }
            .fail();
        }
        Ok(StorageLocation::Local(PathBuf::from(trimmed)))
    }
}

/// A single directory entry returned by [`list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    /// File or directory name (no parent components).
    pub name: String,
    /// True when the entry is a directory.
    pub is_dir: bool,
    /// Length in bytes (0 for directories).
    pub len: u64,
}

/// Join a storage location with a relative path into an absolute local path.
fn join_local(location: &StorageLocation, rel: &Path) -> PathBuf {
    match location {
        StorageLocation::Local(root) => root.join(rel),
    }
}

fn io_context(abs: &Path, e: io::Error) -> StorageError {
    let path = abs.display().to_string();
    let backend = BackendError::Local(e);
    match &backend {
        BackendError::Local(inner) if inner.kind() == io::ErrorKind::NotFound => {
            StorageError::NotFound {
                path,
                source: backend,
                backtrace: Backtrace::capture(),
            }
        }
        BackendError::Local(inner) if inner.kind() == io::ErrorKind::AlreadyExists => {
            StorageError::AlreadyExists {
                path,
                source: backend,
                backtrace: Backtrace::capture(),
            }
        }
        _ => StorageError::OtherIo {
            path,
            source: backend,
            backtrace: Backtrace::capture(),
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort; the caller is usually already returning another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn temp_sibling(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

async fn write_synced(abs: &Path, contents: &[u8], create_new: bool) -> StorageResult<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    let mut file = options.open(abs).await.map_err(|e| io_context(abs, e))?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;
    Ok(())
}

/// Write `contents` to `rel_path` using write-then-rename, replacing any
/// existing file.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = temp_sibling(&abs);
            let mut guard = TempFileGuard::new(tmp_path.clone());
            write_synced(&tmp_path, contents, true).await?;

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();
            Ok(())
        }
    }
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file already exists.
///
/// The file becomes visible before its contents are synced, so a reader can
/// observe a short file. Use [`write_new_atomic`] for payload-carrying files.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;
            write_synced(&abs, contents, true).await
        }
    }
}

/// Create a *new* file at `rel_path` whose full contents become visible at
/// once, failing with [`StorageError::AlreadyExists`] if the file exists.
///
/// The payload is written and synced to a temporary sibling which is then
/// hard-linked to the target name. Linking never replaces an existing file,
/// so this is an atomic create-if-absent.
pub async fn write_new_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = temp_sibling(&abs);
            // Stays armed: the temporary name is removed whether or not the
            // link succeeds.
            let _guard = TempFileGuard::new(tmp_path.clone());
            write_synced(&tmp_path, contents, true).await?;

            fs::hard_link(&tmp_path, &abs)
                .await
                .map_err(|e| io_context(&abs, e))?;
            Ok(())
        }
    }
}

/// Append `contents` to the file at `rel_path`, creating it when missing.
pub async fn append_bytes(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&abs)
                .await
                .map_err(|e| io_context(&abs, e))?;

            file.write_all(contents)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;
            file.sync_all()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;
            Ok(())
        }
    }
}

/// Read the full contents of a file at `rel_path`.
///
/// Errors:
/// - If the file does not exist this returns `StorageError::NotFound`.
/// - On any other I/O error this returns `StorageError::OtherIo`.
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            match fs::read(&abs).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str })
                }
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
            }
        }
    }
}

/// Read the file at `rel_path` and return its contents as a `String`.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            match fs::read_to_string(&abs).await {
                Ok(s) => Ok(s),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::Local(e))
                    .context(NotFoundSnafu {
                        path: abs.display().to_string(),
                    }),
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Delete the file at `rel_path`.
///
/// Returns `Ok(false)` when the file did not exist, so callers replaying a
/// plan can tell "already gone" apart from "deleted now". An absolute path
/// (a resolved bootstrap source) is used as given.
pub async fn delete_file(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::remove_file(&abs).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Recursively delete the directory at `rel_path`. Returns `Ok(false)` when
/// it did not exist.
pub async fn delete_dir_all(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::remove_dir_all(&abs).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Returns whether anything exists at `rel_path`.
pub async fn exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::try_exists(&abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })
        }
    }
}

/// List the direct children of the directory at `rel_path`, sorted by name.
///
/// A missing directory yields `StorageError::NotFound`.
pub async fn list_dir(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<Vec<StorageEntry>> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let mut read_dir = fs::read_dir(&abs).await.map_err(|e| io_context(&abs, e))?;

            let mut entries = Vec::new();
            loop {
                let next = read_dir
                    .next_entry()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: abs.display().to_string(),
                    })?;
                let Some(entry) = next else { break };

                let meta = entry
                    .metadata()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: entry.path().display().to_string(),
                    })?;
                entries.push(StorageEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir: meta.is_dir(),
                    len: if meta.is_dir() { 0 } else { meta.len() },
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        }
    }
}

/// Like [`list_dir`], but a missing directory yields an empty listing.
pub async fn list_dir_or_empty(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<Vec<StorageEntry>> {
    match list_dir(location, rel_path).await {
        Ok(entries) => Ok(entries),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Recursively list every file below `rel_path`.
///
/// Returned paths are relative to `rel_path` and sorted. A missing directory
/// yields an empty listing.
pub async fn list_files_recursive(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(dir) = pending.pop() {
        for entry in list_dir_or_empty(location, &rel_path.join(&dir)).await? {
            let child = dir.join(&entry.name);
            if entry.is_dir {
                pending.push(child);
            } else {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn local(tmp: &TempDir) -> StorageLocation {
        StorageLocation::Local(tmp.path().to_path_buf())
    }

    #[tokio::test]
    async fn write_atomic_overwrites_and_leaves_no_tmp() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);
        let rel = Path::new("nested/config.json");

        write_atomic(&location, rel, b"original").await?;
        write_atomic(&location, rel, b"updated").await?;

        assert_eq!(read_to_string(&location, rel).await?, "updated");
        let names: Vec<_> = list_dir(&location, Path::new("nested"))
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["config.json".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn write_new_fails_if_file_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);
        let rel = Path::new("existing.txt");

        write_new(&location, rel, b"first").await?;
        let err = write_new(&location, rel, b"second")
            .await
            .expect_err("expected AlreadyExists error");
        assert!(err.is_already_exists());
        assert_eq!(read_to_string(&location, rel).await?, "first");
        Ok(())
    }

    #[tokio::test]
    async fn write_new_atomic_is_create_if_absent() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);
        let rel = Path::new(".lakeline/001.commit");

        write_new_atomic(&location, rel, b"{\"a\":1}").await?;
        let err = write_new_atomic(&location, rel, b"{}")
            .await
            .expect_err("second create must fail");
        assert!(err.is_already_exists());
        assert_eq!(read_all_bytes(&location, rel).await?, b"{\"a\":1}");

        // No temporary siblings remain in either case.
        let entries = list_dir(&location, Path::new(".lakeline")).await?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn append_bytes_extends_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);
        let rel = Path::new("p/.f1_001.log.1_0-0-0");

        append_bytes(&location, rel, b"a\n").await?;
        append_bytes(&location, rel, b"b\n").await?;
        assert_eq!(read_to_string(&location, rel).await?, "a\nb\n");
        Ok(())
    }

    #[tokio::test]
    async fn delete_file_reports_missing_files() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);
        let rel = Path::new("gone.txt");

        write_new(&location, rel, b"x").await?;
        assert!(delete_file(&location, rel).await?);
        assert!(!delete_file(&location, rel).await?);
        assert!(!exists(&location, rel).await?);
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);

        let err = read_all_bytes(&location, Path::new("missing"))
            .await
            .expect_err("expected NotFound");
        assert!(matches!(err, StorageError::NotFound { .. }));

        let err = list_dir(&location, Path::new("missing-dir"))
            .await
            .expect_err("expected NotFound");
        assert!(err.is_not_found());
        assert!(list_dir_or_empty(&location, Path::new("missing-dir")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn list_files_recursive_returns_relative_sorted_paths() -> TestResult {
        let tmp = TempDir::new()?;
        let location = local(&tmp);

        write_new(&location, Path::new("m/b/2.marker"), b"").await?;
        write_new(&location, Path::new("m/a/1.marker"), b"").await?;
        write_new(&location, Path::new("m/0.marker"), b"").await?;

        let files = list_files_recursive(&location, Path::new("m")).await?;
        assert_eq!(
            files,
            vec![
                PathBuf::from("0.marker"),
                PathBuf::from("a/1.marker"),
                PathBuf::from("b/2.marker"),
            ]
        );
        assert!(delete_dir_all(&location, Path::new("m")).await?);
        assert!(
            list_files_recursive(&location, Path::new("m"))
                .await?
                .is_empty()
        );
        Ok(())
    }
}
