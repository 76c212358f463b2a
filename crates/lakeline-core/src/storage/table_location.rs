use std::path::{Path, PathBuf};

use crate::storage::{StorageLocation, StorageResult};

/// Table root location with table-scoped semantics.
///
/// This wraps [`StorageLocation`] and is what the timeline, markers, file
/// system view and action executors carry around. All paths handed to the
/// storage helpers together with a `TableLocation` are relative to the table
/// root.
#[derive(Debug, Clone)]
pub struct TableLocation(StorageLocation);

impl From<TableLocation> for StorageLocation {
    fn from(t: TableLocation) -> Self {
        t.0
    }
}

impl AsRef<StorageLocation> for TableLocation {
    fn as_ref(&self) -> &StorageLocation {
        &self.0
    }
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation(StorageLocation::Local(root.into()))
    }

    /// Parse a user-facing table location string into a TableLocation.
    /// Only local filesystem paths are supported.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        StorageLocation::parse(spec).map(TableLocation)
    }

    /// Return the underlying StorageLocation.
    pub fn storage(&self) -> &StorageLocation {
        &self.0
    }

    /// Resolve a table-relative path into a path usable by the backend.
    ///
    /// Cleaner plans record bootstrap base files by this resolved path.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        match &self.0 {
            StorageLocation::Local(root) => root.join(rel),
        }
    }
}
