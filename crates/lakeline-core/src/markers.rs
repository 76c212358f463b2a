//! Write markers.
//!
//! Before an engine creates or appends to a data file for an instant, it
//! drops a zero-byte marker naming that file:
//!
//! ```text
//! .lakeline/.temp/<instant>/<partition>/<data file name>.marker.<CREATE|MERGE|APPEND>
//! ```
//!
//! Markers let the commit find files produced by retried tasks that never
//! made it into a write stat, and let marker-based rollback enumerate every
//! file touched by a failed write without listing partitions. The marker
//! directory is removed once the instant commits or is rolled back.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::storage::{self, StorageResult, TableLocation, layout};
use crate::timeline::InstantTime;

const MARKER_INFIX: &str = ".marker.";

/// How the data file named by a marker was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerType {
    /// A new base file.
    Create,
    /// A new version of an existing file group's base file.
    Merge,
    /// An append to a log file.
    Append,
}

impl MarkerType {
    /// Name used in marker file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerType::Create => "CREATE",
            MarkerType::Merge => "MERGE",
            MarkerType::Append => "APPEND",
        }
    }

    /// Parse a marker type suffix.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(MarkerType::Create),
            "MERGE" => Some(MarkerType::Merge),
            "APPEND" => Some(MarkerType::Append),
            _ => None,
        }
    }
}

impl fmt::Display for MarkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A marker found under an instant's marker directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkerEntry {
    /// Partition of the data file ("" for the table root).
    pub partition_path: String,
    /// Name of the data file.
    pub data_file_name: String,
    /// How the data file was written.
    pub marker_type: MarkerType,
}

impl MarkerEntry {
    /// Table-relative path of the data file.
    pub fn data_file_rel_path(&self) -> PathBuf {
        layout::data_file_rel_path(&self.partition_path, &self.data_file_name)
    }

    /// Parse a marker path relative to the marker directory.
    fn parse(rel: &Path) -> Option<Self> {
        let file_name = rel.file_name()?.to_str()?;
        let (data_file_name, suffix) = file_name.rsplit_once(MARKER_INFIX)?;
        let marker_type = MarkerType::parse(suffix)?;
        let partition_path = rel
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        Some(MarkerEntry {
            partition_path,
            data_file_name: data_file_name.to_string(),
            marker_type,
        })
    }
}

/// Markers of one instant.
#[derive(Debug, Clone)]
pub struct WriteMarkers {
    location: TableLocation,
    instant_time: InstantTime,
}

impl WriteMarkers {
    /// Markers of `instant_time` under the table at `location`.
    pub fn new(location: TableLocation, instant_time: InstantTime) -> Self {
        WriteMarkers {
            location,
            instant_time,
        }
    }

    /// Instant the markers belong to.
    pub fn instant_time(&self) -> &InstantTime {
        &self.instant_time
    }

    /// Relative path of the marker directory.
    pub fn marker_dir(&self) -> PathBuf {
        layout::marker_rel_dir(self.instant_time.as_str())
    }

    fn marker_rel_path(
        &self,
        partition_path: &str,
        data_file_name: &str,
        marker_type: MarkerType,
    ) -> PathBuf {
        self.marker_dir()
            .join(layout::partition_rel_dir(partition_path))
            .join(format!("{data_file_name}{MARKER_INFIX}{marker_type}"))
    }

    /// Record that `data_file_name` in `partition_path` is about to be
    /// written. Recording the same marker twice is not an error: a retried
    /// task appends to the same log file.
    pub async fn create(
        &self,
        partition_path: &str,
        data_file_name: &str,
        marker_type: MarkerType,
    ) -> StorageResult<PathBuf> {
        let rel = self.marker_rel_path(partition_path, data_file_name, marker_type);
        match storage::write_new(self.location.storage(), &rel, &[]).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                log::debug!("Marker {} already exists", rel.display());
            }
            Err(e) => return Err(e),
        }
        Ok(rel)
    }

    /// Whether the marker directory exists.
    pub async fn exists(&self) -> StorageResult<bool> {
        storage::exists(self.location.storage(), &self.marker_dir()).await
    }

    /// Every marker of the instant, sorted. A missing directory lists empty.
    pub async fn all_markers(&self) -> StorageResult<Vec<MarkerEntry>> {
        let files =
            storage::list_files_recursive(self.location.storage(), &self.marker_dir()).await?;
        let mut markers: Vec<MarkerEntry> = files
            .iter()
            .filter_map(|rel| MarkerEntry::parse(rel))
            .collect();
        markers.sort();
        Ok(markers)
    }

    /// Markers for files created or merged (not appended) by the instant.
    pub async fn created_and_merged_files(&self) -> StorageResult<Vec<MarkerEntry>> {
        Ok(self
            .all_markers()
            .await?
            .into_iter()
            .filter(|m| m.marker_type != MarkerType::Append)
            .collect())
    }

    /// Remove the marker directory. Returns false if it was already gone.
    pub async fn delete_marker_dir(&self) -> StorageResult<bool> {
        let removed = storage::delete_dir_all(self.location.storage(), &self.marker_dir()).await?;
        if removed {
            log::debug!("Deleted marker directory for instant {}", self.instant_time);
        }
        Ok(removed)
    }
}
