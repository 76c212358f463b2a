//! File system view: file groups and file slices of a table.
//!
//! Data files live directly under partition directories and are tied to the
//! timeline through their names (see [`naming`]). The view groups them into
//! [`FileGroup`]s and [`FileSlice`]s and hides files the timeline does not
//! vouch for:
//!
//! - a base file is visible only when the instant that wrote it is a
//!   completed commit, delta commit or compaction;
//! - a log file is visible when its slice's base instant is visible, or is
//!   a pending compaction (new log files are written on top of the slice a
//!   scheduled compaction will produce);
//! - every file group under a pending compaction gets an (initially empty)
//!   slice at the compaction instant.
//!
//! Cleaner, compaction, savepoint and rollback resolve physical paths
//! through the [`FileSystemView`] trait; [`TableFileSystemView`] is the
//! listing-backed implementation.

use std::collections::{BTreeMap, BTreeSet};

use snafu::prelude::*;

use crate::metadata::{CompactionOperation, CompactionPlan, MetadataError};
use crate::storage::{self, StorageError, StorageResult, TableLocation, layout};
use crate::timeline::{ActiveTimeline, InstantTime, TimelineError};

mod bootstrap;
mod model;
pub mod naming;

pub use bootstrap::{BootstrapIndex, BootstrapSource};
pub use model::{BaseFile, FileGroup, FileSlice, LogFile};
pub(crate) use model::rel_path_string;

/// Errors raised while building a file system view.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FsViewError {
    /// Listing partitions failed.
    #[snafu(display("Failed to list table files: {source}"))]
    Listing {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Reading a pending compaction plan failed.
    #[snafu(display("Failed to read pending compaction {instant}: {source}"))]
    CompactionPlanRead {
        /// The compaction instant.
        instant: String,
        /// Underlying timeline error.
        #[snafu(backtrace)]
        source: TimelineError,
    },

    /// Reading or writing the bootstrap index failed.
    #[snafu(display("Bootstrap index storage error: {source}"))]
    BootstrapIndexStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The bootstrap index could not be encoded or decoded.
    #[snafu(display("Failed to {op} the bootstrap index: {source}"))]
    BootstrapIndexJson {
        /// `"encode"` or `"decode"`.
        op: &'static str,
        /// Underlying serde_json error.
        source: serde_json::Error,
        /// The backtrace captured when the error occurred.
        backtrace: snafu::Backtrace,
    },

    /// Decoding a pending compaction plan failed.
    #[snafu(display("Invalid compaction plan at {instant}: {source}"))]
    CompactionPlanDecode {
        /// The compaction instant.
        instant: String,
        /// Underlying metadata error.
        #[snafu(backtrace)]
        source: MetadataError,
    },
}

/// Result alias for view construction.
pub type FsViewResult<T> = Result<T, FsViewError>;

/// Read access to the file groups of a table.
pub trait FileSystemView: Send + Sync {
    /// Partitions holding at least one visible file group, sorted.
    fn partition_paths(&self) -> Vec<String>;

    /// File groups of a partition, sorted by file id.
    fn file_groups(&self, partition_path: &str) -> Vec<FileGroup>;

    /// Pending compaction operations keyed by the compaction instant.
    fn pending_compaction_operations(&self) -> Vec<(InstantTime, CompactionOperation)>;

    /// Latest slice of every file group of a partition.
    fn latest_file_slices(&self, partition_path: &str) -> Vec<FileSlice> {
        self.file_groups(partition_path)
            .iter()
            .filter_map(|g| g.latest_slice().cloned())
            .collect()
    }

    /// Latest slice of one file group.
    fn latest_file_slice(&self, partition_path: &str, file_id: &str) -> Option<FileSlice> {
        self.file_groups(partition_path)
            .into_iter()
            .find(|g| g.file_id == file_id)
            .and_then(|g| g.latest_slice().cloned())
    }

    /// Base file of the newest slice that has one, per file group.
    fn latest_base_files(&self, partition_path: &str) -> Vec<BaseFile> {
        self.file_groups(partition_path)
            .iter()
            .filter_map(|g| g.slices_newest_first().find_map(|s| s.base_file.clone()))
            .collect()
    }

    /// Like [`FileSystemView::latest_base_files`], ignoring slices based
    /// after `max_instant`.
    fn latest_base_files_before_or_on(
        &self,
        partition_path: &str,
        max_instant: &InstantTime,
    ) -> Vec<BaseFile> {
        self.file_groups(partition_path)
            .iter()
            .filter_map(|g| {
                g.slices_newest_first()
                    .filter(|s| s.base_instant_time <= *max_instant)
                    .find_map(|s| s.base_file.clone())
            })
            .collect()
    }
}

/// Data files found in one partition directory, before any visibility
/// filtering.
#[derive(Debug, Clone, Default)]
pub(crate) struct PartitionListing {
    pub(crate) base_files: Vec<BaseFile>,
    pub(crate) log_files: Vec<LogFile>,
}

/// Every directory under the table root that directly holds data files,
/// sorted. The table root itself is reported as `""`.
pub(crate) async fn list_partition_paths(location: &TableLocation) -> StorageResult<Vec<String>> {
    let mut partitions = BTreeSet::new();
    let mut pending = vec![String::new()];

    while let Some(partition) = pending.pop() {
        let entries =
            storage::list_dir_or_empty(location.storage(), &layout::partition_rel_dir(&partition))
                .await?;
        for entry in entries {
            if layout::is_reserved_name(&entry.name) {
                continue;
            }
            if entry.is_dir {
                pending.push(if partition.is_empty() {
                    entry.name
                } else {
                    format!("{partition}/{}", entry.name)
                });
            } else if naming::parse_base_file_name(&entry.name).is_some()
                || naming::parse_log_file_name(&entry.name).is_some()
            {
                partitions.insert(partition.clone());
            }
        }
    }
    Ok(partitions.into_iter().collect())
}

/// Parse the data files of one partition directory.
pub(crate) async fn list_partition_files(
    location: &TableLocation,
    partition_path: &str,
) -> StorageResult<PartitionListing> {
    let entries =
        storage::list_dir_or_empty(location.storage(), &layout::partition_rel_dir(partition_path))
            .await?;

    let mut listing = PartitionListing::default();
    for entry in entries.into_iter().filter(|e| !e.is_dir) {
        if let Some(parsed) = naming::parse_base_file_name(&entry.name) {
            listing.base_files.push(BaseFile {
                partition_path: partition_path.to_string(),
                file_id: parsed.file_id,
                instant_time: parsed.instant_time,
                file_name: entry.name,
                size: entry.len,
                bootstrap_source: None,
            });
        } else if let Some(parsed) = naming::parse_log_file_name(&entry.name) {
            listing.log_files.push(LogFile {
                partition_path: partition_path.to_string(),
                file_id: parsed.file_id,
                base_instant_time: parsed.base_instant_time,
                version: parsed.version,
                file_name: entry.name,
                size: entry.len,
            });
        }
    }
    Ok(listing)
}

/// Listing-backed [`FileSystemView`] built from one timeline snapshot.
#[derive(Debug, Clone, Default)]
pub struct TableFileSystemView {
    partitions: BTreeMap<String, BTreeMap<String, FileGroup>>,
    pending_compactions: BTreeMap<(String, String), (InstantTime, CompactionOperation)>,
}

impl TableFileSystemView {
    /// List the table and build the view visible at the snapshot held by
    /// `active`.
    pub async fn load(active: &ActiveTimeline) -> FsViewResult<Self> {
        let location = active.location();
        let timeline = active.timeline();

        let completed: BTreeSet<InstantTime> = timeline
            .completed_commits_timeline()
            .instants()
            .map(|i| i.timestamp.clone())
            .collect();

        let mut pending_compactions = BTreeMap::new();
        for instant in timeline.pending_compaction_timeline().instants() {
            let bytes = active
                .read_details(instant)
                .await
                .context(CompactionPlanReadSnafu {
                    instant: instant.to_string(),
                })?;
            let plan = CompactionPlan::from_bytes(&bytes).context(CompactionPlanDecodeSnafu {
                instant: instant.to_string(),
            })?;
            for op in plan.operations {
                pending_compactions.insert(
                    (op.partition_path.clone(), op.file_id.clone()),
                    (instant.timestamp.clone(), op),
                );
            }
        }
        let pending_compaction_times: BTreeSet<InstantTime> = pending_compactions
            .values()
            .map(|(ts, _)| ts.clone())
            .chain(
                timeline
                    .pending_compaction_timeline()
                    .instants()
                    .map(|i| i.timestamp.clone()),
            )
            .collect();

        let bootstrap = BootstrapIndex::load(location).await?;

        let mut partitions: BTreeMap<String, BTreeMap<String, FileGroup>> = BTreeMap::new();
        for partition in list_partition_paths(location).await.context(ListingSnafu)? {
            let listing = list_partition_files(location, &partition)
                .await
                .context(ListingSnafu)?;
            let groups = partitions.entry(partition.clone()).or_default();

            for mut base in listing.base_files {
                if !completed.contains(&base.instant_time) {
                    continue;
                }
                base.bootstrap_source = bootstrap.source_of(&base).map(str::to_string);
                let group = groups
                    .entry(base.file_id.clone())
                    .or_insert_with(|| FileGroup::new(partition.clone(), base.file_id.clone()));
                let slice = group.slice_mut(&base.instant_time);
                // Two attempts of the same task can leave two base files for
                // one slice; the commit deletes the loser, keep the first.
                if slice.base_file.is_none() {
                    slice.base_file = Some(base);
                }
            }

            for log in listing.log_files {
                if !completed.contains(&log.base_instant_time)
                    && !pending_compaction_times.contains(&log.base_instant_time)
                {
                    continue;
                }
                let group = groups
                    .entry(log.file_id.clone())
                    .or_insert_with(|| FileGroup::new(partition.clone(), log.file_id.clone()));
                let base_instant = log.base_instant_time.clone();
                group.slice_mut(&base_instant).add_log_file(log);
            }
        }

        for ((partition, file_id), (ts, _)) in &pending_compactions {
            partitions
                .entry(partition.clone())
                .or_default()
                .entry(file_id.clone())
                .or_insert_with(|| FileGroup::new(partition.clone(), file_id.clone()))
                .slice_mut(ts);
        }
        partitions.retain(|_, groups| !groups.is_empty());

        Ok(TableFileSystemView {
            partitions,
            pending_compactions,
        })
    }

    /// The pending compaction covering a file group, if any.
    pub fn pending_compaction_for(
        &self,
        partition_path: &str,
        file_id: &str,
    ) -> Option<&(InstantTime, CompactionOperation)> {
        self.pending_compactions
            .get(&(partition_path.to_string(), file_id.to_string()))
    }
}

impl FileSystemView for TableFileSystemView {
    fn partition_paths(&self) -> Vec<String> {
        self.partitions.keys().cloned().collect()
    }

    fn file_groups(&self, partition_path: &str) -> Vec<FileGroup> {
        self.partitions
            .get(partition_path)
            .map(|groups| groups.values().cloned().collect())
            .unwrap_or_default()
    }

    fn pending_compaction_operations(&self) -> Vec<(InstantTime, CompactionOperation)> {
        self.pending_compactions.values().cloned().collect()
    }

    fn latest_file_slice(&self, partition_path: &str, file_id: &str) -> Option<FileSlice> {
        self.partitions
            .get(partition_path)
            .and_then(|groups| groups.get(file_id))
            .and_then(|g| g.latest_slice().cloned())
    }
}
