use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::{METADATA_VERSION, MetadataResult, check_version, from_binary, to_binary};
use crate::timeline::InstantTime;

/// Which file slices the cleaner keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleaningPolicy {
    /// Keep every file slice needed by the last N commits.
    #[default]
    KeepLatestCommits,
    /// Keep the N latest file slices of each file group.
    KeepLatestFileVersions,
}

/// One file scheduled for deletion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CleanFileInfo {
    /// Table-relative path, or the resolved full path for bootstrap base files.
    pub file_path: String,
    /// True for a bootstrap source file referenced by a base file.
    pub is_bootstrap_base_file: bool,
}

/// Persisted plan of a clean action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerPlan {
    /// Earliest commit whose file slices were kept (KEEP_LATEST_COMMITS only).
    pub earliest_instant_to_retain: Option<InstantTime>,
    /// Policy the plan was computed with.
    pub policy: CleaningPolicy,
    /// Files to delete, by partition. Partitions and files are sorted.
    pub files_to_delete_per_partition: BTreeMap<String, Vec<CleanFileInfo>>,
    /// Payload version.
    pub version: u32,
}

impl CleanerPlan {
    /// True if nothing is scheduled for deletion.
    pub fn is_empty(&self) -> bool {
        self.files_to_delete_per_partition
            .values()
            .all(Vec::is_empty)
    }

    /// Number of files scheduled for deletion.
    pub fn total_files(&self) -> usize {
        self.files_to_delete_per_partition.values().map(Vec::len).sum()
    }

    /// Encode for the `clean.requested` / `clean.inflight` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("cleaner plan", self)
    }

    /// Decode a `clean.requested` / `clean.inflight` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let plan: CleanerPlan = from_binary("cleaner plan", bytes)?;
        check_version("cleaner plan", plan.version)?;
        Ok(plan)
    }
}

/// Deletion outcomes of one partition, accumulated while executing a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCleanStat {
    /// Partition path.
    pub partition_path: String,
    /// Deleted file names.
    pub success_delete_files: Vec<String>,
    /// File names that could not be deleted (or were already gone).
    pub failed_delete_files: Vec<String>,
    /// Deleted bootstrap base files (full paths).
    pub success_delete_bootstrap_base_files: Vec<String>,
    /// Bootstrap base files that could not be deleted (full paths).
    pub failed_delete_bootstrap_base_files: Vec<String>,
}

impl PartitionCleanStat {
    /// Empty stat for `partition_path`.
    pub fn new(partition_path: impl Into<String>) -> Self {
        PartitionCleanStat {
            partition_path: partition_path.into(),
            ..Default::default()
        }
    }

    /// Record one deletion attempt. Bootstrap files are recorded by full
    /// path; everything else by file name.
    pub fn add_deleted_file(&mut self, path: &str, success: bool, is_bootstrap_base_file: bool) {
        let entry = if is_bootstrap_base_file {
            path.to_string()
        } else {
            path.rsplit('/').next().unwrap_or(path).to_string()
        };
        let bucket = match (is_bootstrap_base_file, success) {
            (false, true) => &mut self.success_delete_files,
            (false, false) => &mut self.failed_delete_files,
            (true, true) => &mut self.success_delete_bootstrap_base_files,
            (true, false) => &mut self.failed_delete_bootstrap_base_files,
        };
        bucket.push(entry);
    }

    /// Combine two partial stats of the same partition.
    pub fn merge(mut self, other: PartitionCleanStat) -> Self {
        self.success_delete_files.extend(other.success_delete_files);
        self.failed_delete_files.extend(other.failed_delete_files);
        self.success_delete_bootstrap_base_files
            .extend(other.success_delete_bootstrap_base_files);
        self.failed_delete_bootstrap_base_files
            .extend(other.failed_delete_bootstrap_base_files);
        self
    }
}

/// Final clean result of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStat {
    /// Policy used.
    pub policy: CleaningPolicy,
    /// Partition path.
    pub partition_path: String,
    /// Files the plan asked to delete.
    pub delete_path_patterns: Vec<String>,
    /// Deleted file names.
    pub success_delete_files: Vec<String>,
    /// File names not deleted.
    pub failed_delete_files: Vec<String>,
    /// Bootstrap base files the plan asked to delete.
    pub delete_bootstrap_base_path_patterns: Vec<String>,
    /// Deleted bootstrap base files.
    pub success_delete_bootstrap_base_files: Vec<String>,
    /// Bootstrap base files not deleted.
    pub failed_delete_bootstrap_base_files: Vec<String>,
    /// Earliest commit retained by the plan.
    pub earliest_commit_to_retain: Option<InstantTime>,
}

impl CleanStat {
    /// Assemble a partition result from the plan entries and the execution
    /// outcome. A partition the plan named but no deletion touched gets an
    /// empty outcome.
    pub fn from_plan_and_outcome(
        plan: &CleanerPlan,
        partition_path: &str,
        outcome: Option<PartitionCleanStat>,
    ) -> Self {
        let outcome = outcome.unwrap_or_else(|| PartitionCleanStat::new(partition_path));
        let (bootstrap, regular): (Vec<_>, Vec<_>) = plan
            .files_to_delete_per_partition
            .get(partition_path)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .partition(|f| f.is_bootstrap_base_file);

        CleanStat {
            policy: plan.policy,
            partition_path: partition_path.to_string(),
            delete_path_patterns: regular.iter().map(|f| f.file_path.clone()).collect(),
            success_delete_files: outcome.success_delete_files,
            failed_delete_files: outcome.failed_delete_files,
            delete_bootstrap_base_path_patterns: bootstrap
                .iter()
                .map(|f| f.file_path.clone())
                .collect(),
            success_delete_bootstrap_base_files: outcome.success_delete_bootstrap_base_files,
            failed_delete_bootstrap_base_files: outcome.failed_delete_bootstrap_base_files,
            earliest_commit_to_retain: plan.earliest_instant_to_retain.clone(),
        }
    }
}

/// Metadata of a completed clean.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanMetadata {
    /// Instant of the clean.
    pub start_clean_time: InstantTime,
    /// Wall time spent executing.
    pub time_taken_ms: i64,
    /// Files deleted across partitions.
    pub total_files_deleted: usize,
    /// Earliest commit retained.
    pub earliest_commit_to_retain: Option<InstantTime>,
    /// Per-partition results.
    pub partition_metadata: BTreeMap<String, CleanStat>,
    /// Payload version.
    pub version: u32,
}

impl CleanMetadata {
    /// Aggregate partition results.
    pub fn new(
        start_clean_time: InstantTime,
        time_taken_ms: i64,
        earliest_commit_to_retain: Option<InstantTime>,
        stats: Vec<CleanStat>,
    ) -> Self {
        let total_files_deleted = stats.iter().map(|s| s.success_delete_files.len()).sum();
        CleanMetadata {
            start_clean_time,
            time_taken_ms,
            total_files_deleted,
            earliest_commit_to_retain,
            partition_metadata: stats
                .into_iter()
                .map(|s| (s.partition_path.clone(), s))
                .collect(),
            version: METADATA_VERSION,
        }
    }

    /// Encode for the completed `clean` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("clean metadata", self)
    }

    /// Decode a completed `clean` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let metadata: CleanMetadata = from_binary("clean metadata", bytes)?;
        check_version("clean metadata", metadata.version)?;
        Ok(metadata)
    }
}
