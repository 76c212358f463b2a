use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::{METADATA_VERSION, MetadataResult, check_version, from_binary, to_binary};
use crate::timeline::{ActionType, InstantTime};

/// Payload of a `rollback.requested` instant: which instant is being undone.
///
/// A rollback that crashed before completing is resumed under its own
/// instant time by finding the pending rollback whose plan names the same
/// target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    /// Instant being rolled back.
    pub instant_to_rollback: InstantTime,
    /// Action of that instant.
    pub action: ActionType,
    /// Payload version.
    pub version: u32,
}

impl RollbackPlan {
    /// Plan to roll back `(instant_to_rollback, action)`.
    pub fn new(instant_to_rollback: InstantTime, action: ActionType) -> Self {
        RollbackPlan {
            instant_to_rollback,
            action,
            version: METADATA_VERSION,
        }
    }

    /// Encode for the `rollback.requested` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("rollback plan", self)
    }

    /// Decode a `rollback.requested` / `.inflight` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let plan: RollbackPlan = from_binary("rollback plan", bytes)?;
        check_version("rollback plan", plan.version)?;
        Ok(plan)
    }
}

/// Rollback outcome of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStat {
    /// Partition path.
    pub partition_path: String,
    /// Deleted file names.
    pub success_delete_files: Vec<String>,
    /// File names that could not be deleted.
    pub failed_delete_files: Vec<String>,
    /// Log file name → rollback command blocks appended to it.
    pub command_blocks_count: BTreeMap<String, u64>,
}

impl RollbackStat {
    /// Empty stat for `partition_path`.
    pub fn new(partition_path: impl Into<String>) -> Self {
        RollbackStat {
            partition_path: partition_path.into(),
            ..Default::default()
        }
    }

    /// Combine two stats of the same partition.
    pub fn merge(mut self, other: RollbackStat) -> Self {
        self.success_delete_files.extend(other.success_delete_files);
        self.failed_delete_files.extend(other.failed_delete_files);
        for (file, count) in other.command_blocks_count {
            *self.command_blocks_count.entry(file).or_default() += count;
        }
        self
    }

    /// Merge a list of stats into one per partition, sorted by partition.
    pub fn merge_by_partition(stats: impl IntoIterator<Item = RollbackStat>) -> Vec<RollbackStat> {
        let mut merged: BTreeMap<String, RollbackStat> = BTreeMap::new();
        for stat in stats {
            let partition = stat.partition_path.clone();
            let combined = match merged.remove(&partition) {
                Some(existing) => existing.merge(stat),
                None => stat,
            };
            merged.insert(partition, combined);
        }
        merged.into_values().collect()
    }
}

/// Metadata of a completed rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMetadata {
    /// Instant of the rollback.
    pub start_rollback_time: InstantTime,
    /// Wall time spent.
    pub time_taken_ms: i64,
    /// Files deleted across partitions.
    pub total_files_deleted: usize,
    /// Instants rolled back.
    pub commits_rollback: Vec<InstantTime>,
    /// Per-partition results.
    pub partition_metadata: BTreeMap<String, RollbackStat>,
    /// Payload version.
    pub version: u32,
}

impl RollbackMetadata {
    /// Aggregate partition results.
    pub fn new(
        start_rollback_time: InstantTime,
        time_taken_ms: i64,
        commits_rollback: Vec<InstantTime>,
        stats: Vec<RollbackStat>,
    ) -> Self {
        let total_files_deleted = stats.iter().map(|s| s.success_delete_files.len()).sum();
        RollbackMetadata {
            start_rollback_time,
            time_taken_ms,
            total_files_deleted,
            commits_rollback,
            partition_metadata: stats
                .into_iter()
                .map(|s| (s.partition_path.clone(), s))
                .collect(),
            version: METADATA_VERSION,
        }
    }

    /// Encode for the completed `rollback` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("rollback metadata", self)
    }

    /// Decode a completed `rollback` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let metadata: RollbackMetadata = from_binary("rollback metadata", bytes)?;
        check_version("rollback metadata", metadata.version)?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metadata_is_empty() {
        let metadata = RollbackMetadata::default();
        assert_eq!(metadata.start_rollback_time, InstantTime::default());
        assert!(metadata.commits_rollback.is_empty());
        assert_eq!(metadata.total_files_deleted, 0);
    }

    #[test]
    fn merge_by_partition_combines_counts() {
        let mut a = RollbackStat::new("p1");
        a.success_delete_files.push("f1_1-0-1_002.jsonl".to_string());
        a.command_blocks_count.insert(".f2_001.log.1_1-0-1".to_string(), 1);
        let mut b = RollbackStat::new("p1");
        b.command_blocks_count.insert(".f2_001.log.1_1-0-1".to_string(), 1);
        let c = RollbackStat::new("p0");

        let merged = RollbackStat::merge_by_partition(vec![a, b, c]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].partition_path, "p0");
        assert_eq!(merged[1].command_blocks_count[".f2_001.log.1_1-0-1"], 2);

        let metadata = RollbackMetadata::new(
            InstantTime::new("005"),
            12,
            vec![InstantTime::new("004")],
            merged,
        );
        assert_eq!(metadata.total_files_deleted, 1);
        let decoded = RollbackMetadata::from_bytes(&metadata.to_bytes().expect("encode"))
            .expect("decode");
        assert_eq!(decoded, metadata);
    }
}
