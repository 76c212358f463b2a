use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::metadata::{CommitMetadata, JsonSnafu, MetadataResult, WriteStat, from_json_bytes};
use crate::timeline::ActionType;

/// Key of the rolling statistics in [`CommitMetadata::extra_metadata`].
pub const ROLLING_STAT_METADATA_KEY: &str = "lakeline.rolling.stats";

/// Running totals for one file group across commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingStat {
    /// File group id.
    pub file_id: String,
    /// Net inserted records (can go negative transiently when deletes outrun
    /// inserts within one commit).
    pub inserts: i64,
    /// Updated records.
    pub upserts: u64,
    /// Deleted records.
    pub deletes: u64,
    /// Bytes written.
    pub total_input_write_bytes: u64,
}

impl RollingStat {
    /// Derive the per-commit contribution of a write stat.
    ///
    /// `inserts = num_writes - (num_update_writes - num_deletes)`.
    pub fn from_write_stat(stat: &WriteStat) -> Self {
        let inserts =
            stat.num_writes as i64 - (stat.num_update_writes as i64 - stat.num_deletes as i64);
        RollingStat {
            file_id: stat.file_id.clone(),
            inserts,
            upserts: stat.num_update_writes,
            deletes: stat.num_deletes,
            total_input_write_bytes: stat.total_write_bytes,
        }
    }

    /// Add `other`'s counters onto `self`.
    pub fn merge(&mut self, other: &RollingStat) {
        self.inserts += other.inserts;
        self.upserts += other.upserts;
        self.deletes += other.deletes;
        self.total_input_write_bytes += other.total_input_write_bytes;
    }
}

/// Rolling statistics of a whole table, keyed by partition then file id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingStatMetadata {
    /// Action that last wrote these statistics.
    pub action_type: Option<ActionType>,
    /// Partition → file id → running totals.
    #[serde(default)]
    pub partition_to_rolling_stats: BTreeMap<String, BTreeMap<String, RollingStat>>,
}

impl RollingStatMetadata {
    /// Empty statistics attributed to `action_type`.
    pub fn new(action_type: ActionType) -> Self {
        RollingStatMetadata {
            action_type: Some(action_type),
            partition_to_rolling_stats: BTreeMap::new(),
        }
    }

    /// Fold one stat into the totals of its partition and file id.
    pub fn add_rolling_stat(&mut self, partition_path: &str, stat: RollingStat) {
        let partition = self
            .partition_to_rolling_stats
            .entry(partition_path.to_string())
            .or_default();
        match partition.get_mut(&stat.file_id) {
            Some(existing) => existing.merge(&stat),
            None => {
                partition.insert(stat.file_id.clone(), stat);
            }
        }
    }

    /// Fold every write stat of a commit.
    pub fn add_commit(&mut self, metadata: &CommitMetadata) {
        for (partition, stats) in &metadata.partition_to_write_stats {
            for stat in stats {
                self.add_rolling_stat(partition, RollingStat::from_write_stat(stat));
            }
        }
    }

    /// Merge the totals of a previous commit into `self`.
    pub fn merge(mut self, previous: &RollingStatMetadata) -> Self {
        for (partition, stats) in &previous.partition_to_rolling_stats {
            for stat in stats.values() {
                self.add_rolling_stat(partition, stat.clone());
            }
        }
        self
    }

    /// Read the statistics embedded in a commit, if any.
    pub fn from_commit_metadata(metadata: &CommitMetadata) -> MetadataResult<Option<Self>> {
        metadata
            .metadata(ROLLING_STAT_METADATA_KEY)
            .map(|json| from_json_bytes("rolling stats", json.as_bytes()))
            .transpose()
    }

    /// Encode for [`CommitMetadata::extra_metadata`].
    pub fn to_json_string(&self) -> MetadataResult<String> {
        serde_json::to_string(self).context(JsonSnafu {
            op: "encode",
            what: "rolling stats",
        })
    }

    /// Totals of one file group.
    pub fn get(&self, partition_path: &str, file_id: &str) -> Option<&RollingStat> {
        self.partition_to_rolling_stats
            .get(partition_path)
            .and_then(|p| p.get(file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn write_stat(file_id: &str, writes: u64, updates: u64, deletes: u64) -> WriteStat {
        WriteStat {
            file_id: file_id.to_string(),
            partition_path: "p".to_string(),
            num_writes: writes,
            num_update_writes: updates,
            num_deletes: deletes,
            total_write_bytes: 100,
            ..Default::default()
        }
    }

    #[test]
    fn inserts_follow_writes_minus_net_updates() {
        let stat = RollingStat::from_write_stat(&write_stat("f1", 10, 4, 1));
        assert_eq!(stat.inserts, 7);
        assert_eq!(stat.upserts, 4);
        assert_eq!(stat.deletes, 1);
    }

    #[test]
    fn merge_sums_matching_file_groups() -> TestResult {
        let mut first = CommitMetadata::default();
        first.add_write_stat("p", write_stat("f1", 10, 0, 0));
        let mut previous = RollingStatMetadata::new(ActionType::Commit);
        previous.add_commit(&first);

        let mut second = CommitMetadata::default();
        second.add_write_stat("p", write_stat("f1", 5, 5, 0));
        second.add_write_stat("p", write_stat("f2", 3, 0, 0));
        let mut current = RollingStatMetadata::new(ActionType::Commit);
        current.add_commit(&second);

        let merged = current.merge(&previous);
        let f1 = merged.get("p", "f1").ok_or("missing f1")?;
        assert_eq!(f1.inserts, 10);
        assert_eq!(f1.upserts, 5);
        assert_eq!(f1.total_input_write_bytes, 200);
        assert_eq!(merged.get("p", "f2").map(|s| s.inserts), Some(3));

        let mut carrier = CommitMetadata::default();
        carrier.add_metadata(ROLLING_STAT_METADATA_KEY, merged.to_json_string()?);
        assert_eq!(
            RollingStatMetadata::from_commit_metadata(&carrier)?,
            Some(merged)
        );
        assert_eq!(
            RollingStatMetadata::from_commit_metadata(&CommitMetadata::default())?,
            None
        );
        Ok(())
    }
}
