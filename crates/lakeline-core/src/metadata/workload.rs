use std::collections::BTreeMap;

use crate::metadata::{CommitMetadata, WriteOperationType, WriteStat};
use crate::model::Record;
use crate::timeline::InstantTime;

/// Insert and update counts for one partition (or the whole input).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadStat {
    /// Records without a known location.
    pub num_inserts: u64,
    /// Records routed to an existing file group.
    pub num_updates: u64,
    /// File id → (instant the record was last written, records routed there).
    pub update_location_to_count: BTreeMap<String, (InstantTime, u64)>,
}

impl WorkloadStat {
    /// Count `n` inserts.
    pub fn add_inserts(&mut self, n: u64) {
        self.num_inserts += n;
    }

    /// Count `n` updates into `file_id`.
    pub fn add_updates(&mut self, file_id: &str, prev_commit: &InstantTime, n: u64) {
        self.num_updates += n;
        self.update_location_to_count
            .entry(file_id.to_string())
            .and_modify(|(_, count)| *count += n)
            .or_insert_with(|| (prev_commit.clone(), n));
    }
}

/// Shape of a write: how many records go where, by partition.
///
/// Built from index-tagged records before any data is written, and persisted
/// into the INFLIGHT payload so a rollback can find file groups that received
/// updates even if the writer died before committing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadProfile {
    partition_path_stat: BTreeMap<String, WorkloadStat>,
    global_stat: WorkloadStat,
}

impl WorkloadProfile {
    /// Profile a batch of tagged records.
    pub fn build(records: &[Record]) -> Self {
        let mut profile = WorkloadProfile::default();
        for record in records {
            let partition = profile
                .partition_path_stat
                .entry(record.partition_path().to_string())
                .or_default();
            match &record.location {
                Some(location) => {
                    partition.add_updates(&location.file_id, &location.instant_time, 1);
                    profile
                        .global_stat
                        .add_updates(&location.file_id, &location.instant_time, 1);
                }
                None => {
                    partition.add_inserts(1);
                    profile.global_stat.add_inserts(1);
                }
            }
        }
        profile
    }

    /// Partitions touched by the workload.
    pub fn partition_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.partition_path_stat.keys().map(String::as_str)
    }

    /// Stat of one partition.
    pub fn workload_stat(&self, partition_path: &str) -> Option<&WorkloadStat> {
        self.partition_path_stat.get(partition_path)
    }

    /// Totals across partitions.
    pub fn global_stat(&self) -> &WorkloadStat {
        &self.global_stat
    }

    /// INFLIGHT payload: one write stat per updated file group carrying the
    /// file id, previous commit and update count.
    pub fn to_inflight_metadata(&self, operation_type: WriteOperationType) -> CommitMetadata {
        let mut metadata = CommitMetadata::new(operation_type);
        for (partition, stat) in &self.partition_path_stat {
            for (file_id, (prev_commit, count)) in &stat.update_location_to_count {
                metadata.add_write_stat(
                    partition.clone(),
                    WriteStat {
                        file_id: file_id.clone(),
                        partition_path: partition.clone(),
                        prev_commit: Some(prev_commit.clone()),
                        num_update_writes: *count,
                        ..Default::default()
                    },
                );
            }
            if stat.update_location_to_count.is_empty() {
                metadata
                    .partition_to_write_stats
                    .entry(partition.clone())
                    .or_default();
            }
        }
        metadata
    }
}
