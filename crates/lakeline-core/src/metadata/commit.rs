use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::{MetadataResult, from_json_bytes, to_json_bytes};
use crate::timeline::InstantTime;

/// Kind of write operation that produced a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperationType {
    /// Insert without looking up existing keys.
    Insert,
    /// Insert-or-update by record key.
    Upsert,
    /// Delete by record key.
    Delete,
    /// Bulk load; no workload profile is recorded.
    BulkInsert,
    /// Compaction of log files into base files.
    Compact,
    /// Unknown or legacy operation.
    #[default]
    Unknown,
}

impl WriteOperationType {
    /// Whether the workload profile must be persisted into the INFLIGHT
    /// payload before any data file is written.
    pub fn needs_workload_profile(&self) -> bool {
        matches!(
            self,
            WriteOperationType::Insert | WriteOperationType::Upsert | WriteOperationType::Delete
        )
    }
}

/// Statistics of one file written (or, in a workload profile, about to be
/// updated) by an instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStat {
    /// File group id.
    pub file_id: String,
    /// Partition the file group lives in.
    pub partition_path: String,
    /// Instant of the previous version of this file group, if any.
    #[serde(default)]
    pub prev_commit: Option<InstantTime>,
    /// Records written (inserts plus updates).
    #[serde(default)]
    pub num_writes: u64,
    /// Records that replaced an existing version.
    #[serde(default)]
    pub num_update_writes: u64,
    /// Records deleted.
    #[serde(default)]
    pub num_deletes: u64,
    /// Records inserted.
    #[serde(default)]
    pub num_inserts: u64,
    /// Bytes written.
    #[serde(default)]
    pub total_write_bytes: u64,
    /// Records that failed to write.
    #[serde(default)]
    pub total_write_errors: u64,
    /// Table-relative path of the written file; absent in workload profiles.
    #[serde(default)]
    pub path: Option<String>,
}

impl WriteStat {
    /// File name component of [`WriteStat::path`].
    pub fn file_name(&self) -> Option<&str> {
        self.path
            .as_deref()
            .map(|p| p.rsplit('/').next().unwrap_or(p))
    }
}

/// Metadata recorded with a completed commit, delta commit or compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Write statistics grouped by partition.
    #[serde(default)]
    pub partition_to_write_stats: BTreeMap<String, Vec<WriteStat>>,
    /// True when produced by a compaction.
    #[serde(default)]
    pub compacted: bool,
    /// Free-form metadata (writer schema, rolling statistics, ...).
    #[serde(default)]
    pub extra_metadata: BTreeMap<String, String>,
    /// Operation that produced the commit.
    #[serde(default)]
    pub operation_type: WriteOperationType,
}

impl CommitMetadata {
    /// Key of the writer schema in [`CommitMetadata::extra_metadata`].
    pub const SCHEMA_KEY: &'static str = "schema";

    /// Empty metadata for `operation_type`.
    pub fn new(operation_type: WriteOperationType) -> Self {
        CommitMetadata {
            operation_type,
            ..Default::default()
        }
    }

    /// Append a write stat under `partition_path`.
    pub fn add_write_stat(&mut self, partition_path: impl Into<String>, stat: WriteStat) {
        self.partition_to_write_stats
            .entry(partition_path.into())
            .or_default()
            .push(stat);
    }

    /// Set an extra metadata entry.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra_metadata.insert(key.into(), value.into());
    }

    /// Look up an extra metadata entry.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.extra_metadata.get(key).map(String::as_str)
    }

    /// Every write stat, partition by partition.
    pub fn write_stats(&self) -> impl Iterator<Item = &WriteStat> + '_ {
        self.partition_to_write_stats.values().flatten()
    }

    /// Write stats of one partition.
    pub fn partition_write_stats(&self, partition_path: &str) -> &[WriteStat] {
        self.partition_to_write_stats
            .get(partition_path)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Map of file id to written path.
    pub fn file_id_to_path(&self) -> BTreeMap<String, String> {
        self.write_stats()
            .filter_map(|s| s.path.clone().map(|p| (s.file_id.clone(), p)))
            .collect()
    }

    /// Written file names grouped by partition.
    pub fn written_file_names(&self) -> BTreeMap<String, Vec<String>> {
        self.partition_to_write_stats
            .iter()
            .map(|(partition, stats)| {
                let names = stats
                    .iter()
                    .filter_map(|s| s.file_name().map(str::to_string))
                    .collect();
                (partition.clone(), names)
            })
            .collect()
    }

    /// Sum of `num_writes` over all stats.
    pub fn total_records_written(&self) -> u64 {
        self.write_stats().map(|s| s.num_writes).sum()
    }

    /// Sum of `num_update_writes` over all stats.
    pub fn total_update_records_written(&self) -> u64 {
        self.write_stats().map(|s| s.num_update_writes).sum()
    }

    /// Sum of `total_write_bytes` over all stats.
    pub fn total_bytes_written(&self) -> u64 {
        self.write_stats().map(|s| s.total_write_bytes).sum()
    }

    /// Encode as JSON.
    pub fn to_json_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_json_bytes("commit metadata", self)
    }

    /// Decode from JSON.
    pub fn from_json_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        from_json_bytes("commit metadata", bytes)
    }

    /// Decode an instant payload that may be empty (bulk inserts persist no
    /// workload profile).
    pub fn from_instant_payload(bytes: &[u8]) -> MetadataResult<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(CommitMetadata::default());
        }
        Self::from_json_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn stat(file_id: &str, partition: &str, path: &str) -> WriteStat {
        WriteStat {
            file_id: file_id.to_string(),
            partition_path: partition.to_string(),
            prev_commit: Some(InstantTime::new("001")),
            num_writes: 10,
            num_update_writes: 4,
            num_deletes: 1,
            num_inserts: 6,
            total_write_bytes: 1024,
            total_write_errors: 0,
            path: Some(path.to_string()),
        }
    }

    #[test]
    fn json_round_trip_preserves_everything() -> TestResult {
        let mut metadata = CommitMetadata::new(WriteOperationType::Upsert);
        metadata.add_write_stat("2024/01/01", stat("f1", "2024/01/01", "2024/01/01/f1_1-0-1_002.jsonl"));
        metadata.add_write_stat("2024/01/02", stat("f2", "2024/01/02", "2024/01/02/f2_1-0-1_002.jsonl"));
        metadata.add_metadata(CommitMetadata::SCHEMA_KEY, "{\"fields\":[]}");

        let bytes = metadata.to_json_bytes()?;
        let decoded = CommitMetadata::from_json_bytes(&bytes)?;
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.total_records_written(), 20);
        assert_eq!(
            decoded.written_file_names()["2024/01/01"],
            vec!["f1_1-0-1_002.jsonl".to_string()]
        );
        Ok(())
    }

    #[test]
    fn decodes_payload_with_missing_optional_fields() -> TestResult {
        let json = br#"{"partition_to_write_stats":{"p":[{"file_id":"f","partition_path":"p"}]}}"#;
        let decoded = CommitMetadata::from_json_bytes(json)?;
        let stat = &decoded.partition_write_stats("p")[0];
        assert_eq!(stat.prev_commit, None);
        assert_eq!(stat.num_writes, 0);
        assert_eq!(decoded.operation_type, WriteOperationType::Unknown);
        assert!(decoded.partition_write_stats("missing").is_empty());
        Ok(())
    }

    #[test]
    fn empty_instant_payload_is_empty_metadata() -> TestResult {
        assert_eq!(
            CommitMetadata::from_instant_payload(b"")?,
            CommitMetadata::default()
        );
        assert!(CommitMetadata::from_instant_payload(b"{not json").is_err());
        Ok(())
    }
}
