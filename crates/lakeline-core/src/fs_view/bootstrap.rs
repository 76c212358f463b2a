//! Bootstrap index: external source files behind bootstrapped base files.
//!
//! A table bootstrapped from an existing dataset starts with skeleton base
//! files that reference the original files instead of copying them. The
//! index records, per file group, the skeleton's instant and the resolved
//! path of its source. The view attaches the source to the matching
//! [`BaseFile`], and the cleaner deletes the source together with the slice
//! once that slice ages out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::fs_view::{BaseFile, BootstrapIndexJsonSnafu, BootstrapIndexStorageSnafu, FsViewResult};
use crate::storage::{self, TableLocation, layout};
use crate::timeline::InstantTime;

/// Source of one bootstrapped base file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSource {
    /// Instant of the skeleton base file.
    pub instant_time: InstantTime,
    /// Resolved path of the source file.
    pub source_path: String,
}

/// Persisted `partition -> file id -> source` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapIndex {
    partitions: BTreeMap<String, BTreeMap<String, BootstrapSource>>,
}

impl BootstrapIndex {
    /// Read the index of the table at `location`; a table that was never
    /// bootstrapped has an empty one.
    pub async fn load(location: &TableLocation) -> FsViewResult<Self> {
        let rel = layout::bootstrap_index_rel_path();
        let bytes = match storage::read_all_bytes(location.storage(), &rel).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(BootstrapIndex::default()),
            Err(e) => return Err(e).context(BootstrapIndexStorageSnafu),
        };
        serde_json::from_slice(&bytes).context(BootstrapIndexJsonSnafu { op: "decode" })
    }

    /// Replace the persisted index with `self`.
    pub async fn save(&self, location: &TableLocation) -> FsViewResult<()> {
        let bytes =
            serde_json::to_vec_pretty(self).context(BootstrapIndexJsonSnafu { op: "encode" })?;
        storage::write_atomic(
            location.storage(),
            &layout::bootstrap_index_rel_path(),
            &bytes,
        )
        .await
        .context(BootstrapIndexStorageSnafu)
    }

    /// Record that the base file of `file_id` written at `instant_time` was
    /// bootstrapped from `source_path`.
    pub fn register(
        &mut self,
        partition_path: impl Into<String>,
        file_id: impl Into<String>,
        instant_time: InstantTime,
        source_path: impl Into<String>,
    ) {
        self.partitions.entry(partition_path.into()).or_default().insert(
            file_id.into(),
            BootstrapSource {
                instant_time,
                source_path: source_path.into(),
            },
        );
    }

    /// Source of `base`, if it is a bootstrapped skeleton. Later base files
    /// of the same group hold merged data and have none.
    pub fn source_of(&self, base: &BaseFile) -> Option<&str> {
        self.partitions
            .get(&base.partition_path)
            .and_then(|files| files.get(&base.file_id))
            .filter(|source| source.instant_time == base.instant_time)
            .map(|source| source.source_path.as_str())
    }

    /// True if no file group was bootstrapped.
    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn base(file_id: &str, ts: &str) -> BaseFile {
        BaseFile {
            partition_path: "p".to_string(),
            file_id: file_id.to_string(),
            instant_time: InstantTime::new(ts),
            file_name: format!("{file_id}_0-0_{ts}.jsonl"),
            size: 1,
            bootstrap_source: None,
        }
    }

    #[test]
    fn only_the_skeleton_instant_has_a_source() {
        let mut index = BootstrapIndex::default();
        index.register("p", "f1", InstantTime::new("001"), "/src/p/part-0.jsonl");

        assert_eq!(index.source_of(&base("f1", "001")), Some("/src/p/part-0.jsonl"));
        assert_eq!(index.source_of(&base("f1", "002")), None);
        assert_eq!(index.source_of(&base("f2", "001")), None);
    }

    #[tokio::test]
    async fn missing_index_loads_empty_and_saves_back() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let mut index = BootstrapIndex::load(&location).await?;
        assert!(index.is_empty());

        index.register("p", "f1", InstantTime::new("001"), "/src/p/part-0.jsonl");
        index.save(&location).await?;
        assert_eq!(BootstrapIndex::load(&location).await?, index);
        Ok(())
    }
}
