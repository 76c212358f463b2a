use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::{METADATA_VERSION, MetadataResult, check_version, from_binary, to_binary};

/// Base files pinned by a savepoint in one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavepointPartitionMetadata {
    /// Partition path.
    pub partition_path: String,
    /// Base file names.
    pub savepoint_data_files: Vec<String>,
}

/// Metadata of a completed savepoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavepointMetadata {
    /// Who created the savepoint.
    pub saved_by: String,
    /// When it was created.
    pub saved_at: DateTime<Utc>,
    /// Free-form comment.
    pub comments: String,
    /// Pinned base files per partition.
    pub partition_metadata: BTreeMap<String, SavepointPartitionMetadata>,
    /// Payload version.
    pub version: u32,
}

impl SavepointMetadata {
    /// Build metadata from latest base file names per partition.
    pub fn new(
        saved_by: impl Into<String>,
        comments: impl Into<String>,
        files: BTreeMap<String, Vec<String>>,
    ) -> Self {
        SavepointMetadata {
            saved_by: saved_by.into(),
            saved_at: Utc::now(),
            comments: comments.into(),
            partition_metadata: files
                .into_iter()
                .map(|(partition_path, savepoint_data_files)| {
                    (
                        partition_path.clone(),
                        SavepointPartitionMetadata {
                            partition_path,
                            savepoint_data_files,
                        },
                    )
                })
                .collect(),
            version: METADATA_VERSION,
        }
    }

    /// Every pinned base file name.
    pub fn savepointed_files(&self) -> BTreeSet<String> {
        self.partition_metadata
            .values()
            .flat_map(|p| p.savepoint_data_files.iter().cloned())
            .collect()
    }

    /// Encode for the completed `savepoint` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("savepoint metadata", self)
    }

    /// Decode a completed `savepoint` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let metadata: SavepointMetadata = from_binary("savepoint metadata", bytes)?;
        check_version("savepoint metadata", metadata.version)?;
        Ok(metadata)
    }
}
