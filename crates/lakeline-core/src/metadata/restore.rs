use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::{
    METADATA_VERSION, MetadataResult, RollbackMetadata, check_version, from_binary, to_binary,
};
use crate::timeline::InstantTime;

/// Metadata of a completed restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMetadata {
    /// Instant of the restore.
    pub start_restore_time: InstantTime,
    /// Instant the table was restored to.
    pub restored_to: InstantTime,
    /// Wall time spent.
    pub time_taken_ms: i64,
    /// Instants rolled back, newest first.
    pub instants_to_rollback: Vec<InstantTime>,
    /// Rollback results per rolled-back instant.
    pub instant_to_rollback_metadata: BTreeMap<InstantTime, Vec<RollbackMetadata>>,
    /// Payload version.
    pub version: u32,
}

impl RestoreMetadata {
    /// Aggregate rollback results.
    pub fn new(
        start_restore_time: InstantTime,
        restored_to: InstantTime,
        time_taken_ms: i64,
        rollbacks: Vec<(InstantTime, RollbackMetadata)>,
    ) -> Self {
        let instants_to_rollback = rollbacks.iter().map(|(ts, _)| ts.clone()).collect();
        let mut instant_to_rollback_metadata: BTreeMap<InstantTime, Vec<RollbackMetadata>> =
            BTreeMap::new();
        for (ts, metadata) in rollbacks {
            instant_to_rollback_metadata
                .entry(ts)
                .or_default()
                .push(metadata);
        }
        RestoreMetadata {
            start_restore_time,
            restored_to,
            time_taken_ms,
            instants_to_rollback,
            instant_to_rollback_metadata,
            version: METADATA_VERSION,
        }
    }

    /// Encode for the completed `restore` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("restore metadata", self)
    }

    /// Decode a completed `restore` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let metadata: RestoreMetadata = from_binary("restore metadata", bytes)?;
        check_version("restore metadata", metadata.version)?;
        Ok(metadata)
    }
}
