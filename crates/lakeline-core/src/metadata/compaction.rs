use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use snafu::ResultExt;

use crate::metadata::{
    CommitMetadata, JsonSnafu, MetadataResult, check_version, from_binary, from_json_bytes,
    to_binary,
};
use crate::timeline::InstantTime;

/// Key of the executed plan in the [`CommitMetadata::extra_metadata`] of a
/// completed compaction. Rolling the compaction back restores the plan as
/// the INFLIGHT payload from here.
pub const COMPACTION_PLAN_METADATA_KEY: &str = "lakeline.compaction.plan";

/// Merge of one file slice into a new base file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionOperation {
    /// Partition path.
    pub partition_path: String,
    /// File group id.
    pub file_id: String,
    /// Base instant of the slice being compacted.
    pub base_instant_time: InstantTime,
    /// Base file name, if the slice has one.
    pub base_file: Option<String>,
    /// Log file names, oldest first.
    pub log_files: Vec<String>,
}

/// Persisted plan of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPlan {
    /// Operations, sorted by partition then file id.
    pub operations: Vec<CompactionOperation>,
    /// Free-form metadata.
    pub extra_metadata: BTreeMap<String, String>,
    /// Payload version.
    pub version: u32,
}

impl CompactionPlan {
    /// True if there is nothing to compact.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// `(partition, file id)` pairs under this plan.
    pub fn file_group_ids(&self) -> BTreeSet<(String, String)> {
        self.operations
            .iter()
            .map(|op| (op.partition_path.clone(), op.file_id.clone()))
            .collect()
    }

    /// Encode for the `compaction.requested` payload.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        to_binary("compaction plan", self)
    }

    /// Decode a `compaction.requested` / `.inflight` payload.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        let plan: CompactionPlan = from_binary("compaction plan", bytes)?;
        check_version("compaction plan", plan.version)?;
        Ok(plan)
    }

    /// Encode for [`CommitMetadata::extra_metadata`].
    pub fn to_json_string(&self) -> MetadataResult<String> {
        serde_json::to_string(self).context(JsonSnafu {
            op: "encode",
            what: "compaction plan",
        })
    }

    /// The plan recorded in the metadata of a completed compaction, if any.
    pub fn from_commit_metadata(metadata: &CommitMetadata) -> MetadataResult<Option<Self>> {
        let Some(json) = metadata.metadata(COMPACTION_PLAN_METADATA_KEY) else {
            return Ok(None);
        };
        let plan: CompactionPlan = from_json_bytes("compaction plan", json.as_bytes())?;
        check_version("compaction plan", plan.version)?;
        Ok(Some(plan))
    }
}
