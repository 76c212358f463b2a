//! Metadata payloads stored in instant files.
//!
//! Each instant state file may carry a payload describing the action:
//!
//! | Instant                      | Payload                         | Encoding |
//! |------------------------------|---------------------------------|----------|
//! | `commit` / `deltacommit`     | [`CommitMetadata`]              | JSON     |
//! | `*.inflight` write           | workload profile as [`CommitMetadata`] | JSON |
//! | `compaction.requested`       | [`CompactionPlan`]              | binary   |
//! | `compaction.inflight`        | [`CompactionPlan`]              | binary   |
//! | `compaction`                 | [`CommitMetadata`]              | JSON     |
//! | `clean.requested/.inflight`  | [`CleanerPlan`]                 | binary   |
//! | `clean`                      | [`CleanMetadata`]               | binary   |
//! | `rollback.requested`         | [`RollbackPlan`]                | binary   |
//! | `rollback`                   | [`RollbackMetadata`]            | binary   |
//! | `savepoint`                  | [`SavepointMetadata`]           | binary   |
//! | `restore`                    | [`RestoreMetadata`]             | binary   |
//!
//! Commit metadata stays human-readable JSON because downstream tools read
//! it for incremental consumption. Plans and the remaining metadata use a
//! compact binary encoding (`bincode`); every binary payload carries a
//! `version` field.

use serde::{Serialize, de::DeserializeOwned};
use snafu::{Backtrace, prelude::*};

mod clean;
mod commit;
mod compaction;
mod restore;
mod rollback;
mod rolling_stats;
mod savepoint;
mod workload;

pub use clean::{
    CleanFileInfo, CleanMetadata, CleanStat, CleanerPlan, CleaningPolicy, PartitionCleanStat,
};
pub use commit::{CommitMetadata, WriteOperationType, WriteStat};
pub use compaction::{COMPACTION_PLAN_METADATA_KEY, CompactionOperation, CompactionPlan};
pub use restore::RestoreMetadata;
pub use rollback::{RollbackMetadata, RollbackPlan, RollbackStat};
pub use rolling_stats::{ROLLING_STAT_METADATA_KEY, RollingStat, RollingStatMetadata};
pub use savepoint::{SavepointMetadata, SavepointPartitionMetadata};
pub use workload::{WorkloadProfile, WorkloadStat};

/// Version written into every binary metadata payload.
pub const METADATA_VERSION: u32 = 1;

/// Errors raised while encoding or decoding metadata payloads.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetadataError {
    /// JSON encoding or decoding failed.
    #[snafu(display("Failed to {op} {what} as JSON: {source}"))]
    Json {
        /// `"encode"` or `"decode"`.
        op: &'static str,
        /// Kind of payload.
        what: &'static str,
        /// Underlying serde_json error.
        source: serde_json::Error,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Binary encoding or decoding failed.
    #[snafu(display("Failed to {op} {what}: {source}"))]
    Binary {
        /// `"encode"` or `"decode"`.
        op: &'static str,
        /// Kind of payload.
        what: &'static str,
        /// Underlying bincode error.
        source: bincode::Error,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// A payload decoded but carries a version this build does not read.
    #[snafu(display("Unsupported {what} version {version}"))]
    UnsupportedVersion {
        /// Kind of payload.
        what: &'static str,
        /// Version found in the payload.
        version: u32,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

/// Result alias for metadata encoding.
pub type MetadataResult<T> = Result<T, MetadataError>;

pub(crate) fn to_json_bytes<T: Serialize>(what: &'static str, value: &T) -> MetadataResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).context(JsonSnafu { op: "encode", what })
}

pub(crate) fn from_json_bytes<T: DeserializeOwned>(
    what: &'static str,
    bytes: &[u8],
) -> MetadataResult<T> {
    serde_json::from_slice(bytes).context(JsonSnafu { op: "decode", what })
}

pub(crate) fn to_binary<T: Serialize>(what: &'static str, value: &T) -> MetadataResult<Vec<u8>> {
    bincode::serialize(value).context(BinarySnafu { op: "encode", what })
}

pub(crate) fn from_binary<T: DeserializeOwned>(
    what: &'static str,
    bytes: &[u8],
) -> MetadataResult<T> {
    bincode::deserialize(bytes).context(BinarySnafu { op: "decode", what })
}

pub(crate) fn check_version(what: &'static str, version: u32) -> MetadataResult<()> {
    ensure!(
        version <= METADATA_VERSION,
        UnsupportedVersionSnafu { what, version }
    );
    Ok(())
}
