//! Action executors.
//!
//! Each table action runs as one instant on the timeline:
//!
//! | Action      | Executor                 | Instant action                 |
//! |-------------|--------------------------|--------------------------------|
//! | write       | [`commit`]               | `commit` / `deltacommit`       |
//! | clean       | [`clean`]                | `clean`                        |
//! | compaction  | [`compact`]              | `compaction`                   |
//! | rollback    | [`rollback`]             | `rollback`                     |
//! | savepoint   | [`savepoint`]            | `savepoint`                    |
//! | restore     | [`restore`]              | `restore`                      |
//!
//! Executors borrow the [`Table`](crate::table::Table) mutably for the whole
//! action. Internal steps return [`ProtocolError`], a union of the errors of
//! the layers below; at the executor boundary it is wrapped into an
//! [`ActionError`] variant naming the action and carrying its instant. No
//! step retries: a failed action leaves its instant pending for an explicit
//! rollback.

use snafu::prelude::*;

use crate::consistency::ConsistencyError;
use crate::engine::EngineError;
use crate::fs_view::FsViewError;
use crate::index::IndexError;
use crate::log_format::LogFormatError;
use crate::metadata::{CommitMetadata, MetadataError};
use crate::schema::SchemaCompatibilityError;
use crate::storage::StorageError;
use crate::timeline::{ActiveTimeline, Instant, TimelineError};

pub mod clean;
pub mod commit;
pub mod compact;
pub mod restore;
pub mod rollback;
pub mod savepoint;

/// Failure of one step inside an action.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    /// Storage failure.
    #[snafu(transparent)]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Timeline failure.
    #[snafu(transparent)]
    Timeline {
        /// Underlying timeline error.
        source: TimelineError,
    },

    /// Payload encoding failure.
    #[snafu(transparent)]
    Metadata {
        /// Underlying metadata error.
        source: MetadataError,
    },

    /// Files did not reach the expected visibility.
    #[snafu(transparent)]
    Consistency {
        /// Underlying consistency guard error.
        source: ConsistencyError,
    },

    /// Index hook failure.
    #[snafu(transparent)]
    Index {
        /// Underlying index error.
        source: IndexError,
    },

    /// Engine failure.
    #[snafu(transparent)]
    Engine {
        /// Underlying engine error.
        source: EngineError,
    },

    /// File system view failure.
    #[snafu(transparent)]
    FsView {
        /// Underlying view error.
        source: FsViewError,
    },

    /// Log file failure.
    #[snafu(transparent)]
    LogFormat {
        /// Underlying log format error.
        source: LogFormatError,
    },

    /// The index refused to roll back an instant.
    #[snafu(display("Index could not roll back instant {instant}"))]
    IndexRollbackRefused {
        /// The instant.
        instant: String,
    },
}

/// Result alias for steps inside an action.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Error surfaced by a table action.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ActionError {
    /// Building or saving commit metadata failed. The instant stays
    /// INFLIGHT.
    #[snafu(display("Failed to commit instant {instant}: {source}"))]
    Commit {
        /// The instant.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// Writing data for an instant failed.
    #[snafu(display("Failed to write instant {instant}: {source}"))]
    Write {
        /// The instant.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// Rolling back an instant failed.
    #[snafu(display("Failed to roll back instant {instant}: {source}"))]
    Rollback {
        /// The instant being rolled back.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// The instant may not be rolled back.
    #[snafu(display("Cannot roll back instant {instant}: {reason}"))]
    RollbackPrecondition {
        /// The instant.
        instant: String,
        /// Which precondition failed.
        reason: String,
    },

    /// Cleaning failed.
    #[snafu(display("Failed to clean at instant {instant}: {source}"))]
    Clean {
        /// The clean instant.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// Scheduling or running a compaction failed.
    #[snafu(display("Failed to compact at instant {instant}: {source}"))]
    Compaction {
        /// The compaction instant.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// A compaction cannot be scheduled or run.
    #[snafu(display("Cannot compact at instant {instant}: {reason}"))]
    CompactionPrecondition {
        /// The compaction instant.
        instant: String,
        /// Which precondition failed.
        reason: String,
    },

    /// Creating or deleting a savepoint failed.
    #[snafu(display("Failed to savepoint instant {instant}: {source}"))]
    Savepoint {
        /// The savepointed instant.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// The instant cannot be savepointed.
    #[snafu(display("Cannot savepoint instant {instant}: {reason}"))]
    SavepointPrecondition {
        /// The instant.
        instant: String,
        /// Which precondition failed.
        reason: String,
    },

    /// Restoring the table failed.
    #[snafu(display("Failed to restore to instant {instant}: {source}"))]
    Restore {
        /// The instant restored to.
        instant: String,
        /// What failed.
        source: ProtocolError,
    },

    /// The writer schema cannot evolve the table schema.
    #[snafu(display("Incompatible writer schema for instant {instant}: {source}"))]
    SchemaIncompatible {
        /// The instant.
        instant: String,
        /// Why the schemas are incompatible.
        source: SchemaCompatibilityError,
    },

    /// Write statuses reported failed records and `commit_on_errors` is off.
    #[snafu(display("Instant {instant} has {error_count} failed record(s); not committing"))]
    WriteErrors {
        /// The instant.
        instant: String,
        /// Failed records across write statuses.
        error_count: u64,
    },

    /// The operation does not apply to this table.
    #[snafu(display("Unsupported operation {operation}: {reason}"))]
    UnsupportedOperation {
        /// The operation.
        operation: String,
        /// Why.
        reason: String,
    },

    /// Refreshing or reading the timeline outside an action failed.
    #[snafu(display("Timeline error: {source}"))]
    Timeline {
        /// Underlying timeline error.
        source: TimelineError,
    },
}

impl ActionError {
    /// True for errors raised by a failed precondition check rather than a
    /// failed step.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ActionError::RollbackPrecondition { .. }
                | ActionError::CompactionPrecondition { .. }
                | ActionError::SavepointPrecondition { .. }
                | ActionError::SchemaIncompatible { .. }
                | ActionError::UnsupportedOperation { .. }
        )
    }
}

/// Result alias for table actions.
pub type ActionResult<T> = Result<T, ActionError>;

/// Commit metadata of a commit-family instant in its current state. An
/// empty payload (a write that transitioned without a workload profile)
/// reads as empty metadata.
pub(crate) async fn read_commit_metadata(
    timeline: &ActiveTimeline,
    instant: &Instant,
) -> ProtocolResult<CommitMetadata> {
    let bytes = timeline.read_details(instant).await?;
    Ok(CommitMetadata::from_instant_payload(&bytes)?)
}

/// Milliseconds elapsed since `start`, saturating.
pub(crate) fn elapsed_ms(start: std::time::Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}
