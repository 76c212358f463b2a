//! Execution engines.
//!
//! The commit protocol never touches record data itself. It hands tagged
//! records to a [`WriteEngine`], which writes base and log files (dropping a
//! marker before each file it touches) and reports one [`WriteStatus`] per
//! file written. Engines also supply their own input, key-set and output
//! types; the protocol only needs the small capability traits
//! [`RecordInput`], [`KeySet`] and [`WriteResults`] to move between them and
//! the shared record model.
//!
//! [`LocalEngine`] is a single-process engine writing line-oriented JSON
//! files.

use std::path::PathBuf;

use async_trait::async_trait;
use snafu::prelude::*;

use crate::config::TableType;
use crate::fs_view::FileSystemView;
use crate::log_format::LogFormatError;
use crate::markers::WriteMarkers;
use crate::metadata::{CompactionOperation, WriteOperationType};
use crate::model::{Record, RecordKey, WriteStatus};
use crate::storage::{StorageError, TableLocation};
use crate::timeline::{InstantTime, Timeline};

mod local;

pub use local::{BaseRecord, LocalEngine};

/// Errors raised by an engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Storage failure while reading or writing a data file.
    #[snafu(display("Engine storage error on {path}: {source}"))]
    DataFile {
        /// Table-relative path of the file.
        path: String,
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Creating a marker failed.
    #[snafu(display("Failed to create marker for {path}: {source}"))]
    Marker {
        /// Table-relative path of the data file.
        path: String,
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Reading or appending log blocks failed.
    #[snafu(display("Log file error: {source}"))]
    LogFile {
        /// Underlying log format error.
        #[snafu(backtrace)]
        source: LogFormatError,
    },

    /// A base file line could not be encoded or decoded.
    #[snafu(display("Invalid record in {path}: {source}"))]
    RecordCodec {
        /// Table-relative path of the file.
        path: String,
        /// Underlying serde_json error.
        source: serde_json::Error,
    },

    /// The engine does not support the requested operation.
    #[snafu(display("Unsupported engine operation: {message}"))]
    Unsupported {
        /// What was asked.
        message: String,
    },
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine input convertible into records.
pub trait RecordInput: Send {
    /// The records carried by the input.
    fn into_records(self) -> Vec<Record>;
}

/// Engine key collection convertible into record keys.
pub trait KeySet: Send {
    /// The keys carried by the set.
    fn into_keys(self) -> Vec<RecordKey>;
}

/// Engine output built from write statuses.
pub trait WriteResults: Send + Sized {
    /// Wrap the statuses of one write.
    fn from_write_statuses(statuses: Vec<WriteStatus>) -> Self;

    /// Statuses carried by the output.
    fn write_statuses(&self) -> &[WriteStatus];
}

impl RecordInput for Vec<Record> {
    fn into_records(self) -> Vec<Record> {
        self
    }
}

impl KeySet for Vec<RecordKey> {
    fn into_keys(self) -> Vec<RecordKey> {
        self
    }
}

impl WriteResults for Vec<WriteStatus> {
    fn from_write_statuses(statuses: Vec<WriteStatus>) -> Self {
        statuses
    }

    fn write_statuses(&self) -> &[WriteStatus] {
        self
    }
}

/// Everything an engine needs to write for one instant.
pub struct WriteContext<'a> {
    /// Table root.
    pub location: &'a TableLocation,
    /// Instant being written.
    pub instant_time: &'a InstantTime,
    /// Physical layout of the table.
    pub table_type: TableType,
    /// Operation being executed.
    pub operation: WriteOperationType,
    /// Extension of base files, including the dot.
    pub base_file_extension: &'a str,
    /// Markers of the instant.
    pub markers: &'a WriteMarkers,
    /// File groups visible before the write.
    pub view: &'a dyn FileSystemView,
    /// Completed commit-family instants, for merging log blocks.
    pub completed_commits: &'a Timeline,
}

impl WriteContext<'_> {
    /// Table-relative path of a data file.
    pub fn data_file_path(&self, partition_path: &str, file_name: &str) -> PathBuf {
        crate::storage::layout::data_file_rel_path(partition_path, file_name)
    }
}

/// An execution engine.
#[async_trait]
pub trait WriteEngine: Send + Sync {
    /// Engine-specific input of upserts and inserts.
    type Input: RecordInput;
    /// Engine-specific key collection of deletes.
    type Keys: KeySet;
    /// Engine-specific result of a write.
    type Output: WriteResults;

    /// Write index-tagged records. Records with a location update that file
    /// group; the others are inserted into new file groups. Deletes
    /// (`data == None`) remove their key from the file group holding it.
    async fn write(
        &self,
        ctx: &WriteContext<'_>,
        records: Vec<Record>,
    ) -> EngineResult<Vec<WriteStatus>>;

    /// Merge the slice described by `operation` into a new base file written
    /// at `ctx.instant_time`.
    async fn compact(
        &self,
        ctx: &WriteContext<'_>,
        operation: &CompactionOperation,
    ) -> EngineResult<WriteStatus>;
}
