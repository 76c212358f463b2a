//! Log blocks appended to merge-on-read log files.
//!
//! A log file is a sequence of blocks, one JSON object per line. Data and
//! delete blocks carry the instant that wrote them; command blocks undo the
//! blocks of an earlier instant. Readers never trust a block blindly:
//! [`valid_blocks`] drops blocks whose instant was rolled back or never
//! committed.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::model::RecordKey;
use crate::storage::{self, StorageError, TableLocation};
use crate::timeline::InstantTime;

/// Errors raised while reading or appending log blocks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogFormatError {
    /// Storage failure on the log file.
    #[snafu(display("Log file storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A block could not be serialized.
    #[snafu(display("Failed to encode log block: {source}"))]
    Encode {
        /// Underlying serde_json error.
        source: serde_json::Error,
    },

    /// A line of the log file is not a valid block.
    #[snafu(display("Corrupt block at line {line} of {path}: {source}"))]
    Decode {
        /// Log file path.
        path: String,
        /// 1-based line number.
        line: usize,
        /// Underlying serde_json error.
        source: serde_json::Error,
    },
}

/// Result alias for log file operations.
pub type LogFormatResult<T> = Result<T, LogFormatError>;

/// A record stored in a data block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Record key.
    pub key: RecordKey,
    /// Payload.
    pub data: Value,
}

/// Command carried by a command block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Invalidate every block written by the target instant.
    RollbackPreviousBlock,
}

/// One block of a log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block_type", rename_all = "snake_case")]
pub enum LogBlock {
    /// Inserted or updated records.
    Data {
        /// Instant that wrote the block.
        instant_time: InstantTime,
        /// Records in write order.
        records: Vec<LogRecord>,
    },
    /// Deleted keys.
    Delete {
        /// Instant that wrote the block.
        instant_time: InstantTime,
        /// Keys deleted.
        keys: Vec<RecordKey>,
    },
    /// A command about earlier blocks.
    Command {
        /// Instant that wrote the block (the rollback).
        instant_time: InstantTime,
        /// What to do.
        command: CommandType,
        /// Instant whose blocks the command applies to.
        target_instant_time: InstantTime,
    },
}

impl LogBlock {
    /// Command block rolling back every block of `target_instant_time`.
    pub fn rollback(instant_time: InstantTime, target_instant_time: InstantTime) -> Self {
        LogBlock::Command {
            instant_time,
            command: CommandType::RollbackPreviousBlock,
            target_instant_time,
        }
    }

    /// Instant that wrote the block.
    pub fn instant_time(&self) -> &InstantTime {
        match self {
            LogBlock::Data { instant_time, .. }
            | LogBlock::Delete { instant_time, .. }
            | LogBlock::Command { instant_time, .. } => instant_time,
        }
    }
}

/// Append `blocks` to the log file at `rel_path`, creating it when missing.
/// Returns the number of bytes appended.
pub async fn append_blocks(
    location: &TableLocation,
    rel_path: &Path,
    blocks: &[LogBlock],
) -> LogFormatResult<u64> {
    let mut buf = Vec::new();
    for block in blocks {
        serde_json::to_writer(&mut buf, block).context(EncodeSnafu)?;
        buf.push(b'\n');
    }
    storage::append_bytes(location.storage(), rel_path, &buf)
        .await
        .context(StorageSnafu)?;
    Ok(buf.len() as u64)
}

/// Read every block of the log file at `rel_path`, in file order.
pub async fn read_blocks(location: &TableLocation, rel_path: &Path) -> LogFormatResult<Vec<LogBlock>> {
    let text = storage::read_to_string(location.storage(), rel_path)
        .await
        .context(StorageSnafu)?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).context(DecodeSnafu {
                path: rel_path.display().to_string(),
                line: idx + 1,
            })
        })
        .collect()
}

/// Data and delete blocks that survive rollbacks, in file order.
///
/// A block is dropped when a command block anywhere in `blocks` rolls back
/// its instant, or when `is_committed` rejects its instant (a write that
/// failed before committing and was never rolled back).
pub fn valid_blocks(
    blocks: Vec<LogBlock>,
    is_committed: impl Fn(&InstantTime) -> bool,
) -> Vec<LogBlock> {
    let rolled_back: HashSet<InstantTime> = blocks
        .iter()
        .filter_map(|b| match b {
            LogBlock::Command {
                command: CommandType::RollbackPreviousBlock,
                target_instant_time,
                ..
            } => Some(target_instant_time.clone()),
            _ => None,
        })
        .collect();

    blocks
        .into_iter()
        .filter(|b| !matches!(b, LogBlock::Command { .. }))
        .filter(|b| !rolled_back.contains(b.instant_time()) && is_committed(b.instant_time()))
        .collect()
}
