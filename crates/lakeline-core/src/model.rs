//! Record-level model shared by the write path, the index and the engines.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::WriteStat;
use crate::timeline::InstantTime;

/// Key of a record: record key plus the partition it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Unique key within the partition (or table, for global indexes).
    pub record_key: String,
    /// Partition path.
    pub partition_path: String,
}

impl RecordKey {
    /// Build a key.
    pub fn new(record_key: impl Into<String>, partition_path: impl Into<String>) -> Self {
        RecordKey {
            record_key: record_key.into(),
            partition_path: partition_path.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition_path, self.record_key)
    }
}

/// Where the current version of a record lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLocation {
    /// Instant that last wrote the record.
    pub instant_time: InstantTime,
    /// File group holding it.
    pub file_id: String,
}

/// A record flowing through the write path.
///
/// `location` is filled in by index tagging; `data == None` marks a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Record key.
    pub key: RecordKey,
    /// Current location, when the index knows the key.
    pub location: Option<RecordLocation>,
    /// Payload; `None` deletes the record.
    pub data: Option<Value>,
}

impl Record {
    /// A record carrying `data`.
    pub fn new(key: RecordKey, data: Value) -> Self {
        Record {
            key,
            location: None,
            data: Some(data),
        }
    }

    /// A delete marker for `key`.
    pub fn delete(key: RecordKey) -> Self {
        Record {
            key,
            location: None,
            data: None,
        }
    }

    /// True for delete markers.
    pub fn is_delete(&self) -> bool {
        self.data.is_none()
    }

    /// Partition path of the record.
    pub fn partition_path(&self) -> &str {
        &self.key.partition_path
    }
}

/// Outcome of writing one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStatus {
    /// File group id.
    pub file_id: String,
    /// Partition path.
    pub partition_path: String,
    /// Statistics recorded into the commit metadata.
    pub stat: WriteStat,
    /// Keys written to this file group by the instant.
    pub written_keys: Vec<RecordKey>,
    /// Keys deleted from this file group by the instant.
    pub deleted_keys: Vec<RecordKey>,
    /// Records handled.
    pub total_records: u64,
    /// Records that failed.
    pub total_error_records: u64,
    /// Per-key error messages.
    pub errors: BTreeMap<String, String>,
}

impl WriteStatus {
    /// True if any record failed.
    pub fn has_errors(&self) -> bool {
        self.total_error_records > 0
    }

    /// Record a failed record.
    pub fn mark_failure(&mut self, key: &RecordKey, message: impl Into<String>) {
        self.total_records += 1;
        self.total_error_records += 1;
        self.stat.total_write_errors += 1;
        self.errors.insert(key.to_string(), message.into());
    }
}
