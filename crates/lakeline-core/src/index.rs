//! Record-location index.
//!
//! The index maps a [`RecordKey`] to the file group holding the record's
//! current version. The commit protocol only talks to it through three hooks:
//!
//! - [`RecordIndex::tag_location`] before a write, so updates are routed to
//!   the right file group;
//! - [`RecordIndex::update_location`] after the engine wrote the data;
//! - [`RecordIndex::rollback_commit`] when an instant is rolled back.
//!
//! [`InMemoryIndex`] keeps the full location history of each key, so rolling
//! back an instant restores the location the key had before it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::prelude::*;

use crate::model::{Record, RecordKey, RecordLocation, WriteStatus};
use crate::timeline::InstantTime;

/// Errors raised by an index implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    /// The backing store of the index failed.
    #[snafu(display("Index backend error: {message}"))]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// Result alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Pluggable record-location index.
#[async_trait]
pub trait RecordIndex: Send + Sync {
    /// Fill in [`Record::location`] for every record whose key is known.
    async fn tag_location(&self, records: Vec<Record>) -> IndexResult<Vec<Record>>;

    /// Record the locations written by `instant_time`. Returns the statuses
    /// unchanged, so callers can chain the result into the commit.
    async fn update_location(
        &self,
        statuses: Vec<WriteStatus>,
        instant_time: &InstantTime,
    ) -> IndexResult<Vec<WriteStatus>>;

    /// Forget every location written by `instant_time`. Returns whether the
    /// index could honor the request.
    async fn rollback_commit(&self, instant_time: &InstantTime) -> IndexResult<bool>;

    /// True when keys are unique across partitions.
    fn is_global(&self) -> bool {
        false
    }

    /// True when locations written to log files are indexed.
    fn can_index_log_files(&self) -> bool {
        true
    }
}

/// One location change of a key. `location == None` is a delete.
#[derive(Debug, Clone)]
struct LocationEntry {
    instant_time: InstantTime,
    location: Option<RecordLocation>,
}

/// Index held in memory, keyed by partition and record key.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    history: Mutex<HashMap<RecordKey, Vec<LocationEntry>>>,
}

impl InMemoryIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current location of `key`.
    pub fn location(&self, key: &RecordKey) -> Option<RecordLocation> {
        self.history
            .lock()
            .get(key)
            .and_then(|entries| entries.last())
            .and_then(|entry| entry.location.clone())
    }

    /// Number of keys with a live location.
    pub fn len(&self) -> usize {
        self.history
            .lock()
            .values()
            .filter(|entries| entries.last().is_some_and(|e| e.location.is_some()))
            .count()
    }

    /// True when no key has a live location.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordIndex for InMemoryIndex {
    async fn tag_location(&self, records: Vec<Record>) -> IndexResult<Vec<Record>> {
        let history = self.history.lock();
        Ok(records
            .into_iter()
            .map(|mut record| {
                record.location = history
                    .get(&record.key)
                    .and_then(|entries| entries.last())
                    .and_then(|entry| entry.location.clone());
                record
            })
            .collect())
    }

    async fn update_location(
        &self,
        statuses: Vec<WriteStatus>,
        instant_time: &InstantTime,
    ) -> IndexResult<Vec<WriteStatus>> {
        let mut history = self.history.lock();
        for status in &statuses {
            let location = RecordLocation {
                instant_time: instant_time.clone(),
                file_id: status.file_id.clone(),
            };
            for key in &status.written_keys {
                history.entry(key.clone()).or_default().push(LocationEntry {
                    instant_time: instant_time.clone(),
                    location: Some(location.clone()),
                });
            }
            for key in &status.deleted_keys {
                history.entry(key.clone()).or_default().push(LocationEntry {
                    instant_time: instant_time.clone(),
                    location: None,
                });
            }
        }
        Ok(statuses)
    }

    async fn rollback_commit(&self, instant_time: &InstantTime) -> IndexResult<bool> {
        let mut history = self.history.lock();
        for entries in history.values_mut() {
            entries.retain(|e| e.instant_time != *instant_time);
        }
        history.retain(|_, entries| !entries.is_empty());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn status(file_id: &str, written: &[&str], deleted: &[&str]) -> WriteStatus {
        WriteStatus {
            file_id: file_id.to_string(),
            partition_path: "p".to_string(),
            written_keys: written.iter().map(|k| RecordKey::new(*k, "p")).collect(),
            deleted_keys: deleted.iter().map(|k| RecordKey::new(*k, "p")).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rollback_restores_previous_location() -> TestResult {
        let index = InMemoryIndex::new();
        let c1 = InstantTime::new("001");
        let c2 = InstantTime::new("002");
        index
            .update_location(vec![status("f1", &["a", "b"], &[])], &c1)
            .await?;
        index
            .update_location(vec![status("f1", &["a"], &["b"])], &c2)
            .await?;

        let key_a = RecordKey::new("a", "p");
        assert_eq!(index.location(&key_a).map(|l| l.instant_time), Some(c2.clone()));
        assert_eq!(index.len(), 1);

        assert!(index.rollback_commit(&c2).await?);
        assert_eq!(
            index.location(&key_a),
            Some(RecordLocation {
                instant_time: c1.clone(),
                file_id: "f1".to_string()
            })
        );
        assert_eq!(index.len(), 2);

        let tagged = index
            .tag_location(vec![
                Record::new(key_a.clone(), json!({})),
                Record::new(RecordKey::new("new", "p"), json!({})),
            ])
            .await?;
        assert!(tagged[0].location.is_some());
        assert!(tagged[1].location.is_none());
        Ok(())
    }
}
