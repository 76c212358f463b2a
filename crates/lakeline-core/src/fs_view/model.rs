use std::collections::BTreeMap;

use crate::storage::layout;
use crate::timeline::InstantTime;

/// A columnar/row base file of a file slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseFile {
    /// Partition path.
    pub partition_path: String,
    /// File group id.
    pub file_id: String,
    /// Instant that wrote the file.
    pub instant_time: InstantTime,
    /// File name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Resolved path of the external file a bootstrapped skeleton base file
    /// stands for.
    pub bootstrap_source: Option<String>,
}

impl BaseFile {
    /// Table-relative path as a `/`-separated string.
    pub fn rel_path(&self) -> String {
        rel_path_string(&self.partition_path, &self.file_name)
    }
}

/// A delta log file of a merge-on-read file slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Partition path.
    pub partition_path: String,
    /// File group id.
    pub file_id: String,
    /// Base instant of the slice.
    pub base_instant_time: InstantTime,
    /// Version within the slice.
    pub version: u32,
    /// File name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
}

impl LogFile {
    /// Table-relative path as a `/`-separated string.
    pub fn rel_path(&self) -> String {
        rel_path_string(&self.partition_path, &self.file_name)
    }
}

pub(crate) fn rel_path_string(partition_path: &str, file_name: &str) -> String {
    layout::data_file_rel_path(partition_path, file_name)
        .to_string_lossy()
        .replace('\\', "/")
}

/// One version of a file group: an optional base file plus the log files
/// written on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// Partition path.
    pub partition_path: String,
    /// File group id.
    pub file_id: String,
    /// Instant the slice is based on.
    pub base_instant_time: InstantTime,
    /// Base file, absent for log-only slices and for slices opened by a
    /// pending compaction.
    pub base_file: Option<BaseFile>,
    /// Log files ordered by version.
    pub log_files: Vec<LogFile>,
}

impl FileSlice {
    /// Empty slice.
    pub fn new(
        partition_path: impl Into<String>,
        file_id: impl Into<String>,
        base_instant_time: InstantTime,
    ) -> Self {
        FileSlice {
            partition_path: partition_path.into(),
            file_id: file_id.into(),
            base_instant_time,
            base_file: None,
            log_files: Vec::new(),
        }
    }

    /// True when the slice holds no file.
    pub fn is_empty(&self) -> bool {
        self.base_file.is_none() && self.log_files.is_empty()
    }

    /// True when the slice has log files.
    pub fn has_log_files(&self) -> bool {
        !self.log_files.is_empty()
    }

    /// Highest-version log file.
    pub fn latest_log_file(&self) -> Option<&LogFile> {
        self.log_files.last()
    }

    /// Table-relative paths of every file in the slice, base first.
    pub fn file_rel_paths(&self) -> Vec<String> {
        self.base_file
            .iter()
            .map(BaseFile::rel_path)
            .chain(self.log_files.iter().map(LogFile::rel_path))
            .collect()
    }

    pub(crate) fn add_log_file(&mut self, log_file: LogFile) {
        let pos = self
            .log_files
            .partition_point(|l| l.version <= log_file.version);
        self.log_files.insert(pos, log_file);
    }
}

/// All slices of one file id in one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    /// Partition path.
    pub partition_path: String,
    /// File group id.
    pub file_id: String,
    slices: BTreeMap<InstantTime, FileSlice>,
}

impl FileGroup {
    /// Group without slices.
    pub fn new(partition_path: impl Into<String>, file_id: impl Into<String>) -> Self {
        FileGroup {
            partition_path: partition_path.into(),
            file_id: file_id.into(),
            slices: BTreeMap::new(),
        }
    }

    pub(crate) fn slice_mut(&mut self, base_instant_time: &InstantTime) -> &mut FileSlice {
        let partition = &self.partition_path;
        let file_id = &self.file_id;
        self.slices
            .entry(base_instant_time.clone())
            .or_insert_with(|| FileSlice::new(partition.clone(), file_id.clone(), base_instant_time.clone()))
    }

    /// Newest slice.
    pub fn latest_slice(&self) -> Option<&FileSlice> {
        self.slices.values().next_back()
    }

    /// Slices newest first.
    pub fn slices_newest_first(&self) -> impl Iterator<Item = &FileSlice> + '_ {
        self.slices.values().rev()
    }

    /// Newest slice whose base instant is at or before `max_instant`.
    pub fn latest_slice_before_or_on(&self, max_instant: &InstantTime) -> Option<&FileSlice> {
        self.slices.range(..=max_instant.clone()).next_back().map(|(_, s)| s)
    }

    /// Slice based at exactly `base_instant_time`.
    pub fn slice(&self, base_instant_time: &InstantTime) -> Option<&FileSlice> {
        self.slices.get(base_instant_time)
    }

    /// Number of slices.
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_ordered_by_base_instant() {
        let mut group = FileGroup::new("p", "f1");
        group.slice_mut(&InstantTime::new("003"));
        group.slice_mut(&InstantTime::new("001"));
        group.slice_mut(&InstantTime::new("002"));

        let order: Vec<_> = group
            .slices_newest_first()
            .map(|s| s.base_instant_time.as_str().to_string())
            .collect();
        assert_eq!(order, vec!["003", "002", "001"]);
        assert_eq!(
            group
                .latest_slice_before_or_on(&InstantTime::new("002"))
                .map(|s| s.base_instant_time.as_str()),
            Some("002")
        );
        assert!(group.latest_slice_before_or_on(&InstantTime::new("000")).is_none());
    }

    #[test]
    fn log_files_stay_sorted_by_version() {
        let mut slice = FileSlice::new("p", "f1", InstantTime::new("001"));
        for version in [2, 1, 3] {
            slice.add_log_file(LogFile {
                partition_path: "p".to_string(),
                file_id: "f1".to_string(),
                base_instant_time: InstantTime::new("001"),
                version,
                file_name: format!(".f1_001.log.{version}_0-0"),
                size: 0,
            });
        }
        assert_eq!(slice.latest_log_file().map(|l| l.version), Some(3));
        assert_eq!(slice.file_rel_paths()[0], "p/.f1_001.log.1_0-0");
    }
}
