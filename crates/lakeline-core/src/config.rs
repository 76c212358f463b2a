//! Table and write configuration.
//!
//! Two layers:
//!
//! - [`TableConfig`] is fixed when a table is created and persisted as
//!   `.lakeline/table.json` (name, table type, base file extension).
//! - [`WriteConfig`] belongs to a writer session. It can be built in code via
//!   `Default` plus the `with_*` methods, or parsed from JSON where every
//!   field is optional and falls back to its default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::metadata::CleaningPolicy;
use crate::schema::WriterSchema;
use crate::timeline::ActionType;

/// Errors raised while parsing or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration JSON could not be parsed.
    #[snafu(display("Invalid configuration JSON: {source}"))]
    InvalidJson {
        /// Underlying serde_json error.
        source: serde_json::Error,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// A value is out of range.
    #[snafu(display("Invalid configuration: {msg}"))]
    InvalidValue {
        /// What is wrong.
        msg: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

/// Storage layout of a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    /// Updates rewrite base files.
    #[default]
    CopyOnWrite,
    /// Updates append to log files; compaction folds them into base files.
    MergeOnRead,
}

impl TableType {
    /// Action recorded by a data write on this table type.
    pub fn commit_action(&self) -> ActionType {
        match self {
            TableType::CopyOnWrite => ActionType::Commit,
            TableType::MergeOnRead => ActionType::DeltaCommit,
        }
    }
}

/// Persisted, immutable properties of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name.
    pub name: String,
    /// Storage layout.
    pub table_type: TableType,
    /// Extension of base files, including the dot.
    #[serde(default = "default_base_file_extension")]
    pub base_file_extension: String,
    /// Layout version.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

fn default_base_file_extension() -> String {
    ".jsonl".to_string()
}

fn default_format_version() -> u32 {
    1
}

impl TableConfig {
    /// Config for a new table.
    pub fn new(name: impl Into<String>, table_type: TableType) -> Self {
        TableConfig {
            name: name.into(),
            table_type,
            base_file_extension: default_base_file_extension(),
            format_version: default_format_version(),
        }
    }
}

/// Whether more than one writer may work on the table at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteConcurrencyMode {
    /// One writer; pending writes found when starting a commit are stale and
    /// rolled back first.
    #[default]
    SingleWriter,
    /// Several writers on distinct instants; foreign pending instants are
    /// left alone.
    MultiWriter,
}

/// How the consistency guard waits for file visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyPolicy {
    /// Assume read-after-write consistency and return immediately.
    #[default]
    Optimistic,
    /// Poll listings with exponential backoff until files appear/disappear.
    FailSafe,
}

/// Consistency guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyGuardConfig {
    /// Waiting strategy.
    pub policy: ConsistencyPolicy,
    /// First delay between listings.
    pub initial_check_interval_ms: u64,
    /// Upper bound of the delay.
    pub max_check_interval_ms: u64,
    /// Listings attempted before giving up.
    pub max_checks: u32,
}

impl Default for ConsistencyGuardConfig {
    fn default() -> Self {
        ConsistencyGuardConfig {
            policy: ConsistencyPolicy::Optimistic,
            initial_check_interval_ms: 400,
            max_check_interval_ms: 20_000,
            max_checks: 6,
        }
    }
}

impl ConsistencyGuardConfig {
    /// First delay between listings.
    pub fn initial_check_interval(&self) -> Duration {
        Duration::from_millis(self.initial_check_interval_ms)
    }

    /// Upper bound of the delay.
    pub fn max_check_interval(&self) -> Duration {
        Duration::from_millis(self.max_check_interval_ms)
    }
}

/// Cleaner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Retention policy.
    pub policy: CleaningPolicy,
    /// Commits retained under [`CleaningPolicy::KeepLatestCommits`].
    pub commits_retained: usize,
    /// Versions kept under [`CleaningPolicy::KeepLatestFileVersions`].
    pub file_versions_retained: usize,
    /// Run a clean after every successful commit.
    pub auto_clean: bool,
    /// Concurrent deletions while executing a plan.
    pub parallelism: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        CleanerConfig {
            policy: CleaningPolicy::KeepLatestCommits,
            commits_retained: 10,
            file_versions_retained: 3,
            auto_clean: true,
            parallelism: 16,
        }
    }
}

/// Compaction settings (merge-on-read only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Schedule and run compaction from the write client after commits.
    pub inline: bool,
    /// Delta commits since the last compaction that trigger a new one.
    pub max_delta_commits: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            inline: false,
            max_delta_commits: 5,
        }
    }
}

/// Rollback settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Use write markers instead of partition listings when they exist.
    pub use_marker_based: bool,
    /// Concurrent partition tasks.
    pub parallelism: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        RollbackConfig {
            use_marker_based: false,
            parallelism: 8,
        }
    }
}

/// Settings of a writer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Commit as soon as the engine has written the data.
    pub auto_commit: bool,
    /// Commit even when write statuses report failed records.
    pub commit_on_errors: bool,
    /// Writer concurrency.
    pub concurrency_mode: WriteConcurrencyMode,
    /// Check the writer schema against the table schema before writing.
    pub validate_schema: bool,
    /// Schema of the records this writer produces.
    pub writer_schema: Option<WriterSchema>,
    /// Cleaner settings.
    pub cleaner: CleanerConfig,
    /// Compaction settings.
    pub compaction: CompactionConfig,
    /// Consistency guard settings.
    pub consistency: ConsistencyGuardConfig,
    /// Rollback settings.
    pub rollback: RollbackConfig,
}

impl Default for WriteConfig {
    fn default() -> Self {
        WriteConfig {
            auto_commit: true,
            commit_on_errors: false,
            concurrency_mode: WriteConcurrencyMode::SingleWriter,
            validate_schema: true,
            writer_schema: None,
            cleaner: CleanerConfig::default(),
            compaction: CompactionConfig::default(),
            consistency: ConsistencyGuardConfig::default(),
            rollback: RollbackConfig::default(),
        }
    }
}

impl WriteConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: WriteConfig = serde_json::from_str(json).context(InvalidJsonSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.cleaner.commits_retained > 0,
            InvalidValueSnafu {
                msg: "cleaner.commits_retained must be at least 1"
            }
        );
        ensure!(
            self.cleaner.file_versions_retained > 0,
            InvalidValueSnafu {
                msg: "cleaner.file_versions_retained must be at least 1"
            }
        );
        ensure!(
            self.cleaner.parallelism > 0 && self.rollback.parallelism > 0,
            InvalidValueSnafu {
                msg: "parallelism must be at least 1"
            }
        );
        ensure!(
            self.consistency.max_checks > 0,
            InvalidValueSnafu {
                msg: "consistency.max_checks must be at least 1"
            }
        );
        ensure!(
            self.consistency.initial_check_interval_ms <= self.consistency.max_check_interval_ms,
            InvalidValueSnafu {
                msg: "consistency.initial_check_interval_ms exceeds max_check_interval_ms"
            }
        );
        ensure!(
            self.compaction.max_delta_commits > 0,
            InvalidValueSnafu {
                msg: "compaction.max_delta_commits must be at least 1"
            }
        );
        Ok(())
    }

    /// Set [`WriteConfig::auto_commit`].
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Set [`WriteConfig::commit_on_errors`].
    pub fn with_commit_on_errors(mut self, commit_on_errors: bool) -> Self {
        self.commit_on_errors = commit_on_errors;
        self
    }

    /// Set [`WriteConfig::concurrency_mode`].
    pub fn with_concurrency_mode(mut self, mode: WriteConcurrencyMode) -> Self {
        self.concurrency_mode = mode;
        self
    }

    /// Set the writer schema.
    pub fn with_writer_schema(mut self, schema: WriterSchema) -> Self {
        self.writer_schema = Some(schema);
        self
    }

    /// Set the cleaning policy and its retention count.
    pub fn with_cleaner_policy(mut self, policy: CleaningPolicy, retained: usize) -> Self {
        self.cleaner.policy = policy;
        match policy {
            CleaningPolicy::KeepLatestCommits => self.cleaner.commits_retained = retained,
            CleaningPolicy::KeepLatestFileVersions => {
                self.cleaner.file_versions_retained = retained
            }
        }
        self
    }

    /// Enable or disable cleaning after each commit.
    pub fn with_auto_clean(mut self, auto_clean: bool) -> Self {
        self.cleaner.auto_clean = auto_clean;
        self
    }

    /// Enable inline compaction every `max_delta_commits` delta commits.
    pub fn with_inline_compaction(mut self, max_delta_commits: usize) -> Self {
        self.compaction.inline = true;
        self.compaction.max_delta_commits = max_delta_commits;
        self
    }

    /// Replace the consistency guard settings.
    pub fn with_consistency(mut self, consistency: ConsistencyGuardConfig) -> Self {
        self.consistency = consistency;
        self
    }

    /// Choose marker-based rollback.
    pub fn with_marker_based_rollback(mut self, enabled: bool) -> Self {
        self.rollback.use_marker_based = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn partial_json_falls_back_to_defaults() -> TestResult {
        let config = WriteConfig::from_json_str(
            r#"{
                "auto_commit": false,
                "cleaner": { "policy": "KEEP_LATEST_FILE_VERSIONS", "file_versions_retained": 2 },
                "consistency": { "policy": "FAIL_SAFE" }
            }"#,
        )?;
        assert!(!config.auto_commit);
        assert_eq!(config.cleaner.policy, CleaningPolicy::KeepLatestFileVersions);
        assert_eq!(config.cleaner.file_versions_retained, 2);
        assert_eq!(config.cleaner.commits_retained, 10);
        assert_eq!(config.consistency.policy, ConsistencyPolicy::FailSafe);
        assert_eq!(config.consistency.max_checks, 6);
        assert_eq!(config.concurrency_mode, WriteConcurrencyMode::SingleWriter);
        Ok(())
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = WriteConfig::from_json_str(r#"{ "cleaner": { "commits_retained": 0 } }"#)
            .expect_err("zero retention is invalid");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = WriteConfig::from_json_str("{ not json").expect_err("bad json");
        assert!(matches!(err, ConfigError::InvalidJson { .. }));
    }

    #[test]
    fn builders_compose() -> TestResult {
        let config = WriteConfig::default()
            .with_auto_commit(false)
            .with_cleaner_policy(CleaningPolicy::KeepLatestCommits, 2)
            .with_inline_compaction(3)
            .with_marker_based_rollback(true);
        config.validate()?;
        assert_eq!(config.cleaner.commits_retained, 2);
        assert!(config.compaction.inline);
        assert!(config.rollback.use_marker_based);
        Ok(())
    }

    #[test]
    fn table_type_decides_commit_action() -> TestResult {
        assert_eq!(TableType::CopyOnWrite.commit_action(), ActionType::Commit);
        assert_eq!(TableType::MergeOnRead.commit_action(), ActionType::DeltaCommit);

        let config: TableConfig =
            serde_json::from_str(r#"{ "name": "trips", "table_type": "MERGE_ON_READ" }"#)?;
        assert_eq!(config, TableConfig::new("trips", TableType::MergeOnRead));
        Ok(())
    }
}
