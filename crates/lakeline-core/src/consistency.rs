//! Consistency guard for eventually-consistent listings.
//!
//! On stores where a freshly written (or deleted) file may not show up in a
//! listing right away, every action that creates or removes data files waits
//! on a [`ConsistencyGuard`] before it transitions its instant to COMPLETED.
//!
//! - [`OptimisticConsistencyGuard`] trusts the store and returns immediately.
//! - [`FailSafeConsistencyGuard`] lists the partition until every expected
//!   file has the requested visibility, sleeping with exponential backoff
//!   between listings, and fails with [`ConsistencyError::Timeout`] after the
//!   configured number of checks.
//!
//! Listings go through the [`FileLister`] trait so tests (and other
//! backends) can inject their own view of the store.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use snafu::{Backtrace, prelude::*};

use crate::config::{ConsistencyGuardConfig, ConsistencyPolicy};
use crate::storage::{self, StorageError, StorageResult, TableLocation, layout};

/// Visibility a guard waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVisibility {
    /// Files must be listed.
    Appear,
    /// Files must no longer be listed.
    Disappear,
}

impl fmt::Display for FileVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileVisibility::Appear => f.write_str("appear"),
            FileVisibility::Disappear => f.write_str("disappear"),
        }
    }
}

/// Errors raised by the consistency guard.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConsistencyError {
    /// Files did not reach the expected visibility within the configured
    /// number of checks.
    #[snafu(display(
        "Timed out after {checks} checks waiting for {} file(s) in partition '{partition}' to {visibility}",
        pending.len()
    ))]
    Timeout {
        /// Partition that was listed.
        partition: String,
        /// Expected visibility.
        visibility: FileVisibility,
        /// Files still not in the expected state at the last check.
        pending: Vec<String>,
        /// Listings performed.
        checks: u32,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Listing the partition failed.
    #[snafu(display("Failed to list partition '{partition}': {source}"))]
    Listing {
        /// Partition that was listed.
        partition: String,
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },
}

/// Source of partition listings for the guard.
#[async_trait]
pub trait FileLister: Send + Sync {
    /// Names of the files currently listed in `partition_path`. A missing
    /// partition lists as empty.
    async fn list_file_names(&self, partition_path: &str) -> StorageResult<Vec<String>>;
}

#[async_trait]
impl FileLister for TableLocation {
    async fn list_file_names(&self, partition_path: &str) -> StorageResult<Vec<String>> {
        let entries =
            storage::list_dir_or_empty(self.storage(), &layout::partition_rel_dir(partition_path))
                .await?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name)
            .collect())
    }
}

/// Waits until files reach a visibility state.
#[async_trait]
pub trait ConsistencyGuard: Send + Sync {
    /// Wait until every name in `file_names` has `visibility` in
    /// `partition_path`.
    async fn wait_till(
        &self,
        partition_path: &str,
        file_names: &[String],
        visibility: FileVisibility,
    ) -> Result<(), ConsistencyError>;

    /// Shorthand for [`FileVisibility::Appear`].
    async fn wait_till_all_appear(
        &self,
        partition_path: &str,
        file_names: &[String],
    ) -> Result<(), ConsistencyError> {
        self.wait_till(partition_path, file_names, FileVisibility::Appear)
            .await
    }

    /// Shorthand for [`FileVisibility::Disappear`].
    async fn wait_till_all_disappear(
        &self,
        partition_path: &str,
        file_names: &[String],
    ) -> Result<(), ConsistencyError> {
        self.wait_till(partition_path, file_names, FileVisibility::Disappear)
            .await
    }
}

/// Guard that never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticConsistencyGuard;

#[async_trait]
impl ConsistencyGuard for OptimisticConsistencyGuard {
    async fn wait_till(
        &self,
        _partition_path: &str,
        _file_names: &[String],
        _visibility: FileVisibility,
    ) -> Result<(), ConsistencyError> {
        Ok(())
    }
}

/// Guard that polls listings with exponential backoff.
pub struct FailSafeConsistencyGuard<L> {
    lister: L,
    config: ConsistencyGuardConfig,
}

impl<L: FileLister> FailSafeConsistencyGuard<L> {
    /// Guard polling `lister` with the intervals and check budget of `config`.
    pub fn new(lister: L, config: ConsistencyGuardConfig) -> Self {
        FailSafeConsistencyGuard { lister, config }
    }

    fn pending(
        listed: &HashSet<String>,
        file_names: &[String],
        visibility: FileVisibility,
    ) -> Vec<String> {
        file_names
            .iter()
            .filter(|name| match visibility {
                FileVisibility::Appear => !listed.contains(*name),
                FileVisibility::Disappear => listed.contains(*name),
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<L: FileLister> ConsistencyGuard for FailSafeConsistencyGuard<L> {
    async fn wait_till(
        &self,
        partition_path: &str,
        file_names: &[String],
        visibility: FileVisibility,
    ) -> Result<(), ConsistencyError> {
        if file_names.is_empty() {
            return Ok(());
        }

        let max_interval = self.config.max_check_interval();
        let mut interval = self.config.initial_check_interval();
        let mut checks = 0u32;

        loop {
            checks += 1;
            let listed: HashSet<String> = self
                .lister
                .list_file_names(partition_path)
                .await
                .context(ListingSnafu {
                    partition: partition_path,
                })?
                .into_iter()
                .collect();

            let pending = Self::pending(&listed, file_names, visibility);
            if pending.is_empty() {
                debug!(
                    "All {} file(s) in '{partition_path}' {visibility} after {checks} check(s)",
                    file_names.len()
                );
                return Ok(());
            }

            if checks >= self.config.max_checks {
                return TimeoutSnafu {
                    partition: partition_path,
                    visibility,
                    pending,
                    checks,
                }
                .fail();
            }

            warn!(
                "{} file(s) in '{partition_path}' did not {visibility} yet (check {checks}/{}), retrying in {:?}",
                pending.len(),
                self.config.max_checks,
                interval
            );
            tokio::time::sleep(interval.min(max_interval)).await;
            interval = interval.saturating_mul(2).min(max_interval);
        }
    }
}

/// Build the guard configured by `config`, listing through `lister`.
pub fn consistency_guard(
    lister: Arc<dyn FileLister>,
    config: &ConsistencyGuardConfig,
) -> Arc<dyn ConsistencyGuard> {
    match config.policy {
        ConsistencyPolicy::Optimistic => Arc::new(OptimisticConsistencyGuard),
        ConsistencyPolicy::FailSafe => {
            Arc::new(FailSafeConsistencyGuard::new(lister, config.clone()))
        }
    }
}

#[async_trait]
impl<T: FileLister + ?Sized> FileLister for Arc<T> {
    async fn list_file_names(&self, partition_path: &str) -> StorageResult<Vec<String>> {
        (**self).list_file_names(partition_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted listings; the last one repeats forever.
    struct ScriptedLister {
        listings: Mutex<VecDeque<Vec<String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedLister {
        fn new(listings: Vec<Vec<&str>>) -> Self {
            ScriptedLister {
                listings: Mutex::new(
                    listings
                        .into_iter()
                        .map(|l| l.into_iter().map(str::to_string).collect())
                        .collect(),
                ),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl FileLister for ScriptedLister {
        async fn list_file_names(&self, _partition_path: &str) -> StorageResult<Vec<String>> {
            *self.calls.lock() += 1;
            let mut listings = self.listings.lock();
            if listings.len() > 1 {
                Ok(listings.pop_front().unwrap_or_default())
            } else {
                Ok(listings.front().cloned().unwrap_or_default())
            }
        }
    }

    fn fast_config(max_checks: u32) -> ConsistencyGuardConfig {
        ConsistencyGuardConfig {
            policy: ConsistencyPolicy::FailSafe,
            initial_check_interval_ms: 1,
            max_check_interval_ms: 4,
            max_checks,
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn optimistic_returns_even_when_listing_lags() -> Result<(), ConsistencyError> {
        let guard = consistency_guard(
            Arc::new(ScriptedLister::new(vec![vec![]])),
            &ConsistencyGuardConfig::default(),
        );
        guard.wait_till_all_appear("p", &names(&["a", "b"])).await
    }

    #[tokio::test]
    async fn fail_safe_blocks_until_all_files_appear() -> Result<(), ConsistencyError> {
        let lister = Arc::new(ScriptedLister::new(vec![
            vec![],
            vec!["a"],
            vec!["a", "b", "other"],
        ]));
        let guard = FailSafeConsistencyGuard::new(lister.clone(), fast_config(5));

        guard.wait_till_all_appear("p", &names(&["a", "b"])).await?;
        assert_eq!(*lister.calls.lock(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn fail_safe_waits_for_disappearance() -> Result<(), ConsistencyError> {
        let lister = Arc::new(ScriptedLister::new(vec![vec!["a", "b"], vec!["b"], vec![]]));
        let guard = FailSafeConsistencyGuard::new(lister.clone(), fast_config(5));

        guard.wait_till_all_disappear("p", &names(&["a", "b"])).await?;
        assert_eq!(*lister.calls.lock(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn fail_safe_times_out_after_max_checks() {
        let lister = Arc::new(ScriptedLister::new(vec![vec!["a"]]));
        let guard = FailSafeConsistencyGuard::new(lister.clone(), fast_config(3));

        let err = guard
            .wait_till_all_appear("p", &names(&["a", "b"]))
            .await
            .expect_err("b never appears");
        match err {
            ConsistencyError::Timeout {
                pending, checks, ..
            } => {
                assert_eq!(pending, vec!["b".to_string()]);
                assert_eq!(checks, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*lister.calls.lock(), 3);
    }

    #[tokio::test]
    async fn table_location_lists_partition_files() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::TempDir::new()?;
        tokio::fs::create_dir_all(tmp.path().join("p1/nested")).await?;
        tokio::fs::write(tmp.path().join("p1/f1.jsonl"), b"").await?;

        let location = TableLocation::local(tmp.path());
        assert_eq!(location.list_file_names("p1").await?, vec!["f1.jsonl"]);
        assert!(location.list_file_names("missing").await?.is_empty());
        Ok(())
    }
}
