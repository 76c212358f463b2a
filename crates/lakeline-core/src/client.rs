//! Write client: the entry point of a writer process.
//!
//! [`WriteClient`] wraps a [`Table`] and adds the housekeeping a writer does
//! around each commit:
//!
//! - [`WriteClient::start_commit`] allocates a fresh instant and, in
//!   single-writer mode, first rolls back writes a previous process left
//!   pending;
//! - after every commit, merge-on-read tables compact inline once enough
//!   delta commits piled up since the last compaction, and the cleaner runs
//!   when auto-clean is on.
//!
//! Only [`WriteClient::start_commit`] refreshes the timeline snapshot from
//! storage; between commits the client assumes no other process advanced it.

use std::collections::BTreeMap;

use log::{info, warn};
use snafu::prelude::*;

use crate::action::{ActionResult, SavepointPreconditionSnafu, TimelineSnafu};
use crate::config::{TableType, WriteConcurrencyMode};
use crate::engine::{WriteEngine, WriteResults};
use crate::metadata::{
    CleanMetadata, CommitMetadata, RestoreMetadata, RollbackMetadata, SavepointMetadata,
    WriteOperationType,
};
use crate::model::WriteStatus;
use crate::table::Table;
use crate::timeline::{ActionType, InstantTime};

/// Writer-side façade over a [`Table`].
pub struct WriteClient<E: WriteEngine> {
    table: Table<E>,
}

impl<E: WriteEngine> WriteClient<E> {
    /// Wrap an opened table.
    pub fn new(table: Table<E>) -> Self {
        WriteClient { table }
    }

    /// The wrapped table.
    pub fn table(&self) -> &Table<E> {
        &self.table
    }

    /// Mutable access to the wrapped table.
    pub fn table_mut(&mut self) -> &mut Table<E> {
        &mut self.table
    }

    /// Unwrap the table.
    pub fn into_table(self) -> Table<E> {
        self.table
    }

    /// Refresh the timeline, roll back stale writes in single-writer mode and
    /// record a new REQUESTED commit. Returns its instant time.
    pub async fn start_commit(&mut self) -> ActionResult<InstantTime> {
        self.table.reload_timeline().await?;
        if self.table.write_config.concurrency_mode == WriteConcurrencyMode::SingleWriter {
            self.rollback_failed_writes().await?;
        }
        let instant_time = self.table.new_instant_time();
        self.start_commit_with_time(&instant_time).await?;
        Ok(instant_time)
    }

    /// Record a new REQUESTED commit at `instant_time`.
    pub async fn start_commit_with_time(&mut self, instant_time: &InstantTime) -> ActionResult<()> {
        let action = self.table.table_config.table_type.commit_action();
        self.table
            .timeline
            .create_requested(instant_time, action, &[])
            .await
            .context(TimelineSnafu)?;
        Ok(())
    }

    /// Insert-or-update records.
    pub async fn upsert(
        &mut self,
        instant_time: &InstantTime,
        records: E::Input,
    ) -> ActionResult<E::Output> {
        let output = self.table.upsert(instant_time, records).await?;
        self.after_write(instant_time).await?;
        Ok(output)
    }

    /// Insert records without looking up existing keys.
    pub async fn insert(
        &mut self,
        instant_time: &InstantTime,
        records: E::Input,
    ) -> ActionResult<E::Output> {
        let output = self.table.insert(instant_time, records).await?;
        self.after_write(instant_time).await?;
        Ok(output)
    }

    /// Bulk load records.
    pub async fn bulk_insert(
        &mut self,
        instant_time: &InstantTime,
        records: E::Input,
    ) -> ActionResult<E::Output> {
        let output = self.table.bulk_insert(instant_time, records).await?;
        self.after_write(instant_time).await?;
        Ok(output)
    }

    /// Delete records by key.
    pub async fn delete(
        &mut self,
        instant_time: &InstantTime,
        keys: E::Keys,
    ) -> ActionResult<E::Output> {
        let output = self.table.delete(instant_time, keys).await?;
        self.after_write(instant_time).await?;
        Ok(output)
    }

    /// Commit a write made with auto-commit disabled, then run post-commit
    /// housekeeping.
    pub async fn commit(
        &mut self,
        instant_time: &InstantTime,
        output: &E::Output,
        operation: WriteOperationType,
        extra_metadata: BTreeMap<String, String>,
    ) -> ActionResult<CommitMetadata> {
        let metadata = self
            .table
            .commit(
                instant_time,
                output.write_statuses(),
                operation,
                extra_metadata,
            )
            .await?;
        self.post_commit().await?;
        Ok(metadata)
    }

    /// Commit raw write statuses.
    pub async fn commit_statuses(
        &mut self,
        instant_time: &InstantTime,
        statuses: &[WriteStatus],
        operation: WriteOperationType,
    ) -> ActionResult<CommitMetadata> {
        let metadata = self
            .table
            .commit(instant_time, statuses, operation, BTreeMap::new())
            .await?;
        self.post_commit().await?;
        Ok(metadata)
    }

    /// Roll back `instant_time` under a fresh rollback instant.
    pub async fn rollback(
        &mut self,
        instant_time: &InstantTime,
    ) -> ActionResult<Option<RollbackMetadata>> {
        let rollback_time = self.table.new_instant_time();
        self.table.rollback(&rollback_time, instant_time).await
    }

    /// Roll back every pending commit and delta commit, newest first.
    /// Returns the instants rolled back.
    pub async fn rollback_failed_writes(&mut self) -> ActionResult<Vec<InstantTime>> {
        let mut pending = self.table.timeline().pending_writes_timeline().timestamps();
        pending.reverse();
        for instant_time in &pending {
            info!("Rolling back failed write {instant_time}");
            self.rollback(instant_time).await?;
        }
        Ok(pending)
    }

    /// Run the cleaner under a fresh instant.
    pub async fn clean(&mut self) -> ActionResult<Option<CleanMetadata>> {
        let instant_time = self.table.new_instant_time();
        self.table.clean(&instant_time).await
    }

    /// Savepoint the completed commit at `instant_time`.
    pub async fn savepoint(
        &mut self,
        instant_time: &InstantTime,
        user: &str,
        comment: &str,
    ) -> ActionResult<SavepointMetadata> {
        self.table.savepoint(instant_time, user, comment).await
    }

    /// Remove the savepoint at `instant_time`.
    pub async fn delete_savepoint(&mut self, instant_time: &InstantTime) -> ActionResult<()> {
        self.table.delete_savepoint(instant_time).await
    }

    /// Restore the table to the savepoint at `instant_time`.
    pub async fn restore_to_savepoint(
        &mut self,
        instant_time: &InstantTime,
    ) -> ActionResult<RestoreMetadata> {
        ensure!(
            self.table
                .timeline()
                .savepoint_timeline()
                .contains_timestamp(instant_time),
            SavepointPreconditionSnafu {
                instant: instant_time.to_string(),
                reason: "no savepoint to restore to",
            }
        );
        let restore_time = self.table.new_instant_time();
        self.table.restore(&restore_time, instant_time).await
    }

    /// Schedule a compaction under a fresh instant. Returns the instant, or
    /// `None` when there was nothing to compact.
    pub async fn schedule_compaction(&mut self) -> ActionResult<Option<InstantTime>> {
        let instant_time = self.table.new_instant_time();
        let plan = self.table.schedule_compaction(&instant_time).await?;
        Ok(plan.map(|_| instant_time))
    }

    /// Run the compaction scheduled at `instant_time`.
    pub async fn compact(&mut self, instant_time: &InstantTime) -> ActionResult<E::Output> {
        let output = self.table.compact(instant_time).await?;
        self.clean_if_enabled().await?;
        Ok(output)
    }

    async fn after_write(&mut self, instant_time: &InstantTime) -> ActionResult<()> {
        let committed = self
            .table
            .timeline()
            .completed_commits_timeline()
            .contains_timestamp(instant_time);
        if committed {
            self.post_commit().await?;
        }
        Ok(())
    }

    async fn post_commit(&mut self) -> ActionResult<()> {
        if let Some(instant_time) = self.inline_compaction_due() {
            match self.table.schedule_compaction(&instant_time).await {
                Ok(Some(_)) => {
                    info!("Running inline compaction {instant_time}");
                    self.table.compact(&instant_time).await?;
                }
                Ok(None) => {}
                Err(e) if e.is_precondition() => {
                    warn!("Skipping inline compaction: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        self.clean_if_enabled().await
    }

    async fn clean_if_enabled(&mut self) -> ActionResult<()> {
        if self.table.write_config.cleaner.auto_clean {
            self.clean().await?;
        }
        Ok(())
    }

    /// A fresh compaction instant when inline compaction is on and at least
    /// `max_delta_commits` delta commits completed since the last compaction.
    fn inline_compaction_due(&self) -> Option<InstantTime> {
        let config = &self.table.write_config.compaction;
        if self.table.table_config.table_type != TableType::MergeOnRead || !config.inline {
            return None;
        }
        let timeline = self.table.timeline();
        let since = timeline
            .filter_by_actions(&[ActionType::Compaction])
            .last_instant()
            .map(|i| i.timestamp.clone());
        let delta_commits = timeline
            .completed_commits_timeline()
            .filter_by_actions(&[ActionType::DeltaCommit])
            .filter(|i| since.as_ref().is_none_or(|s| i.timestamp > *s))
            .count_instants();
        (delta_commits >= config.max_delta_commits).then(|| self.table.new_instant_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::config::{TableConfig, WriteConfig};
    use crate::metadata::CleaningPolicy;
    use crate::engine::LocalEngine;
    use crate::index::InMemoryIndex;
    use crate::model::{Record, RecordKey};
    use crate::storage::TableLocation;
    use crate::timeline::InstantState;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn client(
        tmp: &TempDir,
        table_type: TableType,
        write_config: WriteConfig,
    ) -> Result<WriteClient<LocalEngine>, Box<dyn std::error::Error>> {
        let table = Table::create(
            TableLocation::local(tmp.path()),
            TableConfig::new("t", table_type),
            write_config,
            LocalEngine::new(),
            Arc::new(InMemoryIndex::new()),
        )
        .await?;
        Ok(WriteClient::new(table))
    }

    fn record(key: &str, value: i64) -> Record {
        Record::new(RecordKey::new(key, "p"), json!({ "v": value }))
    }

    #[tokio::test]
    async fn start_commit_rolls_back_stale_writes() -> TestResult {
        let tmp = TempDir::new()?;
        let mut client = client(
            &tmp,
            TableType::CopyOnWrite,
            WriteConfig::default().with_auto_commit(false),
        )
        .await?;

        let first = client.start_commit().await?;
        client.insert(&first, vec![record("a", 1)]).await?;
        assert!(client.table().timeline().is_pending(&first));

        let second = client.start_commit().await?;
        assert!(second > first);
        let timeline = client.table().timeline();
        assert!(timeline.commits_timeline().get(&first, ActionType::Commit).is_none());
        assert_eq!(
            timeline.rollback_timeline().filter_completed().count_instants(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn inline_compaction_runs_after_enough_delta_commits() -> TestResult {
        let tmp = TempDir::new()?;
        let mut client = client(
            &tmp,
            TableType::MergeOnRead,
            WriteConfig::default().with_inline_compaction(2),
        )
        .await?;

        let c1 = client.start_commit().await?;
        client.insert(&c1, vec![record("a", 1)]).await?;
        let c2 = client.start_commit().await?;
        client.upsert(&c2, vec![record("a", 2)]).await?;

        let compactions = client
            .table()
            .timeline()
            .filter_by_actions(&[ActionType::Compaction]);
        assert_eq!(compactions.count_instants(), 1);
        assert_eq!(
            compactions.last_instant().map(|i| i.state),
            Some(InstantState::Completed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn auto_clean_runs_after_commit() -> TestResult {
        let tmp = TempDir::new()?;
        let config = WriteConfig::default()
            .with_cleaner_policy(CleaningPolicy::KeepLatestCommits, 1)
            .with_auto_clean(true);
        let mut client = client(&tmp, TableType::CopyOnWrite, config).await?;

        for v in 0..4 {
            let ts = client.start_commit().await?;
            client.upsert(&ts, vec![record("a", v)]).await?;
        }
        let cleans = client.table().timeline().clean_timeline().filter_completed();
        assert!(cleans.count_instants() >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn restore_requires_a_savepoint() -> TestResult {
        let tmp = TempDir::new()?;
        let mut client = client(&tmp, TableType::CopyOnWrite, WriteConfig::default()).await?;
        let ts = client.start_commit().await?;
        client.insert(&ts, vec![record("a", 1)]).await?;

        let err = client.restore_to_savepoint(&ts).await.unwrap_err();
        assert!(err.is_precondition());
        Ok(())
    }
}
