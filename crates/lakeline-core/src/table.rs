//! Engine-agnostic table façade.
//!
//! A [`Table`] binds together everything an action needs: the table root,
//! its persisted [`TableConfig`], the writer's [`WriteConfig`], the active
//! timeline, an execution engine, a record-location index and a consistency
//! guard. Every operation runs one action executor from [`crate::action`]
//! and advances the timeline as a side effect.
//!
//! `Table` is not internally synchronized: one control task drives all
//! transitions of a table.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use snafu::prelude::*;

use crate::action::{
    ActionResult, TimelineSnafu, clean, commit, compact, restore, rollback, savepoint,
};
use crate::config::{ConfigError, TableConfig, TableType, WriteConfig};
use crate::consistency::{ConsistencyGuard, FileLister, consistency_guard};
use crate::engine::{KeySet, RecordInput, WriteEngine, WriteResults};
use crate::fs_view::{FsViewResult, TableFileSystemView};
use crate::index::RecordIndex;
use crate::metadata::{
    CleanMetadata, CommitMetadata, CompactionPlan, RestoreMetadata, RollbackMetadata,
    SavepointMetadata, WriteOperationType,
};
use crate::model::{Record, WriteStatus};
use crate::storage::{self, StorageError, TableLocation, layout};
use crate::timeline::{ActiveTimeline, InstantTime, Timeline, TimelineError};

/// Errors raised while creating or opening a table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// A table already exists at the location.
    #[snafu(display("Table already exists at {path}"))]
    AlreadyExists {
        /// Path of the existing table config.
        path: String,
    },

    /// No table config was found at the location.
    #[snafu(display("No table found at {path}"))]
    NotFound {
        /// Path of the missing table config.
        path: String,
    },

    /// Reading or writing the table config failed.
    #[snafu(display("Table config storage error: {source}"))]
    ConfigStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The table config is not valid JSON.
    #[snafu(display("Invalid table config: {source}"))]
    ConfigJson {
        /// Underlying serde_json error.
        source: serde_json::Error,
    },

    /// The write config is invalid.
    #[snafu(display("Invalid write config: {source}"))]
    WriteConfigInvalid {
        /// Underlying config error.
        #[snafu(backtrace)]
        source: ConfigError,
    },

    /// Loading the timeline failed.
    #[snafu(display("Failed to load timeline: {source}"))]
    TimelineLoad {
        /// Underlying timeline error.
        #[snafu(backtrace)]
        source: TimelineError,
    },
}

/// Result alias for table creation and opening.
pub type TableResult<T> = Result<T, TableError>;

/// A table plus the collaborators actions run against.
pub struct Table<E: WriteEngine> {
    pub(crate) location: TableLocation,
    pub(crate) table_config: TableConfig,
    pub(crate) write_config: WriteConfig,
    pub(crate) timeline: ActiveTimeline,
    pub(crate) engine: E,
    pub(crate) index: Arc<dyn RecordIndex>,
    pub(crate) guard: Arc<dyn ConsistencyGuard>,
}

impl<E: WriteEngine> Table<E> {
    /// Create a new table at `location`, persisting `table_config`.
    ///
    /// Fails with [`TableError::AlreadyExists`] if a table config is already
    /// present.
    pub async fn create(
        location: TableLocation,
        table_config: TableConfig,
        write_config: WriteConfig,
        engine: E,
        index: Arc<dyn RecordIndex>,
    ) -> TableResult<Self> {
        write_config.validate().context(WriteConfigInvalidSnafu)?;
        let rel = layout::table_config_rel_path();
        let json = serde_json::to_vec_pretty(&table_config).context(ConfigJsonSnafu)?;
        match storage::write_new_atomic(location.storage(), &rel, &json).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                return AlreadyExistsSnafu {
                    path: location.resolve(&rel).display().to_string(),
                }
                .fail();
            }
            Err(e) => return Err(e).context(ConfigStorageSnafu),
        }
        info!(
            "Created {:?} table '{}' at {}",
            table_config.table_type,
            table_config.name,
            location.resolve(&rel).display()
        );
        Self::assemble(location, table_config, write_config, engine, index).await
    }

    /// Open an existing table.
    pub async fn open(
        location: TableLocation,
        write_config: WriteConfig,
        engine: E,
        index: Arc<dyn RecordIndex>,
    ) -> TableResult<Self> {
        write_config.validate().context(WriteConfigInvalidSnafu)?;
        let table_config = Self::read_table_config(&location).await?;
        Self::assemble(location, table_config, write_config, engine, index).await
    }

    /// Read the persisted config of the table at `location`.
    pub async fn read_table_config(location: &TableLocation) -> TableResult<TableConfig> {
        let rel = layout::table_config_rel_path();
        let bytes = match storage::read_all_bytes(location.storage(), &rel).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return NotFoundSnafu {
                    path: location.resolve(&rel).display().to_string(),
                }
                .fail();
            }
            Err(e) => return Err(e).context(ConfigStorageSnafu),
        };
        serde_json::from_slice(&bytes).context(ConfigJsonSnafu)
    }

    async fn assemble(
        location: TableLocation,
        table_config: TableConfig,
        write_config: WriteConfig,
        engine: E,
        index: Arc<dyn RecordIndex>,
    ) -> TableResult<Self> {
        let timeline = ActiveTimeline::load(location.clone())
            .await
            .context(TimelineLoadSnafu)?;
        let lister: Arc<dyn FileLister> = Arc::new(location.clone());
        let guard = consistency_guard(lister, &write_config.consistency);
        Ok(Table {
            location,
            table_config,
            write_config,
            timeline,
            engine,
            index,
            guard,
        })
    }

    /// Replace the consistency guard built from the write config.
    pub fn with_consistency_guard(mut self, guard: Arc<dyn ConsistencyGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Table root.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// Persisted table config.
    pub fn table_config(&self) -> &TableConfig {
        &self.table_config
    }

    /// Table layout.
    pub fn table_type(&self) -> TableType {
        self.table_config.table_type
    }

    /// Writer config.
    pub fn write_config(&self) -> &WriteConfig {
        &self.write_config
    }

    /// Current timeline snapshot.
    pub fn timeline(&self) -> &Timeline {
        self.timeline.timeline()
    }

    /// The active timeline.
    pub fn active_timeline(&self) -> &ActiveTimeline {
        &self.timeline
    }

    /// The execution engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The record-location index.
    pub fn index(&self) -> &Arc<dyn RecordIndex> {
        &self.index
    }

    /// Refresh the timeline snapshot from storage.
    pub async fn reload_timeline(&mut self) -> ActionResult<()> {
        self.timeline.reload().await.context(TimelineSnafu)
    }

    /// A fresh instant time, later than every instant on the timeline.
    pub fn new_instant_time(&self) -> InstantTime {
        self.timeline.new_instant_time()
    }

    /// File system view at the current timeline snapshot.
    pub async fn file_system_view(&self) -> FsViewResult<TableFileSystemView> {
        TableFileSystemView::load(&self.timeline).await
    }

    /// Insert-or-update records at `instant_time`.
    pub async fn upsert(
        &mut self,
        instant_time: &InstantTime,
        input: E::Input,
    ) -> ActionResult<E::Output> {
        self.write_records(instant_time, input.into_records(), WriteOperationType::Upsert)
            .await
    }

    /// Insert records without looking up existing keys.
    pub async fn insert(
        &mut self,
        instant_time: &InstantTime,
        input: E::Input,
    ) -> ActionResult<E::Output> {
        self.write_records(instant_time, input.into_records(), WriteOperationType::Insert)
            .await
    }

    /// Bulk-load records; no workload profile is persisted.
    pub async fn bulk_insert(
        &mut self,
        instant_time: &InstantTime,
        input: E::Input,
    ) -> ActionResult<E::Output> {
        self.write_records(
            instant_time,
            input.into_records(),
            WriteOperationType::BulkInsert,
        )
        .await
    }

    /// Delete records by key.
    pub async fn delete(
        &mut self,
        instant_time: &InstantTime,
        keys: E::Keys,
    ) -> ActionResult<E::Output> {
        let records = keys.into_keys().into_iter().map(Record::delete).collect();
        self.write_records(instant_time, records, WriteOperationType::Delete)
            .await
    }

    async fn write_records(
        &mut self,
        instant_time: &InstantTime,
        records: Vec<Record>,
        operation: WriteOperationType,
    ) -> ActionResult<E::Output> {
        let statuses = commit::write(self, instant_time, records, operation).await?;
        Ok(E::Output::from_write_statuses(statuses))
    }

    /// Commit an instant whose data was written with auto-commit disabled.
    pub async fn commit(
        &mut self,
        instant_time: &InstantTime,
        statuses: &[WriteStatus],
        operation: WriteOperationType,
        extra_metadata: BTreeMap<String, String>,
    ) -> ActionResult<CommitMetadata> {
        commit::commit(self, instant_time, statuses, operation, extra_metadata).await
    }

    /// Schedule a compaction at `instant_time`. Returns `None` when there is
    /// nothing to compact.
    pub async fn schedule_compaction(
        &mut self,
        instant_time: &InstantTime,
    ) -> ActionResult<Option<CompactionPlan>> {
        compact::schedule(self, instant_time).await
    }

    /// Run the compaction scheduled at `instant_time`.
    pub async fn compact(&mut self, instant_time: &InstantTime) -> ActionResult<E::Output> {
        let statuses = compact::execute(self, instant_time).await?;
        Ok(E::Output::from_write_statuses(statuses))
    }

    /// Resume pending cleans, then plan and run a clean at `instant_time`.
    /// Returns `None` when there was nothing to clean.
    pub async fn clean(&mut self, instant_time: &InstantTime) -> ActionResult<Option<CleanMetadata>> {
        clean::clean(self, instant_time).await
    }

    /// Roll back `instant_time` under a rollback instant at `rollback_time`.
    /// Returns `None` when the instant is not on the timeline.
    pub async fn rollback(
        &mut self,
        rollback_time: &InstantTime,
        instant_time: &InstantTime,
    ) -> ActionResult<Option<RollbackMetadata>> {
        rollback::rollback(self, rollback_time, instant_time).await
    }

    /// Savepoint the completed commit at `instant_time`.
    pub async fn savepoint(
        &mut self,
        instant_time: &InstantTime,
        user: &str,
        comment: &str,
    ) -> ActionResult<SavepointMetadata> {
        savepoint::create(self, instant_time, user, comment).await
    }

    /// Remove the savepoint at `instant_time`.
    pub async fn delete_savepoint(&mut self, instant_time: &InstantTime) -> ActionResult<()> {
        savepoint::delete(self, instant_time).await
    }

    /// Roll back every commit after `instant_time` under a restore instant at
    /// `restore_time`.
    pub async fn restore(
        &mut self,
        restore_time: &InstantTime,
        instant_time: &InstantTime,
    ) -> ActionResult<RestoreMetadata> {
        restore::restore(self, restore_time, instant_time).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableType;
    use crate::engine::LocalEngine;
    use crate::index::InMemoryIndex;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn create_then_open_round_trips_the_config() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let config = TableConfig::new("trips", TableType::MergeOnRead);

        Table::create(
            location.clone(),
            config.clone(),
            WriteConfig::default(),
            LocalEngine::new(),
            Arc::new(InMemoryIndex::new()),
        )
        .await?;

        let again = Table::create(
            location.clone(),
            config.clone(),
            WriteConfig::default(),
            LocalEngine::new(),
            Arc::new(InMemoryIndex::new()),
        )
        .await;
        assert!(matches!(again, Err(TableError::AlreadyExists { .. })));

        let table = Table::open(
            location,
            WriteConfig::default(),
            LocalEngine::new(),
            Arc::new(InMemoryIndex::new()),
        )
        .await?;
        assert_eq!(table.table_config(), &config);
        assert!(table.timeline().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn open_without_config_fails() -> TestResult {
        let tmp = TempDir::new()?;
        let result = Table::open(
            TableLocation::local(tmp.path()),
            WriteConfig::default(),
            LocalEngine::new(),
            Arc::new(InMemoryIndex::new()),
        )
        .await;
        assert!(matches!(result, Err(TableError::NotFound { .. })));
        Ok(())
    }
}
