//! Single-process engine writing JSON-lines data files.
//!
//! Base files hold one [`BaseRecord`] per line, sorted by record key. On a
//! copy-on-write table an update rewrites the file group's base file under a
//! new instant; on a merge-on-read table it appends data and delete blocks
//! to the latest log file of the group's current slice.

use std::collections::BTreeMap;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use async_trait::async_trait;

use crate::config::TableType;
use crate::engine::{
    DataFileSnafu, EngineResult, LogFileSnafu, MarkerSnafu, RecordCodecSnafu, WriteContext,
    WriteEngine,
};
use crate::fs_view::{FileSlice, naming, rel_path_string};
use crate::log_format::{self, LogBlock, LogRecord};
use crate::markers::MarkerType;
use crate::metadata::{CompactionOperation, WriteStat};
use crate::model::{Record, RecordKey, WriteStatus};
use crate::storage::{self, TableLocation, layout};
use crate::timeline::{InstantTime, Timeline};

/// One line of a base file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseRecord {
    /// Record key.
    pub key: RecordKey,
    /// Instant that wrote this version of the record.
    pub commit_time: InstantTime,
    /// Payload.
    pub data: Value,
}

/// Engine writing line-oriented JSON base and log files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEngine;

impl LocalEngine {
    /// Engine with default settings.
    pub fn new() -> Self {
        LocalEngine
    }

    /// Merged snapshot of a file slice: the base file with every committed,
    /// not rolled-back log block applied, sorted by record key.
    pub async fn read_slice(
        location: &TableLocation,
        slice: &FileSlice,
        completed_commits: &Timeline,
    ) -> EngineResult<Vec<BaseRecord>> {
        let base_file = slice.base_file.as_ref().map(|b| b.file_name.clone());
        let log_files: Vec<String> = slice.log_files.iter().map(|l| l.file_name.clone()).collect();
        let rows = merge_slice(
            location,
            &slice.partition_path,
            base_file.as_deref(),
            &log_files,
            completed_commits,
        )
        .await?;
        Ok(rows.into_values().collect())
    }

    async fn create_base_file(
        &self,
        ctx: &WriteContext<'_>,
        partition_path: &str,
        records: Vec<Record>,
        write_token: &str,
    ) -> EngineResult<WriteStatus> {
        let file_id = naming::new_file_id();
        let mut status = WriteStatus {
            file_id: file_id.clone(),
            partition_path: partition_path.to_string(),
            ..Default::default()
        };

        let mut rows = BTreeMap::new();
        for record in records {
            let Some(data) = record.data else { continue };
            status.total_records += 1;
            rows.insert(
                record.key.record_key.clone(),
                BaseRecord {
                    key: record.key,
                    commit_time: ctx.instant_time.clone(),
                    data,
                },
            );
        }
        status.written_keys = rows.values().map(|r| r.key.clone()).collect();

        let file_name = naming::base_file_name(
            &file_id,
            write_token,
            ctx.instant_time,
            ctx.base_file_extension,
        );
        let bytes =
            write_base_file(ctx, partition_path, &file_name, &rows, MarkerType::Create).await?;

        let num_inserts = rows.len() as u64;
        status.stat = WriteStat {
            file_id,
            partition_path: partition_path.to_string(),
            prev_commit: None,
            num_writes: num_inserts,
            num_inserts,
            total_write_bytes: bytes,
            path: Some(rel_path_string(partition_path, &file_name)),
            ..Default::default()
        };
        Ok(status)
    }

    async fn merge_base_file(
        &self,
        ctx: &WriteContext<'_>,
        slice: &FileSlice,
        records: Vec<Record>,
        write_token: &str,
    ) -> EngineResult<WriteStatus> {
        let partition_path = slice.partition_path.as_str();
        let mut rows = match &slice.base_file {
            Some(base) => read_base_file(ctx.location, &base.rel_path()).await?,
            None => BTreeMap::new(),
        };

        let mut status = WriteStatus {
            file_id: slice.file_id.clone(),
            partition_path: partition_path.to_string(),
            ..Default::default()
        };
        let (mut updates, mut inserts, mut deletes) = (0u64, 0u64, 0u64);
        for record in records {
            status.total_records += 1;
            match record.data {
                Some(data) => {
                    let previous = rows.insert(
                        record.key.record_key.clone(),
                        BaseRecord {
                            key: record.key.clone(),
                            commit_time: ctx.instant_time.clone(),
                            data,
                        },
                    );
                    if previous.is_some() {
                        updates += 1;
                    } else {
                        inserts += 1;
                    }
                    status.written_keys.push(record.key);
                }
                None => {
                    if rows.remove(&record.key.record_key).is_some() {
                        deletes += 1;
                        status.deleted_keys.push(record.key);
                    }
                }
            }
        }

        let file_name = naming::base_file_name(
            &slice.file_id,
            write_token,
            ctx.instant_time,
            ctx.base_file_extension,
        );
        let bytes =
            write_base_file(ctx, partition_path, &file_name, &rows, MarkerType::Merge).await?;

        status.stat = WriteStat {
            file_id: slice.file_id.clone(),
            partition_path: partition_path.to_string(),
            prev_commit: Some(slice.base_instant_time.clone()),
            num_writes: rows.len() as u64,
            num_update_writes: updates,
            num_deletes: deletes,
            num_inserts: inserts,
            total_write_bytes: bytes,
            path: Some(rel_path_string(partition_path, &file_name)),
            ..Default::default()
        };
        Ok(status)
    }

    async fn append_log_file(
        &self,
        ctx: &WriteContext<'_>,
        slice: &FileSlice,
        records: Vec<Record>,
        write_token: &str,
    ) -> EngineResult<WriteStatus> {
        let partition_path = slice.partition_path.as_str();
        let log_name = match slice.latest_log_file() {
            Some(log) => log.file_name.clone(),
            None => naming::log_file_name(&slice.file_id, &slice.base_instant_time, 1, write_token),
        };
        let rel = layout::data_file_rel_path(partition_path, &log_name);
        ctx.markers
            .create(partition_path, &log_name, MarkerType::Append)
            .await
            .context(MarkerSnafu {
                path: rel.display().to_string(),
            })?;

        let mut status = WriteStatus {
            file_id: slice.file_id.clone(),
            partition_path: partition_path.to_string(),
            ..Default::default()
        };
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for record in records {
            status.total_records += 1;
            match record.data {
                Some(data) => {
                    status.written_keys.push(record.key.clone());
                    upserts.push(LogRecord {
                        key: record.key,
                        data,
                    });
                }
                None => {
                    status.deleted_keys.push(record.key.clone());
                    deletes.push(record.key);
                }
            }
        }

        let (num_updates, num_deletes) = (upserts.len() as u64, deletes.len() as u64);
        let mut blocks = Vec::new();
        if !upserts.is_empty() {
            blocks.push(LogBlock::Data {
                instant_time: ctx.instant_time.clone(),
                records: upserts,
            });
        }
        if !deletes.is_empty() {
            blocks.push(LogBlock::Delete {
                instant_time: ctx.instant_time.clone(),
                keys: deletes,
            });
        }
        let bytes = log_format::append_blocks(ctx.location, &rel, &blocks)
            .await
            .context(LogFileSnafu)?;
        debug!(
            "Appended {} block(s) to {} for instant {}",
            blocks.len(),
            rel.display(),
            ctx.instant_time
        );

        status.stat = WriteStat {
            file_id: slice.file_id.clone(),
            partition_path: partition_path.to_string(),
            prev_commit: Some(slice.base_instant_time.clone()),
            num_writes: num_updates,
            num_update_writes: num_updates,
            num_deletes,
            total_write_bytes: bytes,
            path: Some(rel_path_string(partition_path, &log_name)),
            ..Default::default()
        };
        Ok(status)
    }
}

#[async_trait]
impl WriteEngine for LocalEngine {
    type Input = Vec<Record>;
    type Keys = Vec<RecordKey>;
    type Output = Vec<WriteStatus>;

    async fn write(
        &self,
        ctx: &WriteContext<'_>,
        records: Vec<Record>,
    ) -> EngineResult<Vec<WriteStatus>> {
        let mut inserts: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        let mut updates: BTreeMap<(String, String), Vec<Record>> = BTreeMap::new();
        for record in records {
            match &record.location {
                Some(location) => updates
                    .entry((record.partition_path().to_string(), location.file_id.clone()))
                    .or_default()
                    .push(record),
                None if record.is_delete() => {
                    debug!("Ignoring delete of unknown key {}", record.key);
                }
                None => inserts
                    .entry(record.partition_path().to_string())
                    .or_default()
                    .push(record),
            }
        }

        let mut statuses = Vec::with_capacity(updates.len() + inserts.len());
        let mut task = 0usize;
        for ((partition_path, file_id), records) in updates {
            let token = naming::write_token(task, 0);
            task += 1;
            let status = match ctx.view.latest_file_slice(&partition_path, &file_id) {
                None => {
                    let mut status = WriteStatus {
                        file_id: file_id.clone(),
                        partition_path: partition_path.clone(),
                        ..Default::default()
                    };
                    status.stat.file_id = file_id;
                    status.stat.partition_path = partition_path;
                    for record in &records {
                        status.mark_failure(&record.key, "file group not found");
                    }
                    status
                }
                Some(slice) => match ctx.table_type {
                    TableType::CopyOnWrite => {
                        self.merge_base_file(ctx, &slice, records, &token).await?
                    }
                    TableType::MergeOnRead => {
                        self.append_log_file(ctx, &slice, records, &token).await?
                    }
                },
            };
            statuses.push(status);
        }
        for (partition_path, records) in inserts {
            let token = naming::write_token(task, 0);
            task += 1;
            statuses.push(
                self.create_base_file(ctx, &partition_path, records, &token)
                    .await?,
            );
        }
        Ok(statuses)
    }

    async fn compact(
        &self,
        ctx: &WriteContext<'_>,
        operation: &CompactionOperation,
    ) -> EngineResult<WriteStatus> {
        let partition_path = operation.partition_path.as_str();
        let rows = merge_slice(
            ctx.location,
            partition_path,
            operation.base_file.as_deref(),
            &operation.log_files,
            ctx.completed_commits,
        )
        .await?;

        let file_name = naming::base_file_name(
            &operation.file_id,
            &naming::write_token(0, 0),
            ctx.instant_time,
            ctx.base_file_extension,
        );
        let bytes =
            write_base_file(ctx, partition_path, &file_name, &rows, MarkerType::Create).await?;

        let num_writes = rows.len() as u64;
        Ok(WriteStatus {
            file_id: operation.file_id.clone(),
            partition_path: partition_path.to_string(),
            stat: WriteStat {
                file_id: operation.file_id.clone(),
                partition_path: partition_path.to_string(),
                prev_commit: Some(operation.base_instant_time.clone()),
                num_writes,
                total_write_bytes: bytes,
                path: Some(rel_path_string(partition_path, &file_name)),
                ..Default::default()
            },
            written_keys: rows.into_values().map(|r| r.key).collect(),
            total_records: num_writes,
            ..Default::default()
        })
    }
}

async fn read_base_file(
    location: &TableLocation,
    rel_path: &str,
) -> EngineResult<BTreeMap<String, BaseRecord>> {
    let text = storage::read_to_string(location.storage(), Path::new(rel_path))
        .await
        .context(DataFileSnafu { path: rel_path })?;
    let mut rows = BTreeMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let row: BaseRecord =
            serde_json::from_str(line).context(RecordCodecSnafu { path: rel_path })?;
        rows.insert(row.key.record_key.clone(), row);
    }
    Ok(rows)
}

async fn write_base_file(
    ctx: &WriteContext<'_>,
    partition_path: &str,
    file_name: &str,
    rows: &BTreeMap<String, BaseRecord>,
    marker_type: MarkerType,
) -> EngineResult<u64> {
    let rel = ctx.data_file_path(partition_path, file_name);
    let path = rel.display().to_string();

    let mut buf = Vec::new();
    for row in rows.values() {
        serde_json::to_writer(&mut buf, row).context(RecordCodecSnafu { path: path.clone() })?;
        buf.push(b'\n');
    }

    ctx.markers
        .create(partition_path, file_name, marker_type)
        .await
        .context(MarkerSnafu { path: path.clone() })?;
    storage::write_new(ctx.location.storage(), &rel, &buf)
        .await
        .context(DataFileSnafu { path })?;
    Ok(buf.len() as u64)
}

async fn merge_slice(
    location: &TableLocation,
    partition_path: &str,
    base_file: Option<&str>,
    log_files: &[String],
    completed_commits: &Timeline,
) -> EngineResult<BTreeMap<String, BaseRecord>> {
    let mut rows = match base_file {
        Some(name) => read_base_file(location, &rel_path_string(partition_path, name)).await?,
        None => BTreeMap::new(),
    };

    let mut blocks = Vec::new();
    for name in log_files {
        let rel = layout::data_file_rel_path(partition_path, name);
        blocks.extend(
            log_format::read_blocks(location, &rel)
                .await
                .context(LogFileSnafu)?,
        );
    }

    for block in log_format::valid_blocks(blocks, |ts| completed_commits.contains_timestamp(ts)) {
        match block {
            LogBlock::Data {
                instant_time,
                records,
            } => {
                for record in records {
                    rows.insert(
                        record.key.record_key.clone(),
                        BaseRecord {
                            key: record.key,
                            commit_time: instant_time.clone(),
                            data: record.data,
                        },
                    );
                }
            }
            LogBlock::Delete { keys, .. } => {
                for key in keys {
                    rows.remove(&key.record_key);
                }
            }
            LogBlock::Command { .. } => {}
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_view::TableFileSystemView;
    use crate::metadata::WriteOperationType;
    use crate::markers::WriteMarkers;
    use crate::model::RecordLocation;
    use crate::timeline::ActiveTimeline;
    use serde_json::json;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn write_at(
        engine: &LocalEngine,
        active: &ActiveTimeline,
        table_type: TableType,
        ts: &str,
        records: Vec<Record>,
    ) -> Result<Vec<WriteStatus>, Box<dyn std::error::Error>> {
        let location = active.location().clone();
        let instant_time = InstantTime::new(ts);
        let markers = WriteMarkers::new(location.clone(), instant_time.clone());
        let view = TableFileSystemView::load(active).await?;
        let completed = active.timeline().completed_commits_timeline();
        let ctx = WriteContext {
            location: &location,
            instant_time: &instant_time,
            table_type,
            operation: WriteOperationType::Upsert,
            base_file_extension: ".jsonl",
            markers: &markers,
            view: &view,
            completed_commits: &completed,
        };
        Ok(engine.write(&ctx, records).await?)
    }

    async fn complete(active: &mut ActiveTimeline, ts: &str, table_type: TableType) -> TestResult {
        let requested = active
            .create_requested(&InstantTime::new(ts), table_type.commit_action(), &[])
            .await?;
        let inflight = active
            .transition_requested_to_inflight(&requested, None)
            .await?;
        active.transition_inflight_to_complete(&inflight, b"{}").await?;
        Ok(())
    }

    fn located(key: &str, data: Option<Value>, at: &str, file_id: &str) -> Record {
        let mut record = match data {
            Some(data) => Record::new(RecordKey::new(key, "p"), data),
            None => Record::delete(RecordKey::new(key, "p")),
        };
        record.location = Some(RecordLocation {
            instant_time: InstantTime::new(at),
            file_id: file_id.to_string(),
        });
        record
    }

    #[tokio::test]
    async fn copy_on_write_update_rewrites_base_file() -> TestResult {
        let tmp = TempDir::new()?;
        let mut active = ActiveTimeline::load(TableLocation::local(tmp.path())).await?;
        let engine = LocalEngine::new();

        let inserted = write_at(
            &engine,
            &active,
            TableType::CopyOnWrite,
            "001",
            vec![
                Record::new(RecordKey::new("a", "p"), json!({"v": 1})),
                Record::new(RecordKey::new("b", "p"), json!({"v": 1})),
            ],
        )
        .await?;
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].stat.num_inserts, 2);
        complete(&mut active, "001", TableType::CopyOnWrite).await?;

        let file_id = inserted[0].file_id.clone();
        let updated = write_at(
            &engine,
            &active,
            TableType::CopyOnWrite,
            "002",
            vec![
                located("a", Some(json!({"v": 2})), "001", &file_id),
                located("b", None, "001", &file_id),
            ],
        )
        .await?;
        let stat = &updated[0].stat;
        assert_eq!(stat.prev_commit.as_ref().map(InstantTime::as_str), Some("001"));
        assert_eq!((stat.num_update_writes, stat.num_deletes, stat.num_writes), (1, 1, 1));
        complete(&mut active, "002", TableType::CopyOnWrite).await?;

        let view = TableFileSystemView::load(&active).await?;
        let slice = crate::fs_view::FileSystemView::latest_file_slice(&view, "p", &file_id)
            .expect("slice");
        let rows = LocalEngine::read_slice(
            active.location(),
            &slice,
            &active.timeline().completed_commits_timeline(),
        )
        .await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, json!({"v": 2}));
        assert_eq!(rows[0].commit_time.as_str(), "002");
        Ok(())
    }

    #[tokio::test]
    async fn merge_on_read_update_appends_to_log_and_compacts() -> TestResult {
        let tmp = TempDir::new()?;
        let mut active = ActiveTimeline::load(TableLocation::local(tmp.path())).await?;
        let engine = LocalEngine::new();

        let inserted = write_at(
            &engine,
            &active,
            TableType::MergeOnRead,
            "001",
            vec![Record::new(RecordKey::new("a", "p"), json!({"v": 1}))],
        )
        .await?;
        complete(&mut active, "001", TableType::MergeOnRead).await?;
        let file_id = inserted[0].file_id.clone();

        let updated = write_at(
            &engine,
            &active,
            TableType::MergeOnRead,
            "002",
            vec![located("a", Some(json!({"v": 2})), "001", &file_id)],
        )
        .await?;
        let log_path = updated[0].stat.path.clone().expect("log path");
        assert!(log_path.starts_with(&format!("p/.{file_id}_001.log.1_")));
        complete(&mut active, "002", TableType::MergeOnRead).await?;

        let view = TableFileSystemView::load(&active).await?;
        let slice = crate::fs_view::FileSystemView::latest_file_slice(&view, "p", &file_id)
            .expect("slice");
        let operation = CompactionOperation {
            partition_path: "p".to_string(),
            file_id: file_id.clone(),
            base_instant_time: slice.base_instant_time.clone(),
            base_file: slice.base_file.as_ref().map(|b| b.file_name.clone()),
            log_files: slice.log_files.iter().map(|l| l.file_name.clone()).collect(),
        };

        let location = active.location().clone();
        let compaction_time = InstantTime::new("003");
        let markers = WriteMarkers::new(location.clone(), compaction_time.clone());
        let completed = active.timeline().completed_commits_timeline();
        let ctx = WriteContext {
            location: &location,
            instant_time: &compaction_time,
            table_type: TableType::MergeOnRead,
            operation: WriteOperationType::Compact,
            base_file_extension: ".jsonl",
            markers: &markers,
            view: &view,
            completed_commits: &completed,
        };
        let status = engine.compact(&ctx, &operation).await?;
        assert_eq!(status.stat.num_writes, 1);

        let compacted = read_base_file(&location, status.stat.path.as_deref().unwrap_or_default()).await?;
        assert_eq!(compacted["a"].data, json!({"v": 2}));
        Ok(())
    }
}
