//! Commit-family executor: upsert, insert, bulk insert and delete.
//!
//! A write moves its instant through the timeline in four steps:
//!
//! 1. REQUESTED → INFLIGHT. For upserts, inserts and deletes the INFLIGHT
//!    payload is the workload profile (which file groups receive updates,
//!    from which previous commit), persisted before any data file is
//!    written so a crashed merge-on-read write can be rolled back
//!    precisely. Bulk inserts transition with an empty payload.
//! 2. The engine writes data files, dropping a marker before each one.
//! 3. The index records the new locations.
//! 4. Commit (automatic unless disabled): build [`CommitMetadata`], fold in
//!    the rolling statistics of the previous completed commit, delete files
//!    left by retried tasks, wait until every written file is visible, then
//!    INFLIGHT → COMPLETED and drop the marker directory.
//!
//! The rolling statistics merge is a plain read-modify-write of the latest
//! completed commit: two writers committing concurrently each merge onto the
//! same predecessor and the later commit wins.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use snafu::prelude::*;

use crate::action::{
    ActionResult, CommitSnafu, ProtocolResult, SchemaIncompatibleSnafu, WriteErrorsSnafu,
    WriteSnafu, read_commit_metadata,
};
use crate::consistency::ConsistencyGuard;
use crate::engine::{WriteContext, WriteEngine};
use crate::fs_view::{TableFileSystemView, rel_path_string};
use crate::markers::WriteMarkers;
use crate::metadata::{
    CommitMetadata, ROLLING_STAT_METADATA_KEY, RollingStatMetadata, WorkloadProfile,
    WriteOperationType,
};
use crate::model::{Record, WriteStatus};
use crate::schema::{WriterSchema, ensure_schema_compatible};
use crate::storage::{self, layout};
use crate::table::Table;
use crate::timeline::{ActionType, Instant, InstantTime};

/// Write `records` at `instant_time` and, with auto-commit on, commit them.
pub(crate) async fn write<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
    records: Vec<Record>,
    operation: WriteOperationType,
) -> ActionResult<Vec<WriteStatus>> {
    if matches!(
        operation,
        WriteOperationType::Upsert | WriteOperationType::Insert
    ) {
        validate_schema(table, instant_time).await?;
    }

    let statuses = write_data(table, instant_time, records, operation)
        .await
        .context(WriteSnafu {
            instant: instant_time.to_string(),
        })?;

    if table.write_config.auto_commit {
        info!("Auto commit enabled: committing {instant_time}");
        commit(table, instant_time, &statuses, operation, BTreeMap::new()).await?;
    } else {
        info!("Auto commit disabled for {instant_time}");
    }
    Ok(statuses)
}

/// Commit a written instant of the table's commit action.
pub(crate) async fn commit<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
    statuses: &[WriteStatus],
    operation: WriteOperationType,
    extra_metadata: BTreeMap<String, String>,
) -> ActionResult<CommitMetadata> {
    let error_count: u64 = statuses.iter().map(|s| s.total_error_records).sum();
    if error_count > 0 {
        if !table.write_config.commit_on_errors {
            return WriteErrorsSnafu {
                instant: instant_time.to_string(),
                error_count,
            }
            .fail();
        }
        warn!("Committing {instant_time} with {error_count} failed record(s)");
    }

    let action = table.table_config.table_type.commit_action();
    commit_instant(
        table,
        instant_time,
        action,
        statuses,
        operation,
        extra_metadata,
    )
    .await
    .context(CommitSnafu {
        instant: instant_time.to_string(),
    })
}

async fn validate_schema<E: WriteEngine>(
    table: &Table<E>,
    instant_time: &InstantTime,
) -> ActionResult<()> {
    if !table.write_config.validate_schema {
        return Ok(());
    }
    let Some(writer) = &table.write_config.writer_schema else {
        return Ok(());
    };
    let Some(last) = table
        .timeline
        .timeline()
        .completed_commits_timeline()
        .last_instant()
        .cloned()
    else {
        return Ok(());
    };

    let previous = read_commit_metadata(&table.timeline, &last)
        .await
        .context(WriteSnafu {
            instant: instant_time.to_string(),
        })?;
    let Some(json) = previous.metadata(CommitMetadata::SCHEMA_KEY) else {
        return Ok(());
    };
    let table_schema = WriterSchema::from_json(json).context(SchemaIncompatibleSnafu {
        instant: instant_time.to_string(),
    })?;
    ensure_schema_compatible(&table_schema, writer).context(SchemaIncompatibleSnafu {
        instant: instant_time.to_string(),
    })
}

async fn write_data<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
    records: Vec<Record>,
    operation: WriteOperationType,
) -> ProtocolResult<Vec<WriteStatus>> {
    let action = table.table_config.table_type.commit_action();
    let requested = match table.timeline.timeline().get(instant_time, action) {
        Some(instant) => instant.clone(),
        None => {
            table
                .timeline
                .create_requested(instant_time, action, &[])
                .await?
        }
    };

    let tagged = match operation {
        WriteOperationType::Upsert | WriteOperationType::Delete => {
            table.index.tag_location(records).await?
        }
        _ => records,
    };

    let payload = if operation.needs_workload_profile() {
        let profile = WorkloadProfile::build(&tagged);
        debug!(
            "Workload profile for {instant_time}: {} insert(s), {} update(s)",
            profile.global_stat().num_inserts,
            profile.global_stat().num_updates
        );
        Some(profile.to_inflight_metadata(operation).to_json_bytes()?)
    } else {
        None
    };
    table
        .timeline
        .transition_requested_to_inflight(&requested, payload.as_deref())
        .await?;

    let view = TableFileSystemView::load(&table.timeline).await?;
    let completed = table.timeline.timeline().completed_commits_timeline();
    let markers = WriteMarkers::new(table.location.clone(), instant_time.clone());
    let ctx = WriteContext {
        location: &table.location,
        instant_time,
        table_type: table.table_config.table_type,
        operation,
        base_file_extension: &table.table_config.base_file_extension,
        markers: &markers,
        view: &view,
        completed_commits: &completed,
    };
    let statuses = table.engine.write(&ctx, tagged).await?;
    info!(
        "Wrote {} file(s) for {instant_time} ({} record(s))",
        statuses.len(),
        statuses.iter().map(|s| s.total_records).sum::<u64>()
    );

    Ok(table.index.update_location(statuses, instant_time).await?)
}

/// Build, reconcile and publish the commit metadata of an INFLIGHT instant.
pub(crate) async fn commit_instant<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
    action: ActionType,
    statuses: &[WriteStatus],
    operation: WriteOperationType,
    extra_metadata: BTreeMap<String, String>,
) -> ProtocolResult<CommitMetadata> {
    let mut metadata = CommitMetadata::new(operation);
    metadata.compacted = action == ActionType::Compaction;
    for status in statuses {
        metadata.add_write_stat(status.partition_path.clone(), status.stat.clone());
    }
    for (key, value) in extra_metadata {
        metadata.add_metadata(key, value);
    }
    if let Some(schema) = &table.write_config.writer_schema {
        metadata.add_metadata(CommitMetadata::SCHEMA_KEY, schema.to_json());
    }

    let mut rolling = RollingStatMetadata::new(action);
    rolling.add_commit(&metadata);
    if let Some(last) = table
        .timeline
        .timeline()
        .completed_commits_timeline()
        .last_instant()
        .cloned()
    {
        let previous = read_commit_metadata(&table.timeline, &last).await?;
        if let Some(previous) = RollingStatMetadata::from_commit_metadata(&previous)? {
            rolling = rolling.merge(&previous);
        }
    }
    metadata.add_metadata(ROLLING_STAT_METADATA_KEY, rolling.to_json_string()?);

    let markers = WriteMarkers::new(table.location.clone(), instant_time.clone());
    reconcile_markers(table, &markers, &metadata).await?;

    for (partition, names) in metadata.written_file_names() {
        table
            .guard
            .wait_till_all_appear(&partition, &names)
            .await?;
    }

    let inflight = Instant::inflight(instant_time, action);
    table
        .timeline
        .transition_inflight_to_complete(&inflight, &metadata.to_json_bytes()?)
        .await?;
    markers.delete_marker_dir().await?;
    info!(
        "Committed {inflight}: {} record(s), {} byte(s)",
        metadata.total_records_written(),
        metadata.total_bytes_written()
    );
    Ok(metadata)
}

/// Delete base files a marker names but no write stat claims (output of a
/// retried task attempt), then wait until they are gone.
async fn reconcile_markers<E: WriteEngine>(
    table: &Table<E>,
    markers: &WriteMarkers,
    metadata: &CommitMetadata,
) -> ProtocolResult<()> {
    let committed: BTreeSet<String> = metadata
        .write_stats()
        .filter_map(|s| s.path.clone())
        .collect();

    let mut invalid: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for marker in markers.created_and_merged_files().await? {
        let path = rel_path_string(&marker.partition_path, &marker.data_file_name);
        if committed.contains(&path) {
            continue;
        }
        let rel = layout::data_file_rel_path(&marker.partition_path, &marker.data_file_name);
        if storage::delete_file(table.location.storage(), &rel).await? {
            warn!("Deleted duplicate data file {path} of {}", markers.instant_time());
            invalid
                .entry(marker.partition_path.clone())
                .or_default()
                .push(marker.data_file_name.clone());
        }
    }
    wait_disappear(table.guard.as_ref(), &invalid).await
}

pub(crate) async fn wait_disappear(
    guard: &dyn ConsistencyGuard,
    files: &BTreeMap<String, Vec<String>>,
) -> ProtocolResult<()> {
    for (partition, names) in files {
        guard.wait_till_all_disappear(partition, names).await?;
    }
    Ok(())
}
