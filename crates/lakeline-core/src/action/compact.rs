//! Compaction of merge-on-read file slices.
//!
//! Scheduling picks the latest slice of every file group that carries log
//! files and saves the operations as `<ts>.compaction.requested`. From that
//! moment the view opens an empty slice at `ts` for each of those groups, so
//! writers append new log files on top of the slice the compaction will
//! produce while the compaction reads the old one.
//!
//! Execution merges each operation into a new base file written at `ts` and
//! completes the instant as a compacted commit. An INFLIGHT compaction found
//! at execution time was interrupted: its partial output is rolled back and
//! the plan is run again from REQUESTED.

use std::collections::BTreeSet;

use log::info;
use snafu::prelude::*;

use crate::action::commit::commit_instant;
use crate::action::rollback::execute_rollback;
use crate::action::{
    ActionResult, CompactionPreconditionSnafu, CompactionSnafu, ProtocolResult,
    UnsupportedOperationSnafu,
};
use crate::config::TableType;
use crate::engine::{WriteContext, WriteEngine};
use crate::fs_view::{FileSystemView, TableFileSystemView};
use crate::markers::WriteMarkers;
use crate::metadata::{
    COMPACTION_PLAN_METADATA_KEY, CompactionOperation, CompactionPlan, METADATA_VERSION,
    WriteOperationType,
};
use crate::model::WriteStatus;
use crate::table::Table;
use crate::timeline::{ActionType, Instant, InstantState, InstantTime};

/// Schedule a compaction at `instant_time`. Returns `None`, creating no
/// instant, when no file slice has log files to fold.
pub(crate) async fn schedule<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
) -> ActionResult<Option<CompactionPlan>> {
    ensure_merge_on_read(table, "schedule_compaction")?;

    let timeline = table.timeline.timeline();
    let earlier_pending: Vec<String> = timeline
        .pending_writes_timeline()
        .find_instants_before(instant_time)
        .instants()
        .map(ToString::to_string)
        .collect();
    ensure!(
        earlier_pending.is_empty(),
        CompactionPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: format!("pending writes before it: {earlier_pending:?}"),
        }
    );
    let later: Vec<String> = timeline
        .commits_timeline()
        .filter(|i| i.timestamp >= *instant_time)
        .instants()
        .map(ToString::to_string)
        .collect();
    ensure!(
        later.is_empty(),
        CompactionPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: format!("commits at or after it: {later:?}"),
        }
    );

    request_compaction(table, instant_time)
        .await
        .context(CompactionSnafu {
            instant: instant_time.to_string(),
        })
}

async fn request_compaction<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
) -> ProtocolResult<Option<CompactionPlan>> {
    let view = TableFileSystemView::load(&table.timeline).await?;
    let plan = plan_compaction(&view);
    if plan.is_empty() {
        info!("No file slice to compact at {instant_time}");
        return Ok(None);
    }
    table
        .timeline
        .create_requested(instant_time, ActionType::Compaction, &plan.to_bytes()?)
        .await?;
    info!(
        "Scheduled compaction {instant_time} over {} file group(s)",
        plan.operations.len()
    );
    Ok(Some(plan))
}

/// One operation per latest slice with log files, skipping file groups
/// already under a pending compaction.
pub fn plan_compaction(view: &dyn FileSystemView) -> CompactionPlan {
    let pending: BTreeSet<(String, String)> = view
        .pending_compaction_operations()
        .into_iter()
        .map(|(_, op)| (op.partition_path, op.file_id))
        .collect();

    let mut operations = Vec::new();
    for partition in view.partition_paths() {
        for slice in view.latest_file_slices(&partition) {
            if !slice.has_log_files()
                || pending.contains(&(slice.partition_path.clone(), slice.file_id.clone()))
            {
                continue;
            }
            operations.push(CompactionOperation {
                partition_path: slice.partition_path.clone(),
                file_id: slice.file_id.clone(),
                base_instant_time: slice.base_instant_time.clone(),
                base_file: slice.base_file.as_ref().map(|b| b.file_name.clone()),
                log_files: slice.log_files.iter().map(|l| l.file_name.clone()).collect(),
            });
        }
    }
    CompactionPlan {
        operations,
        version: METADATA_VERSION,
        ..Default::default()
    }
}

/// Run the compaction scheduled at `instant_time`.
pub(crate) async fn execute<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
) -> ActionResult<Vec<WriteStatus>> {
    ensure_merge_on_read(table, "compact")?;

    let Some(instant) = table
        .timeline
        .timeline()
        .get(instant_time, ActionType::Compaction)
        .cloned()
    else {
        return CompactionPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: "no compaction is scheduled at this instant",
        }
        .fail();
    };
    ensure!(
        instant.is_pending(),
        CompactionPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: "the compaction already completed",
        }
    );

    run_compaction(table, instant)
        .await
        .context(CompactionSnafu {
            instant: instant_time.to_string(),
        })
}

async fn run_compaction<E: WriteEngine>(
    table: &mut Table<E>,
    instant: Instant,
) -> ProtocolResult<Vec<WriteStatus>> {
    let ts = instant.timestamp.clone();
    let requested = if instant.state == InstantState::Inflight {
        info!("Rolling back interrupted compaction {instant}");
        let rollback_time = table.timeline.new_instant_time();
        execute_rollback(table, &rollback_time, &instant, false).await?;
        table.timeline.revert_inflight_to_requested(&instant).await?
    } else {
        instant
    };

    let plan_bytes = table.timeline.read_details(&requested).await?;
    let plan = CompactionPlan::from_bytes(&plan_bytes)?;
    table
        .timeline
        .transition_requested_to_inflight(&requested, Some(&plan_bytes))
        .await?;

    let view = TableFileSystemView::load(&table.timeline).await?;
    let completed = table.timeline.timeline().completed_commits_timeline();
    let markers = WriteMarkers::new(table.location.clone(), ts.clone());
    let ctx = WriteContext {
        location: &table.location,
        instant_time: &ts,
        table_type: table.table_config.table_type,
        operation: WriteOperationType::Compact,
        base_file_extension: &table.table_config.base_file_extension,
        markers: &markers,
        view: &view,
        completed_commits: &completed,
    };
    let mut statuses = Vec::with_capacity(plan.operations.len());
    for operation in &plan.operations {
        statuses.push(table.engine.compact(&ctx, operation).await?);
    }
    info!(
        "Compaction {ts} merged {} file slice(s)",
        statuses.len()
    );

    let mut extra_metadata = plan.extra_metadata.clone();
    extra_metadata.insert(
        COMPACTION_PLAN_METADATA_KEY.to_string(),
        plan.to_json_string()?,
    );
    commit_instant(
        table,
        &ts,
        ActionType::Compaction,
        &statuses,
        WriteOperationType::Compact,
        extra_metadata,
    )
    .await?;
    Ok(statuses)
}

fn ensure_merge_on_read<E: WriteEngine>(table: &Table<E>, operation: &str) -> ActionResult<()> {
    ensure!(
        table.table_config.table_type == TableType::MergeOnRead,
        UnsupportedOperationSnafu {
            operation,
            reason: "compaction applies to merge-on-read tables only",
        }
    );
    Ok(())
}
