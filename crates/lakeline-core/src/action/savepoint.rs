//! Savepoints pin the base files visible at a completed commit.
//!
//! The cleaner never deletes a savepointed file and a savepointed commit
//! cannot be rolled back, which keeps the table restorable to that point.

use std::collections::BTreeMap;

use log::info;
use snafu::prelude::*;

use crate::action::{
    ActionResult, ProtocolError, ProtocolResult, SavepointPreconditionSnafu, SavepointSnafu,
};
use crate::engine::WriteEngine;
use crate::fs_view::{FileSystemView, TableFileSystemView};
use crate::metadata::{CleanMetadata, SavepointMetadata};
use crate::table::Table;
use crate::timeline::{ActionType, InstantTime};

/// Savepoint the completed commit at `instant_time`.
pub(crate) async fn create<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
    user: &str,
    comment: &str,
) -> ActionResult<SavepointMetadata> {
    let timeline = table.timeline.timeline();
    ensure!(
        timeline
            .completed_commits_timeline()
            .contains_timestamp(instant_time),
        SavepointPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: "not a completed commit",
        }
    );
    ensure!(
        !timeline.savepoint_timeline().contains_timestamp(instant_time),
        SavepointPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: "already savepointed",
        }
    );

    let earliest = earliest_retained_commit(table)
        .await
        .context(SavepointSnafu {
            instant: instant_time.to_string(),
        })?;
    if let Some(earliest) = earliest {
        ensure!(
            *instant_time >= earliest,
            SavepointPreconditionSnafu {
                instant: instant_time.to_string(),
                reason: format!("older than the earliest retained commit {earliest}"),
            }
        );
    }

    write_savepoint(table, instant_time, user, comment)
        .await
        .context(SavepointSnafu {
            instant: instant_time.to_string(),
        })
}

/// Earliest commit the last completed clean kept, if any clean ran.
async fn earliest_retained_commit<E: WriteEngine>(
    table: &Table<E>,
) -> ProtocolResult<Option<InstantTime>> {
    let Some(last_clean) = table
        .timeline
        .timeline()
        .clean_timeline()
        .filter_completed()
        .last_instant()
        .cloned()
    else {
        return Ok(None);
    };
    let bytes = table.timeline.read_details(&last_clean).await?;
    Ok(CleanMetadata::from_bytes(&bytes)?.earliest_commit_to_retain)
}

async fn write_savepoint<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
    user: &str,
    comment: &str,
) -> ProtocolResult<SavepointMetadata> {
    let view = TableFileSystemView::load(&table.timeline).await?;
    let mut files = BTreeMap::new();
    for partition in view.partition_paths() {
        let names: Vec<String> = view
            .latest_base_files_before_or_on(&partition, instant_time)
            .into_iter()
            .map(|b| b.file_name)
            .collect();
        if !names.is_empty() {
            files.insert(partition, names);
        }
    }
    let metadata = SavepointMetadata::new(user, comment, files);

    let requested = table
        .timeline
        .create_requested(instant_time, ActionType::Savepoint, &[])
        .await?;
    let inflight = table
        .timeline
        .transition_requested_to_inflight(&requested, None)
        .await?;
    table
        .timeline
        .transition_inflight_to_complete(&inflight, &metadata.to_bytes()?)
        .await?;
    info!(
        "Savepointed {instant_time} by {user}: {} file(s) pinned",
        metadata.savepointed_files().len()
    );
    Ok(metadata)
}

/// Remove the savepoint at `instant_time`.
pub(crate) async fn delete<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
) -> ActionResult<()> {
    let Some(instant) = table
        .timeline
        .timeline()
        .savepoint_timeline()
        .get(instant_time, ActionType::Savepoint)
        .cloned()
    else {
        return SavepointPreconditionSnafu {
            instant: instant_time.to_string(),
            reason: "no savepoint at this instant",
        }
        .fail();
    };
    table
        .timeline
        .delete_instant(&instant)
        .await
        .map_err(ProtocolError::from)
        .context(SavepointSnafu {
            instant: instant_time.to_string(),
        })?;
    info!("Deleted savepoint {instant_time}");
    Ok(())
}
