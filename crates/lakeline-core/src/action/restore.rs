//! Restore: roll the table back to an earlier commit.
//!
//! Every commit-family instant after the restore point is rolled back,
//! newest first, under one `restore` instant. The inner rollbacks do not
//! publish rollback instants of their own; their metadata is collected into
//! the [`RestoreMetadata`]. Every target passes the rollback preconditions
//! before the restore instant is created.

use log::info;
use snafu::prelude::*;

use crate::action::rollback::{check_rollback_preconditions, execute_rollback};
use crate::action::{ActionResult, ProtocolResult, RestoreSnafu, elapsed_ms};
use crate::engine::WriteEngine;
use crate::metadata::RestoreMetadata;
use crate::table::Table;
use crate::timeline::{ActionType, Instant, InstantTime};

/// Roll back every commit after `instant_time` under a restore instant at
/// `restore_time`.
pub(crate) async fn restore<E: WriteEngine>(
    table: &mut Table<E>,
    restore_time: &InstantTime,
    instant_time: &InstantTime,
) -> ActionResult<RestoreMetadata> {
    let start = std::time::Instant::now();
    let mut targets: Vec<Instant> = table
        .timeline
        .timeline()
        .commits_timeline()
        .find_instants_after(instant_time)
        .instants()
        .cloned()
        .collect();
    targets.reverse();
    info!(
        "Restoring to {instant_time}: rolling back {} instant(s)",
        targets.len()
    );

    // Each target is checked as it will be met: after every newer target is
    // gone. A refused restore leaves no instant behind.
    let mut remaining = table.timeline.timeline().clone();
    for target in &targets {
        check_rollback_preconditions(&remaining, target)?;
        remaining.remove(target);
    }

    let inflight = begin_restore(table, restore_time)
        .await
        .context(RestoreSnafu {
            instant: instant_time.to_string(),
        })?;

    let mut rollbacks = Vec::with_capacity(targets.len());
    for target in targets {
        let metadata = execute_rollback(table, restore_time, &target, true)
            .await
            .context(RestoreSnafu {
                instant: instant_time.to_string(),
            })?;
        rollbacks.push((target.timestamp.clone(), metadata));
    }

    let metadata = RestoreMetadata::new(
        restore_time.clone(),
        instant_time.clone(),
        elapsed_ms(start),
        rollbacks,
    );
    finish_restore(table, &inflight, &metadata)
        .await
        .context(RestoreSnafu {
            instant: instant_time.to_string(),
        })?;
    info!(
        "Restored to {instant_time} at {restore_time}: rolled back {:?}",
        metadata.instants_to_rollback
    );
    Ok(metadata)
}

async fn begin_restore<E: WriteEngine>(
    table: &mut Table<E>,
    restore_time: &InstantTime,
) -> ProtocolResult<Instant> {
    let requested = table
        .timeline
        .create_requested(restore_time, ActionType::Restore, &[])
        .await?;
    Ok(table
        .timeline
        .transition_requested_to_inflight(&requested, None)
        .await?)
}

async fn finish_restore<E: WriteEngine>(
    table: &mut Table<E>,
    inflight: &Instant,
    metadata: &RestoreMetadata,
) -> ProtocolResult<()> {
    table
        .timeline
        .transition_inflight_to_complete(inflight, &metadata.to_bytes()?)
        .await?;
    Ok(())
}
