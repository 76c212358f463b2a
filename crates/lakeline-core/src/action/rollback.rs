//! Rollback: undo the effects of one commit-family instant.
//!
//! A rollback runs as its own `rollback` instant. The REQUESTED payload is a
//! [`RollbackPlan`] naming the target, so a rollback interrupted by a crash
//! is found and resumed by the next attempt on the same target instead of
//! starting a second one.
//!
//! Execution:
//!
//! 1. A completed target is first reverted to INFLIGHT, so readers stop
//!    seeing it before any of its files disappear.
//! 2. The target's files are removed by one of two strategies. Marker-based
//!    rollback trusts the markers the writer dropped before each file;
//!    listing-based rollback derives the files from names and the commit
//!    metadata. Marker-based falls back to listing when the marker directory
//!    is gone (the commit completed, or markers were never written).
//! 3. The index forgets the target's locations.
//! 4. The target's instant files and marker directory are removed, and
//!    pending clean plans that assumed the target's history are dropped.
//!
//! Restore and compaction retry reuse the execution without publishing a
//! rollback instant of their own.

use std::collections::BTreeMap;
use std::path::Path;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::action::commit::wait_disappear;
use crate::action::{
    ActionResult, IndexRollbackRefusedSnafu, ProtocolResult, RollbackPreconditionSnafu,
    RollbackSnafu, elapsed_ms, read_commit_metadata,
};
use crate::engine::WriteEngine;
use crate::markers::WriteMarkers;
use crate::metadata::{
    CleanerPlan, CompactionPlan, METADATA_VERSION, RollbackMetadata, RollbackPlan, RollbackStat,
};
use crate::storage::{self, TableLocation};
use crate::table::Table;
use crate::timeline::{ActionType, ActiveTimeline, Instant, InstantState, InstantTime, Timeline};

mod listing;
mod markers;

/// How the files of a rolled-back instant are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStrategy {
    /// Derive files from the partition listing and commit metadata.
    Listing,
    /// Use the markers written before each data file.
    Markers,
}

/// Roll back the commit-family instant at `instant_time` under a rollback
/// instant at `rollback_time`. Returns `None` when nothing is left to roll
/// back.
pub(crate) async fn rollback<E: WriteEngine>(
    table: &mut Table<E>,
    rollback_time: &InstantTime,
    instant_time: &InstantTime,
) -> ActionResult<Option<RollbackMetadata>> {
    let target = table
        .timeline
        .timeline()
        .commits_timeline()
        .filter(|i| i.timestamp == *instant_time)
        .first_instant()
        .cloned();
    let pending = find_pending_rollback(table, instant_time)
        .await
        .context(RollbackSnafu {
            instant: instant_time.to_string(),
        })?;

    let Some(target) = target else {
        return match pending {
            // The target was removed before the rollback could complete.
            Some(rollback_instant) => {
                let metadata = RollbackMetadata::new(
                    rollback_instant.timestamp.clone(),
                    0,
                    vec![instant_time.clone()],
                    Vec::new(),
                );
                complete_rollback_instant(table, &rollback_instant, &metadata)
                    .await
                    .context(RollbackSnafu {
                        instant: instant_time.to_string(),
                    })?;
                Ok(Some(metadata))
            }
            None => {
                info!("Instant {instant_time} is not on the timeline; nothing to roll back");
                Ok(None)
            }
        };
    };

    check_rollback_preconditions(table.timeline.timeline(), &target)?;

    let metadata = run_rollback(table, rollback_time, &target, pending)
        .await
        .context(RollbackSnafu {
            instant: instant_time.to_string(),
        })?;
    Ok(Some(metadata))
}

async fn run_rollback<E: WriteEngine>(
    table: &mut Table<E>,
    rollback_time: &InstantTime,
    target: &Instant,
    pending: Option<Instant>,
) -> ProtocolResult<RollbackMetadata> {
    let rollback_instant = match pending {
        Some(instant) => {
            info!("Resuming rollback {instant} of {target}");
            instant
        }
        None => {
            let plan = RollbackPlan::new(target.timestamp.clone(), target.action);
            table
                .timeline
                .create_requested(rollback_time, ActionType::Rollback, &plan.to_bytes()?)
                .await?
        }
    };
    let rollback_instant = if rollback_instant.state == InstantState::Requested {
        let plan = table.timeline.read_details(&rollback_instant).await?;
        table
            .timeline
            .transition_requested_to_inflight(&rollback_instant, Some(&plan))
            .await?
    } else {
        rollback_instant
    };

    let metadata =
        execute_rollback(table, &rollback_instant.timestamp, target, true).await?;
    complete_rollback_instant(table, &rollback_instant, &metadata).await?;
    Ok(metadata)
}

async fn complete_rollback_instant<E: WriteEngine>(
    table: &mut Table<E>,
    rollback_instant: &Instant,
    metadata: &RollbackMetadata,
) -> ProtocolResult<()> {
    let inflight = if rollback_instant.state == InstantState::Requested {
        let plan = table.timeline.read_details(rollback_instant).await?;
        table
            .timeline
            .transition_requested_to_inflight(rollback_instant, Some(&plan))
            .await?
    } else {
        rollback_instant.clone()
    };
    table
        .timeline
        .transition_inflight_to_complete(&inflight, &metadata.to_bytes()?)
        .await?;
    info!(
        "Completed rollback {} of {:?}: {} file(s) deleted",
        inflight.timestamp, metadata.commits_rollback, metadata.total_files_deleted
    );
    Ok(())
}

/// A pending rollback instant whose plan targets `instant_time`.
async fn find_pending_rollback<E: WriteEngine>(
    table: &Table<E>,
    instant_time: &InstantTime,
) -> ProtocolResult<Option<Instant>> {
    for instant in table
        .timeline
        .timeline()
        .rollback_timeline()
        .filter_pending()
        .instants()
    {
        let bytes = table.timeline.read_details(instant).await?;
        if RollbackPlan::from_bytes(&bytes)?.instant_to_rollback == *instant_time {
            return Ok(Some(instant.clone()));
        }
    }
    Ok(None)
}

/// Refuse to roll back `target` when doing so would break the timeline:
/// savepointed instants are pinned, and only the newest commit may go.
/// Delta commits completed after a compaction do not block rolling the
/// compaction back; they were written on top of the slice it opened.
pub fn check_rollback_preconditions(timeline: &Timeline, target: &Instant) -> ActionResult<()> {
    let ts = &target.timestamp;
    ensure!(
        !timeline.savepoint_timeline().contains_timestamp(ts),
        RollbackPreconditionSnafu {
            instant: ts.to_string(),
            reason: "the instant is savepointed",
        }
    );

    let later_completed: Vec<String> = timeline
        .completed_commits_timeline()
        .find_instants_after(ts)
        .instants()
        .filter(|i| !(target.action == ActionType::Compaction && i.action == ActionType::DeltaCommit))
        .map(ToString::to_string)
        .collect();
    ensure!(
        later_completed.is_empty(),
        RollbackPreconditionSnafu {
            instant: ts.to_string(),
            reason: format!("found completed commits after it: {later_completed:?}"),
        }
    );

    let later_pending: Vec<String> = timeline
        .pending_writes_timeline()
        .find_instants_after(ts)
        .instants()
        .map(ToString::to_string)
        .collect();
    ensure!(
        later_pending.is_empty(),
        RollbackPreconditionSnafu {
            instant: ts.to_string(),
            reason: format!("found pending commits after it: {later_pending:?}"),
        }
    );
    Ok(())
}

/// Undo `target` without touching the rollback timeline. With
/// `delete_instant` off the target stays INFLIGHT on the timeline (used to
/// retry a compaction).
pub(crate) async fn execute_rollback<E: WriteEngine>(
    table: &mut Table<E>,
    rollback_time: &InstantTime,
    target: &Instant,
    delete_instant: bool,
) -> ProtocolResult<RollbackMetadata> {
    let start = std::time::Instant::now();
    let ts = target.timestamp.clone();

    let target = if target.is_completed() {
        info!("Unpublishing completed instant {target} before rollback");
        let payload = inflight_payload(&table.timeline, target).await?;
        table
            .timeline
            .revert_complete_to_inflight(target, payload.as_deref())
            .await?
    } else {
        target.clone()
    };

    let markers = WriteMarkers::new(table.location.clone(), ts.clone());
    let strategy = if table.write_config.rollback.use_marker_based {
        if markers.exists().await? {
            RollbackStrategy::Markers
        } else {
            warn!("No markers for {ts}; falling back to listing-based rollback");
            RollbackStrategy::Listing
        }
    } else {
        RollbackStrategy::Listing
    };
    info!("Rolling back {target} using {strategy:?} strategy");

    let parallelism = table.write_config.rollback.parallelism.max(1);
    let stats = match strategy {
        RollbackStrategy::Markers => {
            markers::rollback(&table.location, &markers, rollback_time, &ts, parallelism).await?
        }
        RollbackStrategy::Listing => {
            listing::rollback(
                &table.timeline,
                table.table_config.table_type,
                &target,
                rollback_time,
                parallelism,
            )
            .await?
        }
    };
    let stats = RollbackStat::merge_by_partition(stats);

    let mut deleted: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for stat in &stats {
        deleted.insert(
            stat.partition_path.clone(),
            stat.success_delete_files
                .iter()
                .map(|p| p.rsplit('/').next().unwrap_or(p).to_string())
                .collect(),
        );
    }
    wait_disappear(table.guard.as_ref(), &deleted).await?;

    ensure!(
        table.index.rollback_commit(&ts).await?,
        IndexRollbackRefusedSnafu {
            instant: ts.to_string(),
        }
    );

    if delete_instant {
        table.timeline.delete_instant(&target).await?;
    }
    markers.delete_marker_dir().await?;
    purge_pending_cleans(table, &ts).await?;

    Ok(RollbackMetadata::new(
        rollback_time.clone(),
        elapsed_ms(start),
        vec![ts],
        stats,
    ))
}

/// Payload `completed` should carry once reverted to INFLIGHT, or `None` to
/// keep its completed payload. An INFLIGHT compaction carries its plan, which
/// the completed commit metadata records.
async fn inflight_payload(
    timeline: &ActiveTimeline,
    completed: &Instant,
) -> ProtocolResult<Option<Vec<u8>>> {
    if completed.action != ActionType::Compaction {
        return Ok(None);
    }
    let metadata = read_commit_metadata(timeline, completed).await?;
    let plan = match CompactionPlan::from_commit_metadata(&metadata)? {
        Some(plan) => plan,
        None => {
            warn!("Compaction {completed} recorded no plan; reverting with an empty one");
            CompactionPlan {
                version: METADATA_VERSION,
                ..Default::default()
            }
        }
    };
    Ok(Some(plan.to_bytes()?))
}

/// Drop pending clean plans computed against history that included `ts`.
async fn purge_pending_cleans<E: WriteEngine>(
    table: &mut Table<E>,
    ts: &InstantTime,
) -> ProtocolResult<()> {
    let pending: Vec<Instant> = table
        .timeline
        .timeline()
        .clean_timeline()
        .filter_pending()
        .instants()
        .cloned()
        .collect();
    for instant in pending {
        let bytes = table.timeline.read_details(&instant).await?;
        let plan = CleanerPlan::from_bytes(&bytes)?;
        if plan
            .earliest_instant_to_retain
            .as_ref()
            .is_some_and(|earliest| earliest >= ts)
        {
            info!("Removing pending clean {instant} planned against rolled back {ts}");
            table.timeline.delete_instant(&instant).await?;
        }
    }
    Ok(())
}

/// Delete `(partition, table-relative path)` pairs, at most `parallelism`
/// at a time, and report the outcome per partition.
async fn delete_files(
    location: &TableLocation,
    files: Vec<(String, String)>,
    parallelism: usize,
) -> Vec<RollbackStat> {
    stream::iter(files)
        .map(|(partition, path)| async move {
            let mut stat = RollbackStat::new(partition);
            match storage::delete_file(location.storage(), Path::new(&path)).await {
                Ok(true) => {
                    debug!("Rollback deleted {path}");
                    stat.success_delete_files.push(path);
                }
                Ok(false) => {
                    debug!("Rollback target {path} already gone");
                }
                Err(e) => {
                    warn!("Rollback failed to delete {path}: {e}");
                    stat.failed_delete_files.push(path);
                }
            }
            stat
        })
        .buffer_unordered(parallelism)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{TableConfig, TableType, WriteConfig};
    use crate::engine::LocalEngine;
    use crate::index::InMemoryIndex;
    use crate::model::{Record, RecordKey};
    use serde_json::json;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn timeline(instants: Vec<Instant>) -> Timeline {
        Timeline::new(instants)
    }

    fn record(k: &str, v: i64) -> Record {
        Record::new(RecordKey::new(k, "p"), json!({ "v": v }))
    }

    #[test]
    fn newest_completed_commit_can_be_rolled_back() {
        let tl = timeline(vec![
            Instant::completed("001", ActionType::Commit),
            Instant::completed("002", ActionType::Commit),
        ]);
        let target = Instant::completed("002", ActionType::Commit);
        assert!(check_rollback_preconditions(&tl, &target).is_ok());
    }

    #[test]
    fn later_completed_commit_blocks_rollback() {
        let tl = timeline(vec![
            Instant::completed("001", ActionType::Commit),
            Instant::completed("002", ActionType::Commit),
        ]);
        let target = Instant::completed("001", ActionType::Commit);
        let err = check_rollback_preconditions(&tl, &target).unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("002"));
    }

    #[test]
    fn later_pending_write_blocks_rollback() {
        let tl = timeline(vec![
            Instant::inflight("001", ActionType::DeltaCommit),
            Instant::requested("002", ActionType::DeltaCommit),
        ]);
        let target = Instant::inflight("001", ActionType::DeltaCommit);
        let err = check_rollback_preconditions(&tl, &target).unwrap_err();
        assert!(matches!(err, crate::action::ActionError::RollbackPrecondition { .. }));
    }

    #[test]
    fn savepointed_instant_cannot_be_rolled_back() {
        let tl = timeline(vec![
            Instant::completed("001", ActionType::Commit),
            Instant::completed("001", ActionType::Savepoint),
        ]);
        let target = Instant::completed("001", ActionType::Commit);
        let err = check_rollback_preconditions(&tl, &target).unwrap_err();
        assert!(err.to_string().contains("savepointed"));
    }

    #[test]
    fn later_delta_commits_do_not_block_compaction_rollback() {
        let tl = timeline(vec![
            Instant::inflight("003", ActionType::Compaction),
            Instant::completed("004", ActionType::DeltaCommit),
        ]);
        let target = Instant::inflight("003", ActionType::Compaction);
        assert!(check_rollback_preconditions(&tl, &target).is_ok());

        let commit_target = Instant::inflight("003", ActionType::DeltaCommit);
        let tl = timeline(vec![
            commit_target.clone(),
            Instant::completed("004", ActionType::DeltaCommit),
        ]);
        assert!(check_rollback_preconditions(&tl, &commit_target).is_err());
    }

    #[tokio::test]
    async fn reverted_compaction_carries_its_plan() -> TestResult {
        let tmp = TempDir::new()?;
        let mut table = Table::create(
            TableLocation::local(tmp.path()),
            TableConfig::new("compaction", TableType::MergeOnRead),
            WriteConfig::default().with_auto_clean(false),
            LocalEngine::new(),
            Arc::new(InMemoryIndex::new()),
        )
        .await?;
        table
            .insert(&InstantTime::new("001"), vec![record("a", 1)])
            .await?;
        table
            .upsert(&InstantTime::new("002"), vec![record("a", 2)])
            .await?;
        let ts = InstantTime::new("003");
        let plan = table
            .schedule_compaction(&ts)
            .await?
            .expect("a slice with logs to compact");
        table.compact(&ts).await?;

        let completed = Instant::completed(&ts, ActionType::Compaction);
        execute_rollback(&mut table, &InstantTime::new("004"), &completed, false).await?;

        // Left INFLIGHT, as an interrupted rollback would leave it.
        let inflight = Instant::inflight(&ts, ActionType::Compaction);
        assert_eq!(table.timeline().get(&ts, ActionType::Compaction), Some(&inflight));
        let bytes = table.timeline.read_details(&inflight).await?;
        assert_eq!(CompactionPlan::from_bytes(&bytes)?, plan);
        table.file_system_view().await?;

        // The pending compaction can be retried from its plan.
        let statuses = table.compact(&ts).await?;
        assert_eq!(statuses.len(), 1);
        assert!(table.timeline().is_completed(&ts));
        Ok(())
    }
}
