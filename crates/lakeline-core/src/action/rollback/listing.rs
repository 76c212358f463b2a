//! Listing-based rollback.
//!
//! Files of the rolled-back instant are found by name: base files written at
//! the instant and log files based on it. What gets deleted depends on the
//! action:
//!
//! | Target        | Deleted                                                  |
//! |---------------|----------------------------------------------------------|
//! | `commit`      | base and log files of the instant                        |
//! | `compaction`  | base files only if a later delta commit completed, else base and log files |
//! | `deltacommit` | base and log files of the instant, plus a rollback block appended to each updated file group |
//! | anything else | nothing                                                  |
//!
//! A delta commit also appended data blocks to log files of older slices.
//! Those files cannot be deleted, so the latest log of every file group the
//! instant updated receives a command block telling readers to skip the
//! instant's blocks.

use std::collections::BTreeSet;
use std::path::Path;

use log::{debug, info};

use super::delete_files;
use crate::action::{ProtocolResult, read_commit_metadata};
use crate::config::TableType;
use crate::fs_view::{
    FileSystemView, TableFileSystemView, list_partition_files, list_partition_paths, naming,
    rel_path_string,
};
use crate::log_format::{self, LogBlock};
use crate::metadata::RollbackStat;
use crate::timeline::{ActionType, ActiveTimeline, Instant, InstantTime};

pub(super) async fn rollback(
    active: &ActiveTimeline,
    table_type: TableType,
    target: &Instant,
    rollback_time: &InstantTime,
    parallelism: usize,
) -> ProtocolResult<Vec<RollbackStat>> {
    let ts = &target.timestamp;
    let (delete_logs, append_command_blocks) = match target.action {
        ActionType::Commit => (true, false),
        ActionType::Compaction => {
            let later_delta_commits = active
                .timeline()
                .completed_commits_timeline()
                .find_instants_after(ts)
                .filter_by_actions(&[ActionType::DeltaCommit]);
            (later_delta_commits.is_empty(), false)
        }
        ActionType::DeltaCommit => (true, true),
        other => {
            info!("Nothing to roll back by listing for {other} instant {ts}");
            return Ok(Vec::new());
        }
    };

    let location = active.location();
    let mut doomed = Vec::new();
    for partition in list_partition_paths(location).await? {
        let listing = list_partition_files(location, &partition).await?;
        doomed.extend(
            listing
                .base_files
                .iter()
                .filter(|b| b.instant_time == *ts)
                .map(|b| (partition.clone(), b.rel_path())),
        );
        if delete_logs {
            doomed.extend(
                listing
                    .log_files
                    .iter()
                    .filter(|l| l.base_instant_time == *ts)
                    .map(|l| (partition.clone(), l.rel_path())),
            );
        }
    }
    debug!("Listing rollback of {target} deletes {} file(s)", doomed.len());
    let mut stats = delete_files(location, doomed, parallelism).await;

    if append_command_blocks && table_type == TableType::MergeOnRead {
        stats.extend(append_rollback_blocks(active, target, rollback_time).await?);
    }
    Ok(stats)
}

/// Append a rollback command block to the latest log file of every file
/// group `target` updated. A group without a log file gets a new one.
async fn append_rollback_blocks(
    active: &ActiveTimeline,
    target: &Instant,
    rollback_time: &InstantTime,
) -> ProtocolResult<Vec<RollbackStat>> {
    let metadata = read_commit_metadata(active, target).await?;
    let updated: BTreeSet<(String, String)> = metadata
        .write_stats()
        .filter(|s| s.prev_commit.is_some())
        .map(|s| (s.partition_path.clone(), s.file_id.clone()))
        .collect();
    if updated.is_empty() {
        return Ok(Vec::new());
    }

    let view = TableFileSystemView::load(active).await?;
    let block = LogBlock::rollback(rollback_time.clone(), target.timestamp.clone());
    let mut stats = Vec::new();
    for (partition, file_id) in updated {
        let Some(slice) = view.latest_file_slice(&partition, &file_id) else {
            debug!("File group {partition}/{file_id} is gone; no rollback block needed");
            continue;
        };
        let log_path = match slice.latest_log_file() {
            Some(log) => log.rel_path(),
            None => rel_path_string(
                &partition,
                &naming::log_file_name(
                    &file_id,
                    &slice.base_instant_time,
                    1,
                    &naming::write_token(0, 0),
                ),
            ),
        };
        log_format::append_blocks(
            active.location(),
            Path::new(&log_path),
            std::slice::from_ref(&block),
        )
        .await?;
        debug!("Appended rollback block for {} to {log_path}", target.timestamp);

        let mut stat = RollbackStat::new(partition);
        stat.command_blocks_count.insert(log_path, 1);
        stats.push(stat);
    }
    Ok(stats)
}
