//! Marker-based rollback.
//!
//! Every data file an instant touched has a marker. CREATE and MERGE markers
//! name files the instant wrote from scratch, which are deleted. APPEND
//! markers name log files the instant appended to; a log file based on the
//! instant itself is deleted, any other gets a rollback command block.

use std::collections::BTreeSet;
use std::path::Path;

use log::{debug, warn};

use super::delete_files;
use crate::action::ProtocolResult;
use crate::fs_view::{naming, rel_path_string};
use crate::log_format::{self, LogBlock};
use crate::markers::{MarkerType, WriteMarkers};
use crate::metadata::RollbackStat;
use crate::storage::{self, TableLocation};
use crate::timeline::InstantTime;

pub(super) async fn rollback(
    location: &TableLocation,
    markers: &WriteMarkers,
    rollback_time: &InstantTime,
    target: &InstantTime,
    parallelism: usize,
) -> ProtocolResult<Vec<RollbackStat>> {
    let mut doomed = Vec::new();
    let mut appended = BTreeSet::new();
    for marker in markers.all_markers().await? {
        let path = rel_path_string(&marker.partition_path, &marker.data_file_name);
        match marker.marker_type {
            MarkerType::Create | MarkerType::Merge => doomed.push((marker.partition_path, path)),
            MarkerType::Append => match naming::parse_log_file_name(&marker.data_file_name) {
                Some(parsed) if parsed.base_instant_time == *target => {
                    doomed.push((marker.partition_path, path))
                }
                Some(_) => {
                    appended.insert((marker.partition_path, path));
                }
                None => warn!("Ignoring APPEND marker for non-log file {path}"),
            },
        }
    }
    debug!(
        "Marker rollback of {target}: {} file(s) to delete, {} log(s) to patch",
        doomed.len(),
        appended.len()
    );
    let mut stats = delete_files(location, doomed, parallelism).await;

    let block = LogBlock::rollback(rollback_time.clone(), target.clone());
    for (partition, path) in appended {
        if !storage::exists(location.storage(), Path::new(&path)).await? {
            debug!("Log file {path} was never written; skipping");
            continue;
        }
        log_format::append_blocks(location, Path::new(&path), std::slice::from_ref(&block))
            .await?;
        let mut stat = RollbackStat::new(partition);
        stat.command_blocks_count.insert(path, 1);
        stats.push(stat);
    }
    Ok(stats)
}
